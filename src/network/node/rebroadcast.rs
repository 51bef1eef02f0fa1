//! Timers owned by the node: transaction rebroadcast and delayed shutdown

use super::{Node, NodeEvent, RelayData, RelayMessage, Shared};
use crate::network::message::InvVect;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, sleep_until, Instant};

/// Delay before the first rebroadcast
pub const INITIAL_REBROADCAST_DELAY: Duration = Duration::from_secs(5 * 60);

/// Upper bound, in seconds, of the random delay between rebroadcasts
pub const MAX_REBROADCAST_DELAY_SECS: u64 = 1800;

pub(crate) enum RebroadcastMsg {
    Add(InvVect, RelayData),
    Remove(InvVect),
}

fn next_rebroadcast_delay() -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(1..=MAX_REBROADCAST_DELAY_SECS))
}

/// Re-announce inventory that has not been confirmed yet
pub(super) async fn rebroadcast_handler(
    shared: Arc<Shared>,
    mut modify: mpsc::UnboundedReceiver<RebroadcastMsg>,
) {
    let timer = sleep(INITIAL_REBROADCAST_DELAY);
    tokio::pin!(timer);
    let mut pending: HashMap<InvVect, RelayData> = HashMap::new();

    loop {
        tokio::select! {
            _ = shared.quit.cancelled() => break,
            msg = modify.recv() => match msg {
                Some(RebroadcastMsg::Add(inv, data)) => {
                    pending.insert(inv, data);
                }
                Some(RebroadcastMsg::Remove(inv)) => {
                    pending.remove(&inv);
                }
                None => break,
            },
            _ = &mut timer => {
                for (inv, data) in &pending {
                    shared.send_event(NodeEvent::RelayInventory(RelayMessage {
                        inv: *inv,
                        data: data.clone(),
                    }));
                }
                timer.as_mut().reset(Instant::now() + next_rebroadcast_delay());
            }
        }
    }

    while modify.try_recv().is_ok() {}
    log::trace!("Rebroadcast handler done");
}

/// How often to warn about an upcoming shutdown
pub fn dynamic_tick_duration(remaining: Duration) -> Duration {
    const SECOND: Duration = Duration::from_secs(1);
    const MINUTE: Duration = Duration::from_secs(60);

    if remaining <= 5 * SECOND {
        SECOND
    } else if remaining <= 15 * SECOND {
        5 * SECOND
    } else if remaining <= MINUTE {
        15 * SECOND
    } else if remaining <= 5 * MINUTE {
        MINUTE
    } else if remaining <= 15 * MINUTE {
        5 * MINUTE
    } else if remaining <= 60 * MINUTE {
        15 * MINUTE
    } else {
        60 * MINUTE
    }
}

pub(super) async fn shutdown_countdown(node: Node, duration: Duration) {
    let deadline = Instant::now() + duration;
    let mut remaining = duration;
    let mut tick_duration = dynamic_tick_duration(remaining);
    let mut ticker = interval_at(Instant::now() + tick_duration, tick_duration);

    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                node.stop();
                break;
            }
            _ = ticker.tick() => {
                remaining = remaining.saturating_sub(tick_duration);
                if remaining < Duration::from_secs(1) {
                    continue;
                }

                let new_duration = dynamic_tick_duration(remaining);
                if new_duration != tick_duration {
                    tick_duration = new_duration;
                    ticker = interval_at(Instant::now() + tick_duration, tick_duration);
                }
                log::warn!("Server shutdown in {:?}", remaining);
            }
        }
    }
}
