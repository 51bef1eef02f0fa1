//! Dynamic ban score
//!
//! A peer's misbehaviour score has two parts: a persistent component that
//! never decays and a transient component that halves every minute. Decay is
//! computed lazily from the time of the last increase, so reads never change
//! the stored value.

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// Time for the transient component to halve
pub const HALFLIFE: Duration = Duration::from_secs(60);

/// After this long without an increase the transient component is zero
pub const LIFETIME: Duration = Duration::from_secs(1800);

/// Decay multiplier after `secs` whole seconds
fn decay_factor(secs: u64) -> f64 {
    if secs >= LIFETIME.as_secs() {
        return 0.0;
    }
    0.5_f64.powf(secs as f64 / HALFLIFE.as_secs() as f64)
}

#[derive(Debug)]
struct ScoreState {
    last_update: Instant,
    transient: f64,
    persistent: u32,
}

impl ScoreState {
    fn int(&self, now: Instant) -> u32 {
        // A transient below one or a clock going backwards contributes nothing
        if self.transient < 1.0 {
            return self.persistent;
        }
        let dt = match now.checked_duration_since(self.last_update) {
            Some(dt) if dt <= LIFETIME => dt.as_secs(),
            _ => return self.persistent,
        };
        self.persistent.saturating_add((self.transient * decay_factor(dt)) as u32)
    }

    fn increase(&mut self, persistent: u32, transient: u32, now: Instant) -> u32 {
        self.persistent = self.persistent.saturating_add(persistent);
        let mut cur = 0.0;
        if transient > 0 {
            if self.transient > 0.0 {
                let dt = now
                    .checked_duration_since(self.last_update)
                    .unwrap_or_default()
                    .as_secs();
                cur = self.transient * decay_factor(dt);
            }
            self.transient = cur + transient as f64;
            self.last_update = now;
        }
        self.int(now)
    }
}

/// Thread-safe decaying ban score
#[derive(Debug)]
pub struct BanScore {
    state: Mutex<ScoreState>,
}

impl Default for BanScore {
    fn default() -> Self {
        Self::new()
    }
}

impl BanScore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScoreState {
                last_update: Instant::now(),
                transient: 0.0,
                persistent: 0,
            }),
        }
    }

    /// Current score
    pub fn score(&self) -> u32 {
        self.score_at(Instant::now())
    }

    /// Score as of `now`
    pub fn score_at(&self, now: Instant) -> u32 {
        self.state.lock().int(now)
    }

    /// Add to both components and return the resulting score
    pub fn increase(&self, persistent: u32, transient: u32) -> u32 {
        self.increase_at(persistent, transient, Instant::now())
    }

    pub fn increase_at(&self, persistent: u32, transient: u32, now: Instant) -> u32 {
        self.state.lock().increase(persistent, transient, now)
    }

    /// Clear both components
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.persistent = 0;
        state.transient = 0.0;
        state.last_update = Instant::now();
    }
}

impl fmt::Display for BanScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let now = Instant::now();
        write!(
            f,
            "persistent {} + transient {:.2} set {}s ago = {}",
            state.persistent,
            state.transient,
            now.saturating_duration_since(state.last_update).as_secs(),
            state.int(now)
        )
    }
}
