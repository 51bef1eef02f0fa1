//! Protocol message callbacks
//!
//! Each `on_*` method handles one message type received from the peer. They
//! run on the peer's own task, so a slow handler only stalls that peer.

use super::ServerPeer;
use crate::backend::Deployment;
use crate::core::{
    Block, BlockHeader, BloomFilter, MerkleBlock, Transaction, MAX_FILTER_ADD_DATA_SIZE,
    MAX_SATOSHI,
};
use crate::crypto::Hash;
use crate::network::message::{
    CFCheckptMessage, CFHeadersMessage, CFilterMessage, FilterLoadMessage, FilterType,
    GetCFCheckptMessage, GetCFiltersMessage, InvType, InvVect, LocatorMessage, Message,
    NetAddress, RejectCode, RejectMessage, ServiceFlags, VersionMessage, BIP0037_VERSION,
    MAX_ADDR_PER_MSG, MAX_BLOCKS_PER_MSG, MAX_CFHEADERS_PER_MSG, MAX_GETCFILTERS_REQ_RANGE,
    MAX_INV_PER_MSG, NET_ADDRESS_TIME_VERSION, SEND_HEADERS_VERSION,
};
use crate::network::node::NodeEvent;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Addresses further than this in the future get their timestamp reset
const MAX_ADDR_TIME_SKEW_MINS: i64 = 10;

/// Age given to addresses with a timestamp too far in the future
const PENALIZED_ADDR_AGE_DAYS: i64 = 5;

fn pick_noun(n: u32, singular: &'static str, plural: &'static str) -> &'static str {
    if n == 1 {
        singular
    } else {
        plural
    }
}

/// Sender handed back by a push that did not use it
type Unsent = Option<oneshot::Sender<()>>;

impl ServerPeer {
    /// Dispatch a message received after the handshake
    pub(crate) async fn handle_message(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::Version(_) | Message::VerAck => {
                log::debug!(
                    "Peer {} sent a duplicate {} message -- disconnecting",
                    self,
                    msg.command()
                );
                self.disconnect();
            }
            Message::SendAddrV2 => {
                log::debug!("Ignoring sendaddrv2 from {} after handshake", self);
            }
            Message::SendHeaders => self.on_send_headers(),
            Message::Ping(nonce) => self.queue_message(Message::Pong(nonce), None),
            Message::Pong(_) => {}
            Message::Reject(reject) => {
                log::debug!(
                    "Peer {} rejected {} ({:?}): {}",
                    self,
                    reject.command,
                    reject.code,
                    reject.reason
                );
            }
            Message::Inv(inv) => self.on_inv(inv),
            Message::GetData(inv) => self.on_get_data(inv).await,
            Message::NotFound(inv) => self.on_not_found(inv),
            Message::Tx(tx) => self.on_tx(tx).await,
            Message::Block(block) => self.on_block(block).await,
            Message::Headers(headers) => self.on_headers(headers),
            Message::GetHeaders(msg) => self.on_get_headers(msg),
            Message::GetBlocks(msg) => self.on_get_blocks(msg),
            Message::MemPool => self.on_mempool(),
            Message::Addr(addrs) => self.on_addr(addrs, "addr"),
            Message::AddrV2(addrs) => self.on_addr(addrs, "addrv2"),
            Message::GetAddr => self.on_get_addr(),
            Message::FilterLoad(msg) => self.on_filter_load(msg),
            Message::FilterAdd(data) => self.on_filter_add(data),
            Message::FilterClear => self.on_filter_clear(),
            Message::FeeFilter(fee) => self.on_fee_filter(fee),
            Message::GetCFilters(msg) => self.on_get_cfilters(msg),
            Message::GetCFHeaders(msg) => self.on_get_cfheaders(msg),
            Message::GetCFCheckpt(msg) => self.on_get_cfcheckpt(msg),
            Message::MerkleBlock(_)
            | Message::CFilter(_)
            | Message::CFHeaders(_)
            | Message::CFCheckpt(_) => {
                log::debug!("Ignoring unrequested {} from {}", msg.command(), self);
            }
        }
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Vet the remote version; a returned reject ends the connection
    pub(crate) fn on_version(&self, msg: &VersionMessage) -> Option<RejectMessage> {
        let shared = &self.shared;
        let simnet = shared.config.network.is_simnet();

        if !self.is_inbound() && !simnet {
            shared
                .backend
                .addr_manager
                .set_services(&self.na(), msg.services);
        }

        // Negotiation rejects these once the callback returns
        if msg.protocol_version < crate::network::message::MIN_PROTOCOL_VERSION {
            return None;
        }

        if !self.is_inbound() && !msg.services.contains(ServiceFlags::NETWORK) {
            let missing = ServiceFlags::NETWORK - msg.services;
            log::debug!(
                "Rejecting peer {} with services {:?} due to not providing desired services {:?}",
                self,
                msg.services,
                missing
            );
            return Some(RejectMessage {
                command: "version".to_string(),
                code: RejectCode::NonStandard,
                reason: format!("required services {:#x} not offered", missing.bits()),
            });
        }

        if !self.is_inbound() && !simnet {
            match shared.backend.chain.is_deployment_active(Deployment::Segwit) {
                Ok(true) if !self.is_witness_enabled() => {
                    log::info!(
                        "Disconnecting non-segwit peer {}, isn't segwit enabled and we need more segwit enabled peers",
                        self
                    );
                    self.disconnect();
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("Unable to query for segwit soft-fork state: {}", e);
                    return None;
                }
            }
        }

        self.set_relay_tx_disabled(msg.disable_relay_tx);
        None
    }

    /// The handshake is complete; let the orchestrator take over
    pub(crate) fn on_verack(self: &Arc<Self>) {
        self.shared.send_event(NodeEvent::NewPeer(self.clone()));
    }

    fn on_send_headers(&self) {
        if self.protocol_version() < SEND_HEADERS_VERSION {
            log::debug!("Peer {} sent sendheaders before it is supported", self);
            self.disconnect();
            return;
        }
        self.set_prefers_headers();
    }

    // =========================================================================
    // Blocks and transactions
    // =========================================================================

    async fn wait_processed(&self, processed: oneshot::Receiver<()>) {
        tokio::select! {
            _ = processed => {}
            _ = self.quit_token().cancelled() => {}
        }
    }

    async fn on_tx(&self, tx: Transaction) {
        if self.shared.config.blocks_only {
            log::trace!("Ignoring tx {} from {} - blocksonly enabled", tx.txid(), self);
            return;
        }

        self.add_known_inventory(InvVect::tx(tx.txid()));

        // Validate one transaction from this peer at a time
        let (processed_tx, processed_rx) = oneshot::channel();
        self.shared
            .backend
            .sync_manager
            .queue_tx(tx, self.id(), processed_tx);
        self.wait_processed(processed_rx).await;
    }

    async fn on_block(&self, block: Block) {
        self.add_known_inventory(InvVect::block(block.block_hash()));

        let (processed_tx, processed_rx) = oneshot::channel();
        self.shared
            .backend
            .sync_manager
            .queue_block(block, self.id(), processed_tx);
        self.wait_processed(processed_rx).await;
    }

    fn on_headers(&self, headers: Vec<BlockHeader>) {
        self.shared
            .backend
            .sync_manager
            .queue_headers(headers, self.id());
    }

    fn on_inv(&self, inv: Vec<InvVect>) {
        if inv.len() > MAX_INV_PER_MSG {
            log::debug!("Peer {} sent {} inventory vectors -- disconnecting", self, inv.len());
            self.disconnect();
            return;
        }

        let blocks_only = self.shared.config.blocks_only;
        let mut forward = Vec::with_capacity(inv.len());
        for iv in inv {
            match iv.inv_type {
                InvType::Tx | InvType::WitnessTx if blocks_only => {
                    log::trace!("Ignoring tx {} in inv from {} -- blocksonly enabled", iv.hash, self);
                    if self.protocol_version() >= BIP0037_VERSION {
                        log::info!("Peer {} is announcing transactions -- disconnecting", self);
                        self.disconnect();
                        return;
                    }
                    continue;
                }
                InvType::Block | InvType::WitnessBlock => {
                    self.update_last_announced_block(Some(iv.hash));
                }
                _ => {}
            }
            self.add_known_inventory(iv);
            forward.push(iv);
        }

        if !forward.is_empty() {
            self.shared
                .backend
                .sync_manager
                .queue_inv(forward, self.id());
        }
    }

    fn on_not_found(&self, inv: Vec<InvVect>) {
        if !self.is_connected() {
            return;
        }

        let mut num_blocks = 0u32;
        let mut num_txns = 0u32;
        for iv in &inv {
            match iv.inv_type {
                InvType::Block | InvType::WitnessBlock => num_blocks += 1,
                InvType::Tx | InvType::WitnessTx => num_txns += 1,
                other => {
                    log::debug!("Invalid inv type '{:?}' in notfound message from {}", other, self);
                    self.disconnect();
                    return;
                }
            }
        }

        if num_blocks > 0 {
            let reason = format!(
                "{} {} not found",
                num_blocks,
                pick_noun(num_blocks, "block", "blocks")
            );
            if self.add_ban_score(20 * num_blocks, 0, &reason) {
                return;
            }
        }
        if num_txns > 0 {
            let reason = format!(
                "{} {} not found",
                num_txns,
                pick_noun(num_txns, "transaction", "transactions")
            );
            if self.add_ban_score(0, 10 * num_txns, &reason) {
                return;
            }
        }

        self.shared
            .backend
            .sync_manager
            .queue_not_found(inv, self.id());
    }

    fn on_mempool(&self) {
        if !self.shared.services.contains(ServiceFlags::BLOOM) {
            log::debug!(
                "Peer {} sent mempool request with bloom filtering disabled -- disconnecting",
                self
            );
            self.disconnect();
            return;
        }

        // Decaying score so repeated requests eventually ban
        if self.add_ban_score(0, 33, "mempool") {
            return;
        }

        let descs = self.shared.backend.tx_pool.tx_descs();
        let mut inv = Vec::with_capacity(descs.len().min(MAX_INV_PER_MSG));
        for desc in &descs {
            if self.filter_matches(&desc.tx).unwrap_or(true) {
                inv.push(InvVect::tx(desc.tx.txid()));
                if inv.len() + 1 > MAX_INV_PER_MSG {
                    break;
                }
            }
        }

        if !inv.is_empty() {
            self.queue_message(Message::Inv(inv), None);
        }
    }

    // =========================================================================
    // getdata
    // =========================================================================

    /// Serve requested inventory, pipelining fetches with earlier sends
    async fn on_get_data(&self, inv_list: Vec<InvVect>) {
        let length = inv_list.len();
        // Large requests cost more; the transient part decays quickly
        let transient = (length * 99 / MAX_INV_PER_MSG) as u32;
        if self.add_ban_score(0, transient, "getdata") {
            return;
        }
        if length == 0 {
            return;
        }

        let mut not_found = Vec::new();
        let mut num_added = 0usize;
        let (done_tx, done_rx) = oneshot::channel();
        let mut done_tx = Some(done_tx);
        let mut wait: Option<oneshot::Receiver<()>> = None;

        for (i, iv) in inv_list.iter().enumerate() {
            if iv.inv_type == InvType::Error {
                log::warn!("Unknown type in inventory request {:?}", iv.inv_type);
                continue;
            }

            let mut next_wait = None;
            let signal = if i == length - 1 && not_found.is_empty() {
                done_tx.take()
            } else if (i + 1) % 3 == 0 {
                let (tx, rx) = oneshot::channel();
                next_wait = Some(rx);
                Some(tx)
            } else {
                None
            };

            let result = match iv.inv_type {
                InvType::Tx | InvType::WitnessTx => {
                    self.push_tx_msg(&iv.hash, signal, wait.take()).await
                }
                InvType::Block | InvType::WitnessBlock => {
                    self.push_block_msg(&iv.hash, signal, wait.take()).await
                }
                InvType::FilteredBlock | InvType::FilteredWitnessBlock => {
                    self.push_merkle_block_msg(&iv.hash, signal, wait.take()).await
                }
                InvType::Error => Ok(()),
            };

            if let Err(unsent) = result {
                not_found.push(*iv);
                // The final signal is reused for the notfound reply
                if let Some(unsent) = unsent {
                    if i == length - 1 && done_tx.is_none() && next_wait.is_none() {
                        done_tx = Some(unsent);
                    } else {
                        let _ = unsent.send(());
                    }
                }
            }

            num_added += 1;
            wait = next_wait;
        }

        if !not_found.is_empty() {
            self.queue_message(Message::NotFound(not_found), done_tx.take());
        }
        drop(done_tx);

        // Hold off on further requests until this batch is written
        if num_added > 0 {
            tokio::select! {
                _ = done_rx => {}
                _ = self.quit_token().cancelled() => {}
            }
        }
    }

    async fn wait_previous(wait: Option<oneshot::Receiver<()>>) {
        if let Some(wait) = wait {
            let _ = wait.await;
        }
    }

    async fn push_tx_msg(
        &self,
        hash: &Hash,
        done: Option<oneshot::Sender<()>>,
        wait: Option<oneshot::Receiver<()>>,
    ) -> Result<(), Unsent> {
        let tx = match self.shared.backend.tx_pool.fetch_transaction(hash) {
            Ok(tx) => tx,
            Err(e) => {
                log::trace!("Unable to fetch tx {} from transaction pool: {}", hash, e);
                return Err(done);
            }
        };

        Self::wait_previous(wait).await;
        self.queue_message(Message::Tx(tx), done);
        Ok(())
    }

    async fn push_block_msg(
        &self,
        hash: &Hash,
        done: Option<oneshot::Sender<()>>,
        wait: Option<oneshot::Receiver<()>>,
    ) -> Result<(), Unsent> {
        let block = match self.shared.backend.chain.block_by_hash(hash) {
            Ok(block) => block,
            Err(e) => {
                log::trace!("Unable to fetch requested block {}: {}", hash, e);
                return Err(done);
            }
        };

        Self::wait_previous(wait).await;

        // The final block of an oversized getblocks reply is followed by an
        // inv for the tip so the peer asks for the next batch
        if self.take_continue_hash_if(hash) {
            self.queue_message(Message::Block(block), None);
            let best = self.shared.backend.chain.best_snapshot();
            self.queue_message(Message::Inv(vec![InvVect::block(best.hash)]), done);
        } else {
            self.queue_message(Message::Block(block), done);
        }
        Ok(())
    }

    async fn push_merkle_block_msg(
        &self,
        hash: &Hash,
        done: Option<oneshot::Sender<()>>,
        wait: Option<oneshot::Receiver<()>>,
    ) -> Result<(), Unsent> {
        if !self.is_filter_loaded() {
            if let Some(done) = done {
                let _ = done.send(());
            }
            return Ok(());
        }

        let block = match self.shared.backend.chain.block_by_hash(hash) {
            Ok(block) => block,
            Err(e) => {
                log::trace!("Unable to fetch requested block {}: {}", hash, e);
                return Err(done);
            }
        };

        // Matched one transaction at a time so relay never waits on the
        // filter for a whole block
        let matches: Option<Vec<bool>> = block
            .transactions
            .iter()
            .map(|tx| self.filter_matches(tx))
            .collect();
        let Some(matches) = matches else {
            // Filter cleared while the block was being matched
            if let Some(done) = done {
                let _ = done.send(());
            }
            return Ok(());
        };

        let (merkle, matched) = MerkleBlock::from_matches(&block, &matches);

        Self::wait_previous(wait).await;

        if matched.is_empty() {
            self.queue_message(Message::MerkleBlock(merkle), done);
            return Ok(());
        }

        self.queue_message(Message::MerkleBlock(merkle), None);
        let mut done = done;
        let last = matched.len() - 1;
        for (i, index) in matched.into_iter().enumerate() {
            let signal = if i == last { done.take() } else { None };
            if let Some(tx) = block.transactions.get(index) {
                self.queue_message(Message::Tx(tx.clone()), signal);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Chain queries
    // =========================================================================

    fn on_get_blocks(&self, msg: LocatorMessage) {
        let hashes = self.shared.backend.chain.locate_blocks(
            &msg.locator_hashes,
            &msg.hash_stop,
            MAX_BLOCKS_PER_MSG,
        );
        if hashes.is_empty() {
            return;
        }

        if hashes.len() == MAX_BLOCKS_PER_MSG {
            self.set_continue_hash(hashes.last().copied());
        }
        let inv = hashes.into_iter().map(InvVect::block).collect();
        self.queue_message(Message::Inv(inv), None);
    }

    fn on_get_headers(&self, msg: LocatorMessage) {
        let backend = &self.shared.backend;
        if !backend.sync_manager.is_current() {
            return;
        }

        let headers = backend
            .chain
            .locate_headers(&msg.locator_hashes, &msg.hash_stop);
        self.queue_message(Message::Headers(headers), None);
    }

    fn serves_filter_type(&self, filter_type: FilterType) -> bool {
        if filter_type != FilterType::REGULAR {
            log::debug!("Filter request for unknown filter: {}", filter_type);
            return false;
        }
        true
    }

    fn on_get_cfilters(&self, msg: GetCFiltersMessage) {
        let backend = &self.shared.backend;
        if !backend.sync_manager.is_current() || !self.serves_filter_type(msg.filter_type) {
            return;
        }

        let Ok(start_height) = i32::try_from(msg.start_height) else {
            log::debug!("Invalid getcfilters start height {}", msg.start_height);
            return;
        };

        let hashes = match backend.chain.height_to_hash_range(
            start_height,
            &msg.stop_hash,
            MAX_GETCFILTERS_REQ_RANGE,
        ) {
            Ok(hashes) => hashes,
            Err(e) => {
                log::debug!("Invalid getcfilters request: {}", e);
                return;
            }
        };

        let filters = match backend.chain.filters_by_block_hashes(&hashes, msg.filter_type) {
            Ok(filters) => filters,
            Err(e) => {
                log::error!("Error retrieving cfilters: {}", e);
                return;
            }
        };

        for (block_hash, filter) in hashes.into_iter().zip(filters) {
            let Some(data) = filter.filter(|data| !data.is_empty()) else {
                log::warn!("Could not obtain cfilter for {}", block_hash);
                return;
            };
            self.queue_message(
                Message::CFilter(CFilterMessage {
                    filter_type: msg.filter_type,
                    block_hash,
                    data,
                }),
                None,
            );
        }
    }

    fn on_get_cfheaders(&self, msg: GetCFiltersMessage) {
        let backend = &self.shared.backend;
        if !backend.sync_manager.is_current() || !self.serves_filter_type(msg.filter_type) {
            return;
        }

        // Fetch the predecessor too so the previous filter header can be set
        let Ok(mut start_height) = i32::try_from(msg.start_height) else {
            log::debug!("Invalid getcfheaders start height {}", msg.start_height);
            return;
        };
        let mut max_results = MAX_CFHEADERS_PER_MSG;
        if start_height > 0 {
            start_height -= 1;
            max_results += 1;
        }

        let mut hashes =
            match backend
                .chain
                .height_to_hash_range(start_height, &msg.stop_hash, max_results)
            {
                Ok(hashes) => hashes,
                Err(e) => {
                    log::debug!("Invalid getcfheaders request: {}", e);
                    return;
                }
            };
        if hashes.is_empty() {
            log::debug!("No results for getcfheaders request");
            return;
        }

        let mut filter_hashes =
            match backend
                .chain
                .filter_hashes_by_block_hashes(&hashes, msg.filter_type)
            {
                Ok(filter_hashes) => filter_hashes,
                Err(e) => {
                    log::error!("Error retrieving cfilter hashes: {}", e);
                    return;
                }
            };

        let mut prev_filter_header = Hash::ZERO;
        if msg.start_height > 0 {
            let prev_block = hashes[0];
            match backend
                .chain
                .filter_header_by_block_hash(&prev_block, msg.filter_type)
            {
                Ok(Some(header)) => prev_filter_header = header,
                Ok(None) => {
                    log::warn!("Could not obtain CF header for {}", prev_block);
                    return;
                }
                Err(e) => {
                    log::error!("Error retrieving CF header: {}", e);
                    return;
                }
            }
            hashes.remove(0);
            if !filter_hashes.is_empty() {
                filter_hashes.remove(0);
            }
        }

        let mut headers = Vec::with_capacity(filter_hashes.len());
        for (block_hash, filter_hash) in hashes.iter().zip(filter_hashes) {
            let Some(filter_hash) = filter_hash else {
                log::warn!("Could not obtain CF hash for {}", block_hash);
                return;
            };
            headers.push(filter_hash);
        }

        self.queue_message(
            Message::CFHeaders(CFHeadersMessage {
                filter_type: msg.filter_type,
                stop_hash: msg.stop_hash,
                prev_filter_header,
                filter_hashes: headers,
            }),
            None,
        );
    }

    fn on_get_cfcheckpt(&self, msg: GetCFCheckptMessage) {
        let shared = &self.shared;
        if !shared.backend.sync_manager.is_current() || !self.serves_filter_type(msg.filter_type)
        {
            return;
        }

        let filter_headers = match shared.cf_checkpoints.checkpoints(
            shared.backend.chain.as_ref(),
            msg.filter_type,
            &msg.stop_hash,
        ) {
            Ok(headers) => headers,
            Err(e) => {
                log::debug!("Invalid getcfcheckpt request: {}", e);
                return;
            }
        };

        self.queue_message(
            Message::CFCheckpt(CFCheckptMessage {
                filter_type: msg.filter_type,
                stop_hash: msg.stop_hash,
                filter_headers,
            }),
            None,
        );
    }

    // =========================================================================
    // Filters
    // =========================================================================

    fn on_filter_load(&self, msg: FilterLoadMessage) {
        if !self.enforce_node_bloom_flag("filterload") {
            return;
        }

        let Some(filter) = BloomFilter::new(msg.filter, msg.hash_funcs, msg.tweak, msg.flags)
        else {
            log::debug!("Peer {} sent an oversized filterload -- disconnecting", self);
            self.disconnect();
            return;
        };

        self.set_relay_tx_disabled(false);
        *self.filter().lock() = Some(filter);
    }

    fn on_filter_add(&self, data: Vec<u8>) {
        if !self.enforce_node_bloom_flag("filteradd") {
            return;
        }
        if data.len() > MAX_FILTER_ADD_DATA_SIZE {
            log::debug!("Peer {} sent {} bytes of filteradd data -- disconnecting", self, data.len());
            self.disconnect();
            return;
        }

        let loaded = match self.filter().lock().as_mut() {
            Some(filter) => {
                filter.insert(&data);
                true
            }
            None => false,
        };
        if !loaded {
            log::debug!(
                "{} sent a filteradd request with no filter loaded -- disconnecting",
                self
            );
            self.disconnect();
        }
    }

    fn on_filter_clear(&self) {
        if !self.enforce_node_bloom_flag("filterclear") {
            return;
        }

        if self.filter().lock().take().is_none() {
            log::debug!(
                "{} sent a filterclear request with no filter loaded -- disconnecting",
                self
            );
            self.disconnect();
        }
    }

    fn on_fee_filter(&self, min_fee: i64) {
        if !(0..=MAX_SATOSHI).contains(&min_fee) {
            log::debug!("Peer {} sent an invalid feefilter '{}' -- disconnecting", self, min_fee);
            self.disconnect();
            return;
        }
        self.set_fee_filter(min_fee);
    }

    // =========================================================================
    // Addresses
    // =========================================================================

    fn on_get_addr(&self) {
        // Keeps simnet from turning into a public test network
        if self.shared.config.network.is_simnet() {
            return;
        }

        if !self.is_inbound() {
            log::debug!("Ignoring getaddr request from outbound peer {}", self);
            return;
        }

        if !self.mark_sent_addrs() {
            log::debug!("Ignoring repeated getaddr request from peer {}", self);
            return;
        }

        let addresses = self.shared.backend.addr_manager.address_cache();
        self.push_addr_msg(&addresses);
    }

    fn on_addr(&self, mut addrs: Vec<NetAddress>, command: &str) {
        if self.shared.config.network.is_simnet() {
            return;
        }

        // Old style addresses carry no timestamp
        if self.protocol_version() < NET_ADDRESS_TIME_VERSION {
            return;
        }

        if addrs.is_empty() {
            log::error!("Command [{}] from {} does not contain any addresses", command, self);
            self.disconnect();
            return;
        }
        if addrs.len() > MAX_ADDR_PER_MSG {
            log::debug!(
                "Command [{}] from {} has {} addresses -- disconnecting",
                command,
                self,
                addrs.len()
            );
            self.disconnect();
            return;
        }

        let now = Utc::now();
        for na in &mut addrs {
            if !self.is_connected() {
                return;
            }
            if na.timestamp > now + ChronoDuration::minutes(MAX_ADDR_TIME_SKEW_MINS) {
                na.timestamp = now - ChronoDuration::days(PENALIZED_ADDR_AGE_DAYS);
            }
        }
        self.add_known_addresses(&addrs);

        self.shared
            .backend
            .addr_manager
            .add_addresses(addrs, &self.na());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AddressManager, ChainProvider};
    use crate::core::{BloomUpdate, OutPoint, TxDesc, TxIn, TxOut, SEQUENCE_FINAL, TX_VERSION};
    use crate::network::config::{Network, NodeConfig};
    use crate::network::message::NetHost;
    use crate::network::peer::Outgoing;
    use crate::test_utils::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn routable_addrs(count: u8) -> Vec<NetAddress> {
        (1..=count)
            .map(|i| {
                NetAddress::new(
                    NetHost::Ipv4(Ipv4Addr::new(50, 1, 1, i)),
                    8333,
                    ServiceFlags::NETWORK,
                )
            })
            .collect()
    }

    fn locator(hashes: Vec<Hash>) -> LocatorMessage {
        LocatorMessage {
            protocol_version: crate::network::message::PROTOCOL_VERSION,
            locator_hashes: hashes,
            hash_stop: Hash::ZERO,
        }
    }

    // =========================================================================
    // Misbehaviour
    // =========================================================================

    #[tokio::test]
    async fn test_not_found_ban_score() {
        let (node, backend) = test_node(test_config());
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);

        let inv = vec![
            InvVect::block(Hash::digest(b"b1")),
            InvVect::block(Hash::digest(b"b2")),
            InvVect::block(Hash::digest(b"b3")),
            InvVect::tx(Hash::digest(b"t1")),
            InvVect::tx(Hash::digest(b"t2")),
        ];
        peer.handle_message(Message::NotFound(inv.clone())).await;

        assert_eq!(peer.ban_score(), 80);
        assert!(peer.is_connected());
        assert_eq!(
            backend.sync.calls(),
            vec![SyncCall::NotFound(inv, peer.id())]
        );
    }

    #[tokio::test]
    async fn test_not_found_with_bad_type_disconnects() {
        let (node, backend) = test_node(test_config());
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);

        let inv = vec![InvVect::new(InvType::Error, Hash::digest(b"e"))];
        peer.handle_message(Message::NotFound(inv)).await;

        assert!(!peer.is_connected());
        assert!(backend.sync.calls().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_version_disconnects() {
        let (node, _backend) = test_node(test_config());
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);

        peer.handle_message(Message::VerAck).await;
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (node, _backend) = test_node(test_config());
        let (peer, mut rx) = test_peer(&node, "20.0.0.1:5000", true);

        peer.handle_message(Message::Ping(42)).await;
        assert_eq!(drain_messages(&mut rx), vec![Message::Pong(42)]);
    }

    #[tokio::test]
    async fn test_send_headers() {
        let (node, _backend) = test_node(test_config());
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);
        peer.handle_message(Message::SendHeaders).await;
        assert!(peer.prefers_headers());

        let (old, _rx) = test_peer(&node, "20.0.0.2:5000", true);
        old.set_negotiated(SEND_HEADERS_VERSION - 1, ServiceFlags::NETWORK, String::new(), 0);
        old.handle_message(Message::SendHeaders).await;
        assert!(!old.prefers_headers());
        assert!(!old.is_connected());
    }

    // =========================================================================
    // Blocks and transactions
    // =========================================================================

    #[tokio::test]
    async fn test_tx_waits_until_processed() {
        let (node, backend) = test_node(test_config());
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);
        backend.sync.set_hold(true);

        let tx = sample_tx(1);
        let txid = tx.txid();
        let task = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.handle_message(Message::Tx(tx)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        assert_eq!(backend.sync.calls(), vec![SyncCall::Tx(txid, peer.id())]);
        assert!(peer.has_known_inventory(&InvVect::tx(txid)));

        backend.sync.release();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_block_wait_ends_on_disconnect() {
        let (node, backend) = test_node(test_config());
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);
        backend.sync.set_hold(true);

        let block = backend.chain.block_by_hash(&backend.chain.best_tip()).unwrap();
        let task = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.handle_message(Message::Block(block)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        peer.disconnect();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocks_only_ignores_transactions() {
        let config = NodeConfig {
            blocks_only: true,
            ..test_config()
        };
        let (node, backend) = test_node(config);
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);

        peer.handle_message(Message::Tx(sample_tx(1))).await;
        assert!(backend.sync.calls().is_empty());
        assert!(peer.is_connected());

        // Announcing transactions breaks the blocks-only contract
        let inv = vec![InvVect::tx(sample_tx(2).txid())];
        peer.handle_message(Message::Inv(inv)).await;
        assert!(!peer.is_connected());
        assert!(backend.sync.calls().is_empty());
    }

    #[tokio::test]
    async fn test_inv_records_announced_block() {
        let (node, backend) = test_node(test_config());
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);

        let block = Hash::digest(b"new block");
        let tx = sample_tx(1).txid();
        let inv = vec![InvVect::tx(tx), InvVect::block(block)];
        peer.handle_message(Message::Inv(inv.clone())).await;

        assert_eq!(peer.last_announced_block(), Some(block));
        assert!(peer.has_known_inventory(&InvVect::block(block)));
        assert!(peer.has_known_inventory(&InvVect::tx(tx)));
        assert_eq!(backend.sync.calls(), vec![SyncCall::Inv(inv, peer.id())]);
    }

    #[tokio::test]
    async fn test_mempool_request() {
        let (node, backend) = test_node(test_config());
        let (peer, mut rx) = test_peer(&node, "20.0.0.1:5000", true);

        let first = TxDesc::new(sample_tx(1), 1000, 10);
        let second = TxDesc::new(sample_tx(2), 1000, 10);
        backend.pool.add(first.clone()).unwrap();
        backend.pool.add(second.clone()).unwrap();

        peer.handle_message(Message::MemPool).await;
        assert_eq!(peer.ban_score(), 33);
        match drain_messages(&mut rx).as_slice() {
            [Message::Inv(inv)] => {
                assert_eq!(inv.len(), 2);
                assert!(inv.contains(&InvVect::tx(first.tx.txid())));
                assert!(inv.contains(&InvVect::tx(second.tx.txid())));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mempool_without_bloom_service_disconnects() {
        let config = NodeConfig {
            no_peer_bloom_filters: true,
            ..test_config()
        };
        let (node, _backend) = test_node(config);
        let (peer, mut rx) = test_peer(&node, "20.0.0.1:5000", true);

        peer.handle_message(Message::MemPool).await;
        assert!(!peer.is_connected());
        assert!(drain_messages(&mut rx).is_empty());
    }

    // =========================================================================
    // getdata
    // =========================================================================

    #[tokio::test]
    async fn test_get_data_serves_found_items_then_not_found() {
        let (node, backend) = test_node(test_config());
        let (peer, rx) = test_peer(&node, "20.0.0.1:5000", true);
        let mut sent = auto_ack(rx);

        let tx = sample_tx(1);
        backend.pool.add(TxDesc::new(tx.clone(), 1000, 10)).unwrap();
        let missing = InvVect::tx(Hash::digest(b"missing"));
        let tip = backend.chain.best_tip();
        let block = backend.chain.block_by_hash(&tip).unwrap();

        let request = vec![InvVect::tx(tx.txid()), missing, InvVect::block(tip)];
        tokio::time::timeout(
            Duration::from_secs(5),
            peer.handle_message(Message::GetData(request)),
        )
        .await
        .unwrap();

        assert_eq!(sent.recv().await, Some(Message::Tx(tx)));
        assert_eq!(sent.recv().await, Some(Message::Block(block)));
        assert_eq!(sent.recv().await, Some(Message::NotFound(vec![missing])));
    }

    async fn next_outgoing(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outgoing>,
    ) -> (Message, Option<oneshot::Sender<()>>) {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Outgoing::Message(msg, done))) => (msg, done),
            other => panic!("expected a queued message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_data_sends_in_order_and_waits_for_final_write() {
        let (node, backend) = test_node(test_config());
        let (peer, mut rx) = test_peer(&node, "20.0.0.1:5000", true);

        let txs: Vec<Transaction> = (0..8u8).map(sample_tx).collect();
        for tx in &txs {
            backend.pool.add(TxDesc::new(tx.clone(), 1000, 10)).unwrap();
        }
        let request: Vec<InvVect> = txs.iter().map(|tx| InvVect::tx(tx.txid())).collect();

        let handler = tokio::spawn({
            let peer = peer.clone();
            async move { peer.handle_message(Message::GetData(request)).await }
        });

        // Every third send gates the next fetch; the last one ends the batch
        for batch in [0..3, 3..6, 6..8] {
            let end = batch.end;
            for i in batch {
                let (msg, done) = next_outgoing(&mut rx).await;
                assert_eq!(msg, Message::Tx(txs[i].clone()));
                if i + 1 == end {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    assert!(rx.try_recv().is_err());
                    assert!(!handler.is_finished());
                    done.expect("batch boundary carries a write signal")
                        .send(())
                        .unwrap();
                } else {
                    assert!(done.is_none());
                }
            }
        }

        tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer.ban_score(), 0);
    }

    #[tokio::test]
    async fn test_get_data_ban_score_scales_with_request_size() {
        let (node, _backend) = test_node(test_config());
        let (peer, rx) = test_peer(&node, "20.0.0.1:5000", true);
        let mut sent = auto_ack(rx);

        let request: Vec<InvVect> = (0..MAX_INV_PER_MSG as u32)
            .map(|i| InvVect::tx(Hash::digest(&i.to_le_bytes())))
            .collect();
        tokio::time::timeout(
            Duration::from_secs(30),
            peer.handle_message(Message::GetData(request)),
        )
        .await
        .unwrap();

        match sent.recv().await {
            Some(Message::NotFound(inv)) => assert_eq!(inv.len(), MAX_INV_PER_MSG),
            other => panic!("unexpected reply {:?}", other),
        }
        let score = peer.ban_score();
        assert!((97..=99).contains(&score), "score {}", score);
        assert!(peer.is_connected());

        // Transient, so one half-life later about half remains
        let later = peer
            .ban_score
            .score_at(std::time::Instant::now() + crate::network::banscore::HALFLIFE);
        assert!((47..=49).contains(&later), "score {}", later);
    }

    #[tokio::test]
    async fn test_get_data_all_missing() {
        let (node, _backend) = test_node(test_config());
        let (peer, rx) = test_peer(&node, "20.0.0.1:5000", true);
        let mut sent = auto_ack(rx);

        let request: Vec<InvVect> = (0..4u8)
            .map(|i| InvVect::block(Hash::digest(&[i])))
            .collect();
        tokio::time::timeout(
            Duration::from_secs(5),
            peer.handle_message(Message::GetData(request.clone())),
        )
        .await
        .unwrap();

        assert_eq!(sent.recv().await, Some(Message::NotFound(request)));
    }

    #[tokio::test]
    async fn test_get_blocks_continues_after_batch() {
        let (node, backend) = test_node_at(test_config(), 600);
        let (peer, rx) = test_peer(&node, "20.0.0.1:5000", true);
        let mut sent = auto_ack(rx);

        let genesis = backend.chain.hash_at_height(0).unwrap();
        peer.handle_message(Message::GetBlocks(locator(vec![genesis])))
            .await;

        let batch_end = backend.chain.hash_at_height(500).unwrap();
        match sent.recv().await {
            Some(Message::Inv(inv)) => {
                assert_eq!(inv.len(), MAX_BLOCKS_PER_MSG);
                assert_eq!(inv.last(), Some(&InvVect::block(batch_end)));
            }
            other => panic!("unexpected reply {:?}", other),
        }

        peer.handle_message(Message::GetData(vec![InvVect::block(batch_end)]))
            .await;
        assert!(matches!(sent.recv().await, Some(Message::Block(_))));
        assert_eq!(
            sent.recv().await,
            Some(Message::Inv(vec![InvVect::block(backend.chain.best_tip())]))
        );
        assert_eq!(peer.continue_hash(), None);
    }

    #[tokio::test]
    async fn test_filtered_block_sends_matching_transactions() {
        let (node, backend) = test_node(test_config());
        let (peer, rx) = test_peer(&node, "20.0.0.1:5000", true);
        let mut sent = auto_ack(rx);

        let tip = backend.chain.best_tip();
        let timestamp = backend.chain.header_by_hash(&tip).unwrap().timestamp + 600;
        let matching = sample_tx(1);
        let block = Block::new(tip, timestamp, vec![matching.clone(), sample_tx(2)]);
        let hash = block.block_hash();
        backend.chain.add_block(block).unwrap();

        // Without a filter nothing is sent
        peer.handle_message(Message::GetData(vec![InvVect::new(InvType::FilteredBlock, hash)]))
            .await;

        let mut filter = BloomFilter::for_elements(10, 0.0001, 0, BloomUpdate::None);
        filter.insert(matching.txid().as_bytes());
        *peer.filter().lock() = Some(filter);

        peer.handle_message(Message::GetData(vec![InvVect::new(InvType::FilteredBlock, hash)]))
            .await;
        assert!(matches!(sent.recv().await, Some(Message::MerkleBlock(_))));
        assert_eq!(sent.recv().await, Some(Message::Tx(matching)));
    }

    fn spend(previous_outpoint: OutPoint, pk_script: Vec<u8>) -> Transaction {
        Transaction {
            version: TX_VERSION,
            inputs: vec![TxIn {
                previous_outpoint,
                signature_script: vec![0x01, 0x08],
                witness: vec![],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOut {
                value: 5_000,
                pk_script,
            }],
            lock_time: 0,
        }
    }

    #[tokio::test]
    async fn test_filtered_block_updates_filter_between_transactions() {
        let (node, backend) = test_node(test_config());
        let (peer, rx) = test_peer(&node, "20.0.0.1:5000", true);
        let mut sent = auto_ack(rx);

        let key = [7u8; 33];
        let mut pay_to_key = vec![33];
        pay_to_key.extend_from_slice(&key);
        pay_to_key.push(0xac);
        let funding = spend(OutPoint::new(Hash::digest(b"coinbase"), 0), pay_to_key);
        let spending = spend(OutPoint::new(funding.txid(), 0), vec![0x51]);

        let tip = backend.chain.best_tip();
        let timestamp = backend.chain.header_by_hash(&tip).unwrap().timestamp + 600;
        let block = Block::new(
            tip,
            timestamp,
            vec![sample_tx(1), funding.clone(), spending.clone()],
        );
        let hash = block.block_hash();
        backend.chain.add_block(block).unwrap();

        let mut filter = BloomFilter::for_elements(10, 0.0001, 0, BloomUpdate::All);
        filter.insert(&key);
        *peer.filter().lock() = Some(filter);

        peer.handle_message(Message::GetData(vec![InvVect::new(InvType::FilteredBlock, hash)]))
            .await;

        // The funding output is added to the filter before the spend is checked
        match sent.recv().await {
            Some(Message::MerkleBlock(merkle)) => assert_eq!(merkle.total_transactions, 3),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(sent.recv().await, Some(Message::Tx(funding.clone())));
        assert_eq!(sent.recv().await, Some(Message::Tx(spending)));
        assert!(peer
            .filter()
            .lock()
            .as_ref()
            .is_some_and(|f| f.contains_outpoint(&OutPoint::new(funding.txid(), 0))));
    }

    // =========================================================================
    // Chain and filter queries
    // =========================================================================

    #[tokio::test]
    async fn test_get_headers_only_when_current() {
        let (node, backend) = test_node(test_config());
        let (peer, mut rx) = test_peer(&node, "20.0.0.1:5000", true);
        let genesis = backend.chain.hash_at_height(0).unwrap();

        backend.sync.set_current(false);
        peer.handle_message(Message::GetHeaders(locator(vec![genesis])))
            .await;
        assert!(drain_messages(&mut rx).is_empty());

        backend.sync.set_current(true);
        peer.handle_message(Message::GetHeaders(locator(vec![genesis])))
            .await;
        match drain_messages(&mut rx).as_slice() {
            [Message::Headers(headers)] => assert_eq!(headers.len(), 10),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_cfilters() {
        let (node, backend) = test_node(test_config());
        let (peer, mut rx) = test_peer(&node, "20.0.0.1:5000", true);
        let stop_hash = backend.chain.hash_at_height(3).unwrap();

        peer.handle_message(Message::GetCFilters(GetCFiltersMessage {
            filter_type: FilterType::REGULAR,
            start_height: 0,
            stop_hash,
        }))
        .await;

        let messages = drain_messages(&mut rx);
        assert_eq!(messages.len(), 4);
        assert!(matches!(
            messages.last(),
            Some(Message::CFilter(msg)) if msg.block_hash == stop_hash
        ));
    }

    #[tokio::test]
    async fn test_get_cfheaders_sets_previous_header() {
        let (node, backend) = test_node(test_config());
        let (peer, mut rx) = test_peer(&node, "20.0.0.1:5000", true);
        let genesis = backend.chain.hash_at_height(0).unwrap();
        let tip = backend.chain.best_tip();

        peer.handle_message(Message::GetCFHeaders(GetCFiltersMessage {
            filter_type: FilterType::REGULAR,
            start_height: 1,
            stop_hash: tip,
        }))
        .await;

        let expected_prev = backend
            .chain
            .filter_header_by_block_hash(&genesis, FilterType::REGULAR)
            .unwrap()
            .unwrap();
        match drain_messages(&mut rx).as_slice() {
            [Message::CFHeaders(msg)] => {
                assert_eq!(msg.prev_filter_header, expected_prev);
                assert_eq!(msg.filter_hashes.len(), 10);
                assert_eq!(msg.stop_hash, tip);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cf_requests_with_out_of_range_start_height_ignored() {
        let (node, backend) = test_node(test_config());
        let (peer, mut rx) = test_peer(&node, "20.0.0.1:5000", true);
        let tip = backend.chain.best_tip();

        for start_height in [0x8000_0000, u32::MAX] {
            peer.handle_message(Message::GetCFHeaders(GetCFiltersMessage {
                filter_type: FilterType::REGULAR,
                start_height,
                stop_hash: tip,
            }))
            .await;
            peer.handle_message(Message::GetCFilters(GetCFiltersMessage {
                filter_type: FilterType::REGULAR,
                start_height,
                stop_hash: tip,
            }))
            .await;
        }

        assert!(drain_messages(&mut rx).is_empty());
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn test_cf_requests_for_unknown_type_ignored() {
        let (node, backend) = test_node(test_config());
        let (peer, mut rx) = test_peer(&node, "20.0.0.1:5000", true);

        peer.handle_message(Message::GetCFCheckpt(GetCFCheckptMessage {
            filter_type: FilterType(7),
            stop_hash: backend.chain.best_tip(),
        }))
        .await;
        assert!(drain_messages(&mut rx).is_empty());
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn test_get_cfcheckpt_fills_cache() {
        let (node, backend) = test_node_at(test_config(), 2000);
        let (peer, mut rx) = test_peer(&node, "20.0.0.1:5000", true);
        let tip = backend.chain.best_tip();
        assert_eq!(node.shared.cf_checkpoints.len(FilterType::REGULAR), 0);

        peer.handle_message(Message::GetCFCheckpt(GetCFCheckptMessage {
            filter_type: FilterType::REGULAR,
            stop_hash: tip,
        }))
        .await;

        let expected: Vec<Hash> = [1000, 2000]
            .iter()
            .map(|&height| {
                let hash = backend.chain.hash_at_height(height).unwrap();
                backend
                    .chain
                    .filter_header_by_block_hash(&hash, FilterType::REGULAR)
                    .unwrap()
                    .unwrap()
            })
            .collect();
        match drain_messages(&mut rx).as_slice() {
            [Message::CFCheckpt(msg)] => assert_eq!(msg.filter_headers, expected),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(node.shared.cf_checkpoints.len(FilterType::REGULAR), 2);
    }

    // =========================================================================
    // Bloom and fee filters
    // =========================================================================

    #[tokio::test]
    async fn test_filter_load_add_clear() {
        let (node, _backend) = test_node(test_config());
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);
        peer.set_relay_tx_disabled(true);

        peer.handle_message(Message::FilterLoad(FilterLoadMessage {
            filter: vec![0; 16],
            hash_funcs: 5,
            tweak: 0,
            flags: BloomUpdate::None,
        }))
        .await;
        assert!(peer.is_filter_loaded());
        assert!(!peer.relay_tx_disabled());

        peer.handle_message(Message::FilterAdd(vec![1, 2, 3])).await;
        assert!(peer
            .filter()
            .lock()
            .as_ref()
            .map_or(false, |filter| filter.contains(&[1, 2, 3])));

        peer.handle_message(Message::FilterClear).await;
        assert!(!peer.is_filter_loaded());
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn test_filter_add_without_filter_disconnects() {
        let (node, _backend) = test_node(test_config());
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);

        peer.handle_message(Message::FilterAdd(vec![1, 2, 3])).await;
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn test_oversized_filter_add_disconnects() {
        let (node, _backend) = test_node(test_config());
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);
        *peer.filter().lock() = Some(BloomFilter::for_elements(10, 0.001, 0, BloomUpdate::None));

        peer.handle_message(Message::FilterAdd(vec![0; MAX_FILTER_ADD_DATA_SIZE + 1]))
            .await;
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn test_filter_requests_when_bloom_disabled() {
        let config = NodeConfig {
            no_peer_bloom_filters: true,
            ..test_config()
        };
        let (node, _backend) = test_node(config);
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);

        peer.handle_message(Message::FilterClear).await;
        assert!(!peer.is_connected());
        assert_eq!(peer.ban_score(), 100);
    }

    #[tokio::test]
    async fn test_fee_filter() {
        let (node, _backend) = test_node(test_config());
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);

        peer.handle_message(Message::FeeFilter(5000)).await;
        assert_eq!(peer.fee_filter(), 5000);

        peer.handle_message(Message::FeeFilter(MAX_SATOSHI + 1)).await;
        assert!(!peer.is_connected());
        assert_eq!(peer.fee_filter(), 5000);
    }

    // =========================================================================
    // Addresses
    // =========================================================================

    #[tokio::test]
    async fn test_get_addr_served_once() {
        let (node, backend) = test_node(test_config());
        let source = NetAddress::new(NetHost::Ipv4(Ipv4Addr::new(60, 0, 0, 1)), 8333, ServiceFlags::NETWORK);
        backend.addrs.add_addresses(routable_addrs(5), &source);
        let (peer, mut rx) = test_peer(&node, "20.0.0.1:5000", true);

        peer.handle_message(Message::GetAddr).await;
        match drain_messages(&mut rx).as_slice() {
            [Message::Addr(addrs)] => assert_eq!(addrs.len(), 5),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(peer.sent_addrs());

        peer.handle_message(Message::GetAddr).await;
        assert!(drain_messages(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_get_addr_ignored_from_outbound_and_simnet() {
        let (node, backend) = test_node(test_config());
        let source = NetAddress::new(NetHost::Ipv4(Ipv4Addr::new(60, 0, 0, 1)), 8333, ServiceFlags::NETWORK);
        backend.addrs.add_addresses(routable_addrs(5), &source);
        let (outbound, mut rx) = test_peer(&node, "8.8.8.8:8333", false);
        outbound.handle_message(Message::GetAddr).await;
        assert!(drain_messages(&mut rx).is_empty());

        let config = NodeConfig {
            network: Network::Simnet,
            ..test_config()
        };
        let (node, backend) = test_node(config);
        backend.addrs.add_addresses(routable_addrs(5), &source);
        let (inbound, mut rx) = test_peer(&node, "20.0.0.1:5000", true);
        inbound.handle_message(Message::GetAddr).await;
        assert!(drain_messages(&mut rx).is_empty());
        assert!(!inbound.sent_addrs());
    }

    #[tokio::test]
    async fn test_push_addr_skips_tor_without_addrv2() {
        let (node, _backend) = test_node(test_config());
        let (peer, mut rx) = test_peer(&node, "20.0.0.1:5000", true);

        let mut addrs = routable_addrs(2);
        addrs.push(NetAddress::new(NetHost::TorV3([7; 32]), 9050, ServiceFlags::NETWORK));

        assert_eq!(peer.push_addr_msg(&addrs), 2);
        assert!(matches!(drain_messages(&mut rx).as_slice(), [Message::Addr(a)] if a.len() == 2));

        // Already known addresses are not sent again
        assert_eq!(peer.push_addr_msg(&addrs[..2]), 0);

        peer.set_wants_addrv2();
        assert_eq!(peer.push_addr_msg(&addrs), 1);
        assert!(matches!(drain_messages(&mut rx).as_slice(), [Message::AddrV2(a)] if a.len() == 1));
    }

    #[tokio::test]
    async fn test_addr_message() {
        let (node, backend) = test_node(test_config());
        let (peer, mut rx) = test_peer(&node, "20.0.0.1:5000", true);

        let mut addrs = routable_addrs(3);
        addrs[0].timestamp = Utc::now() + ChronoDuration::hours(1);
        peer.handle_message(Message::Addr(addrs.clone())).await;
        assert!(peer.is_connected());
        assert_eq!(backend.addrs.size(), 3);

        // Addresses the peer told us about are not echoed back
        assert_eq!(peer.push_addr_msg(&addrs), 0);
        assert!(drain_messages(&mut rx).is_empty());

        peer.handle_message(Message::Addr(vec![])).await;
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn test_oversized_addr_message_disconnects() {
        let (node, backend) = test_node(test_config());
        let (peer, _rx) = test_peer(&node, "20.0.0.1:5000", true);

        let addrs: Vec<NetAddress> = (0..=MAX_ADDR_PER_MSG as u32)
            .map(|i| {
                NetAddress::new(
                    NetHost::Ipv4(Ipv4Addr::from(0x3200_0000 + i)),
                    8333,
                    ServiceFlags::NETWORK,
                )
            })
            .collect();
        peer.handle_message(Message::Addr(addrs)).await;
        assert!(!peer.is_connected());
        assert_eq!(backend.addrs.size(), 0);
    }
}
