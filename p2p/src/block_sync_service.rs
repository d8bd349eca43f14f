use core::time::Duration;
use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use block_processor::{Controller, VerifierError};
use database::Database;
use futures::{
    channel::mpsc::{UnboundedReceiver, UnboundedSender},
    select,
    stream::StreamExt as _,
};
use log::{debug, info, warn};
use metrics::Metrics;
use tokio_stream::wrappers::IntervalStream;
use types::{
    combined::SignedBeaconBlock,
    containers::{BlobIdentifier, BlobSidecar},
    misc,
    primitives::{PeerId, Slot, H256},
};

use crate::{
    back_sync::BackSync,
    messages::{P2pToSync, SyncToApi, SyncToP2p},
    misc::RequestId,
    request_manager::RequestManager,
    sync_manager::{SyncBatch, SyncDirection, SyncManager, SyncTarget},
};

const NETWORK_EVENT_INTERVAL: Duration = Duration::from_secs(1);
const BACK_SYNC_POLL_INTERVAL: Duration = Duration::from_secs(2);
const MISSED_SLOTS_TO_TRIGGER_SYNC: u64 = 2;

pub struct Channels {
    pub p2p_to_sync_rx: UnboundedReceiver<P2pToSync>,
    pub sync_to_p2p_tx: UnboundedSender<SyncToP2p>,
    pub sync_to_api_tx: UnboundedSender<SyncToApi>,
}

/// Drives forward range sync, backfill and targeted by-root requests.
///
/// All peer traffic goes through the channels; the networking substrate is
/// on the other end of them.
pub struct BlockSyncService {
    controller: Arc<Controller>,
    sync_manager: SyncManager,
    request_manager: RequestManager,
    back_sync: Option<BackSync>,
    metrics: Option<Arc<Metrics>>,
    is_forward_synced: bool,
    is_back_synced: bool,
    /// Set when the block processor reports a full queue; fetches pause
    /// until the next network interval.
    queue_full_backoff: bool,
    pending_back_blocks: HashMap<RequestId, Vec<Arc<SignedBeaconBlock>>>,
    p2p_to_sync_rx: UnboundedReceiver<P2pToSync>,
    sync_to_p2p_tx: UnboundedSender<SyncToP2p>,
    sync_to_api_tx: UnboundedSender<SyncToApi>,
}

impl BlockSyncService {
    pub fn new(
        controller: Arc<Controller>,
        database: Arc<Database>,
        metrics: Option<Arc<Metrics>>,
        channels: Channels,
        back_sync_enabled: bool,
    ) -> Result<Self> {
        let Channels {
            p2p_to_sync_rx,
            sync_to_p2p_tx,
            sync_to_api_tx,
        } = channels;

        let back_sync = back_sync_enabled
            .then(|| BackSync::load(database, controller.backfill()))
            .transpose()?;

        // `is_back_synced` is only meaningful when backfill is enabled.
        // Otherwise it is `true` so historical queries fail loudly instead of
        // waiting forever.
        let is_back_synced = back_sync
            .as_ref()
            .map(BackSync::is_finished)
            .unwrap_or(true);

        let mut service = Self {
            controller,
            sync_manager: SyncManager::new(),
            request_manager: RequestManager::new(),
            back_sync,
            metrics,
            // Start not-forward-synced so the first status update subscribes
            // core gossip topics.
            is_forward_synced: false,
            is_back_synced,
            queue_full_backoff: false,
            pending_back_blocks: HashMap::new(),
            p2p_to_sync_rx,
            sync_to_p2p_tx,
            sync_to_api_tx,
        };

        service.set_back_synced(is_back_synced);

        Ok(service)
    }

    pub async fn run(mut self) -> Result<()> {
        let mut interval =
            IntervalStream::new(tokio::time::interval(NETWORK_EVENT_INTERVAL)).fuse();

        let mut back_sync_interval =
            IntervalStream::new(tokio::time::interval(BACK_SYNC_POLL_INTERVAL)).fuse();

        loop {
            select! {
                _ = interval.select_next_some() => {
                    self.queue_full_backoff = false;
                    self.retry_expired_batches();
                    self.update_sync_status();
                    self.request_blocks_if_ready();
                }

                _ = back_sync_interval.select_next_some() => {
                    self.request_back_sync_blocks_if_ready();
                }

                message = self.p2p_to_sync_rx.select_next_some() => {
                    if !self.handle_message(message) {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_message(&mut self, message: P2pToSync) -> bool {
        match message {
            P2pToSync::Slot(slot) => {
                debug!("sync service at slot {slot}");
                self.update_sync_status();

                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.connected_peers.set(self.sync_manager.peer_count() as i64);
                }
            }
            P2pToSync::AddPeer(peer_id, status) => {
                self.sync_manager.add_peer(peer_id, status);
                self.request_blocks_if_ready();
            }
            P2pToSync::RemovePeer(peer_id) => {
                let batches_to_retry = self.sync_manager.remove_peer(peer_id);
                self.retry_sync_batches(batches_to_retry);
            }
            P2pToSync::RequestFailed(peer_id, request_id) => {
                debug!("request {request_id} to {peer_id} failed");

                if let Some(batch) = self.sync_manager.request_by_range_finished(request_id) {
                    self.pending_back_blocks.remove(&request_id);
                    self.retry_sync_batches(vec![batch]);
                }
            }
            P2pToSync::GossipBlock(block, peer_id) => {
                self.submit_block(block, peer_id, None);
            }
            P2pToSync::RequestedBlock(block, peer_id, request_id) => {
                match self.sync_manager.batch(request_id).map(|batch| batch.direction) {
                    Some(SyncDirection::Forward) => {
                        self.submit_block(block, peer_id, Some(request_id));
                    }
                    Some(SyncDirection::Back) => {
                        self.pending_back_blocks
                            .entry(request_id)
                            .or_default()
                            .push(block);
                    }
                    None => {
                        self.request_manager.block_received(block.hash_tree_root());
                        self.submit_block(block, peer_id, None);
                    }
                }
            }
            P2pToSync::GossipBlobSidecar(blob_sidecar, peer_id)
            | P2pToSync::RequestedBlobSidecar(blob_sidecar, peer_id, _) => {
                self.request_manager
                    .blob_received(BlobIdentifier::from(blob_sidecar.as_ref()));

                self.submit_blob_sidecar(blob_sidecar, peer_id);
            }
            P2pToSync::RangeRequestFinished(request_id, _peer_id) => {
                self.finish_range_request(request_id);
            }
            P2pToSync::BlockNeeded(block_root, peer_id) => {
                self.request_needed_block(block_root, peer_id);
            }
            P2pToSync::BlobsNeeded(identifiers, slot, peer_id) => {
                self.request_needed_blob_sidecars(identifiers, slot, peer_id);
            }
            P2pToSync::FinalizedCheckpoint(checkpoint) => {
                debug!("sync observed finalized checkpoint {checkpoint:?}");
            }
            P2pToSync::Stop => {
                SyncToP2p::Stop.send(&self.sync_to_p2p_tx);
                SyncToApi::Stop.send(&self.sync_to_api_tx);
                return false;
            }
        }

        true
    }

    fn submit_block(
        &mut self,
        block: Arc<SignedBeaconBlock>,
        peer_id: PeerId,
        range_request_id: Option<RequestId>,
    ) {
        let result = match range_request_id {
            Some(_) => {
                let maybe_finalized = misc::compute_epoch_at_slot(block.slot())
                    <= self.sync_manager.max_peer_finalized_epoch();

                self.controller.on_sync_block(block, peer_id, maybe_finalized)
            }
            None => self.controller.on_gossip_block(block, peer_id),
        };

        self.observe_submission(result);
    }

    fn submit_blob_sidecar(&mut self, blob_sidecar: Arc<BlobSidecar>, peer_id: PeerId) {
        let result = self.controller.on_blob_sidecar(blob_sidecar, Some(peer_id));
        self.observe_submission(result);
    }

    /// A full processor queue pauses all fetching until the next interval.
    fn observe_submission(&mut self, result: Result<(), VerifierError>) {
        if result == Err(VerifierError::QueueFull) {
            debug!("block processor queue is full; pausing fetches");
            self.queue_full_backoff = true;
        }
    }

    fn update_sync_status(&mut self) {
        let head_distance = self.controller.head_distance();
        let is_forward_synced = head_distance < MISSED_SLOTS_TO_TRIGGER_SYNC;

        if is_forward_synced != self.is_forward_synced {
            info!(
                "forward sync {} (head distance: {head_distance})",
                if is_forward_synced { "complete" } else { "started" },
            );

            self.is_forward_synced = is_forward_synced;
            self.controller.set_forward_synced(is_forward_synced);
            SyncToApi::SyncStatus(is_forward_synced).send(&self.sync_to_api_tx);
        }
    }

    fn set_back_synced(&mut self, is_back_synced: bool) {
        self.is_back_synced = is_back_synced;
        self.controller.set_back_synced(is_back_synced);
        SyncToApi::BackSyncStatus(is_back_synced).send(&self.sync_to_api_tx);
    }

    fn request_blocks_if_ready(&mut self) {
        if self.is_forward_synced
            || self.queue_full_backoff
            || !self.sync_manager.ready_to_request_by_range()
        {
            return;
        }

        let head_slot = self.controller.head().slot;
        let wall_slot = self.controller.wall_slot();

        let batches = self.sync_manager.build_forward_batches(
            self.controller.chain_config(),
            head_slot,
            wall_slot,
        );

        self.send_batch_requests(batches);
    }

    /// Backfill runs only once forward sync has completed, polled on its own
    /// interval.
    fn request_back_sync_blocks_if_ready(&mut self) {
        if !self.is_forward_synced || self.is_back_synced || self.queue_full_backoff {
            return;
        }

        let Some(back_sync) = self.back_sync.as_ref() else {
            return;
        };

        if back_sync.is_finished() {
            self.set_back_synced(true);
            return;
        }

        if !self.sync_manager.ready_to_request_by_range() {
            return;
        }

        let backfill_slot = back_sync.checkpoint().slot;
        let wall_slot = self.controller.wall_slot();

        let batches = self.sync_manager.build_back_batches(
            self.controller.chain_config(),
            backfill_slot,
            wall_slot,
        );

        self.send_batch_requests(batches);
    }

    fn send_batch_requests(&mut self, batches: Vec<(RequestId, SyncBatch)>) {
        for (request_id, batch) in batches {
            let SyncBatch {
                target,
                peer_id,
                start_slot,
                count,
                ..
            } = batch;

            let request = match target {
                SyncTarget::Block => {
                    SyncToP2p::RequestBlocksByRange(request_id, peer_id, start_slot, count)
                }
                SyncTarget::BlobSidecar => {
                    SyncToP2p::RequestBlobsByRange(request_id, peer_id, start_slot, count)
                }
            };

            request.send(&self.sync_to_p2p_tx);
        }
    }

    fn retry_sync_batches(&mut self, batches: Vec<SyncBatch>) {
        for batch in batches {
            match self.sync_manager.retry_batch(batch) {
                Some(reassigned) => self.send_batch_requests(vec![reassigned]),
                None => debug!("no peer available to retry batch {batch:?}"),
            }
        }
    }

    fn retry_expired_batches(&mut self) {
        let expired = self.sync_manager.expired_batches();

        for batch in &expired {
            self.pending_back_blocks.retain(|_, blocks| {
                blocks
                    .first()
                    .map(|block| block.slot() < batch.start_slot || block.slot() >= batch.start_slot + batch.count)
                    .unwrap_or(true)
            });

            SyncToP2p::PenalizePeer(batch.peer_id).send(&self.sync_to_p2p_tx);
        }

        self.retry_sync_batches(expired);
    }

    fn finish_range_request(&mut self, request_id: RequestId) {
        let Some(batch) = self.sync_manager.request_by_range_finished(request_id) else {
            return;
        };

        if batch.direction != SyncDirection::Back || batch.target != SyncTarget::Block {
            return;
        }

        let mut blocks = self
            .pending_back_blocks
            .remove(&request_id)
            .unwrap_or_default();

        // Backfill verifies ancestry newest first.
        blocks.sort_by_key(|block| core::cmp::Reverse(block.slot()));

        let Some(back_sync) = self.back_sync.as_mut() else {
            return;
        };

        match back_sync.push_blocks(blocks) {
            Ok(()) => {
                if back_sync.is_finished() {
                    self.set_back_synced(true);
                }
            }
            Err(error) => {
                warn!("back-sync batch from {} was invalid: {error:#}", batch.peer_id);
                SyncToP2p::PenalizePeer(batch.peer_id).send(&self.sync_to_p2p_tx);
                self.retry_sync_batches(vec![batch]);
            }
        }
    }

    /// On-demand fetch for a quarantined block's parent. Suspended while
    /// range sync is active to avoid redundant traffic.
    fn request_needed_block(&mut self, block_root: H256, peer_id: Option<PeerId>) {
        if !self.is_forward_synced || self.queue_full_backoff {
            return;
        }

        if self.controller.contains_block(block_root) {
            return;
        }

        if !self.request_manager.ready_to_request_block(block_root) {
            return;
        }

        let Some(peer_id) = peer_id.or_else(|| self.sync_manager.random_peer()) else {
            return;
        };

        let request_id = self.request_manager.next_request_id();

        SyncToP2p::RequestBlocksByRoot(request_id, peer_id, vec![block_root])
            .send(&self.sync_to_p2p_tx);
    }

    fn request_needed_blob_sidecars(
        &mut self,
        identifiers: Vec<BlobIdentifier>,
        slot: Slot,
        peer_id: Option<PeerId>,
    ) {
        if !self.is_forward_synced || self.queue_full_backoff {
            return;
        }

        let identifiers = self.request_manager.ready_to_request_blobs(&identifiers);

        if identifiers.is_empty() {
            return;
        }

        let Some(peer_id) = peer_id.or_else(|| self.sync_manager.random_peer()) else {
            return;
        };

        debug!(
            "requesting {} blob sidecar(s) for slot {slot} from {peer_id}",
            identifiers.len(),
        );

        let request_id = self.request_manager.next_request_id();

        SyncToP2p::RequestBlobsByRoot(request_id, peer_id, identifiers)
            .send(&self.sync_to_p2p_tx);
    }
}
