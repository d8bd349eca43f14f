use core::time::Duration;
use std::{
    collections::HashMap,
    time::Instant,
};

use itertools::Itertools as _;
use log::debug;
use rand::seq::IteratorRandom as _;
use types::{
    config::Config,
    consts::{MIN_EPOCHS_FOR_BLOB_SIDECARS_REQUESTS, SLOTS_PER_EPOCH},
    misc,
    nonstandard::Phase,
    primitives::{Epoch, PeerId, Slot},
};

use crate::misc::{PeerStatus, RequestId};

const EPOCHS_PER_REQUEST: u64 = 1;
const MAX_BATCHES_IN_FLIGHT: usize = 4;
const REQUEST_BY_RANGE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncDirection {
    Forward,
    Back,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncTarget {
    Block,
    BlobSidecar,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SyncBatch {
    pub direction: SyncDirection,
    pub target: SyncTarget,
    pub peer_id: PeerId,
    pub start_slot: Slot,
    pub count: u64,
    pub retry_count: usize,
}

/// Schedules block and blob range requests against the peer pool.
///
/// One instance serves both directions; the forward path ranges from the head
/// to the wall slot, the backward path from the backfill checkpoint towards
/// genesis.
pub struct SyncManager {
    peers: HashMap<PeerId, PeerStatus>,
    batches_in_flight: HashMap<RequestId, (SyncBatch, Instant)>,
    next_request_id: RequestId,
}

impl SyncManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            batches_in_flight: HashMap::new(),
            next_request_id: 0,
        }
    }

    pub fn add_peer(&mut self, peer_id: PeerId, status: PeerStatus) {
        debug!("add peer (peer_id: {peer_id}, status: {status:?})");
        self.peers.insert(peer_id, status);
    }

    /// Removes a peer and returns its unfinished batches for retry.
    pub fn remove_peer(&mut self, peer_id: PeerId) -> Vec<SyncBatch> {
        debug!("remove peer (peer_id: {peer_id})");

        self.peers.remove(&peer_id);

        let request_ids = self
            .batches_in_flight
            .iter()
            .filter(|(_, (batch, _))| batch.peer_id == peer_id)
            .map(|(request_id, _)| *request_id)
            .collect_vec();

        request_ids
            .into_iter()
            .filter_map(|request_id| self.batches_in_flight.remove(&request_id))
            .map(|(batch, _)| batch)
            .collect()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn best_peer_head_slot(&self) -> Option<Slot> {
        self.peers.values().map(|status| status.head_slot).max()
    }

    /// The highest finalized epoch any peer has reported. Blocks at or below
    /// it can take the finalized-range processing fast path.
    #[must_use]
    pub fn max_peer_finalized_epoch(&self) -> Epoch {
        self.peers
            .values()
            .map(|status| status.finalized_epoch)
            .max()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn random_peer(&self) -> Option<PeerId> {
        self.peers.keys().copied().choose(&mut rand::thread_rng())
    }

    #[must_use]
    pub fn batch(&self, request_id: RequestId) -> Option<SyncBatch> {
        self.batches_in_flight
            .get(&request_id)
            .map(|(batch, _)| *batch)
    }

    /// Whether a new range request round may start.
    #[must_use]
    pub fn ready_to_request_by_range(&self) -> bool {
        self.batches_in_flight.len() < MAX_BATCHES_IN_FLIGHT
    }

    /// Builds the next forward batch covering `(local_head_slot, wall_slot]`.
    /// Blob batches accompany block batches inside the blob retention window.
    pub fn build_forward_batches(
        &mut self,
        config: &Config,
        local_head_slot: Slot,
        wall_slot: Slot,
    ) -> Vec<(RequestId, SyncBatch)> {
        let start_slot = local_head_slot + 1;
        let count = (wall_slot + 1)
            .saturating_sub(start_slot)
            .min(EPOCHS_PER_REQUEST * SLOTS_PER_EPOCH.get());

        if count == 0 {
            return vec![];
        }

        let Some(peer_id) = self.random_peer_at_or_ahead_of(wall_slot.min(start_slot)) else {
            return vec![];
        };

        self.build_batches(
            config,
            SyncDirection::Forward,
            peer_id,
            start_slot,
            count,
            misc::compute_epoch_at_slot(wall_slot),
        )
    }

    /// Builds the next backward batch ending just below `backfill_slot`.
    pub fn build_back_batches(
        &mut self,
        config: &Config,
        backfill_slot: Slot,
        wall_slot: Slot,
    ) -> Vec<(RequestId, SyncBatch)> {
        if backfill_slot == 0 {
            return vec![];
        }

        let count = backfill_slot.min(EPOCHS_PER_REQUEST * SLOTS_PER_EPOCH.get());
        let start_slot = backfill_slot - count;

        let Some(peer_id) = self.random_historical_peer() else {
            return vec![];
        };

        self.build_batches(
            config,
            SyncDirection::Back,
            peer_id,
            start_slot,
            count,
            misc::compute_epoch_at_slot(wall_slot),
        )
    }

    /// Reassigns a failed or expired batch to another peer.
    pub fn retry_batch(&mut self, batch: SyncBatch) -> Option<(RequestId, SyncBatch)> {
        let peer_id = match batch.direction {
            SyncDirection::Forward => {
                self.random_peer_at_or_ahead_of(batch.start_slot + batch.count - 1)?
            }
            SyncDirection::Back => self.random_historical_peer()?,
        };

        let batch = SyncBatch {
            peer_id,
            retry_count: batch.retry_count + 1,
            ..batch
        };

        let request_id = self.register_batch(batch);

        Some((request_id, batch))
    }

    /// Marks a range request as finished and returns its batch.
    pub fn request_by_range_finished(&mut self, request_id: RequestId) -> Option<SyncBatch> {
        self.batches_in_flight
            .remove(&request_id)
            .map(|(batch, _)| batch)
    }

    /// Removes and returns batches whose requests have timed out.
    pub fn expired_batches(&mut self) -> Vec<SyncBatch> {
        let expired = self
            .batches_in_flight
            .iter()
            .filter(|(_, (_, requested_at))| requested_at.elapsed() > REQUEST_BY_RANGE_TIMEOUT)
            .map(|(request_id, _)| *request_id)
            .collect_vec();

        expired
            .into_iter()
            .filter_map(|request_id| self.batches_in_flight.remove(&request_id))
            .map(|(batch, _)| batch)
            .collect()
    }

    fn build_batches(
        &mut self,
        config: &Config,
        direction: SyncDirection,
        peer_id: PeerId,
        start_slot: Slot,
        count: u64,
        wall_epoch: Epoch,
    ) -> Vec<(RequestId, SyncBatch)> {
        let block_batch = SyncBatch {
            direction,
            target: SyncTarget::Block,
            peer_id,
            start_slot,
            count,
            retry_count: 0,
        };

        let mut batches = vec![(self.register_batch(block_batch), block_batch)];

        if blobs_available_in_range(config, start_slot, count, wall_epoch) {
            let blob_batch = SyncBatch {
                target: SyncTarget::BlobSidecar,
                ..block_batch
            };

            batches.push((self.register_batch(blob_batch), blob_batch));
        }

        batches
    }

    fn register_batch(&mut self, batch: SyncBatch) -> RequestId {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.batches_in_flight
            .insert(request_id, (batch, Instant::now()));
        request_id
    }

    fn random_peer_at_or_ahead_of(&self, slot: Slot) -> Option<PeerId> {
        self.peers
            .iter()
            .filter(|(_, status)| status.head_slot >= slot)
            .map(|(peer_id, _)| *peer_id)
            .choose(&mut rand::thread_rng())
    }

    /// Backfilling needs peers that serve blocks outside the minimal
    /// retention window.
    fn random_historical_peer(&self) -> Option<PeerId> {
        self.peers
            .iter()
            .filter(|(_, status)| status.serves_historical_blocks)
            .map(|(peer_id, _)| *peer_id)
            .choose(&mut rand::thread_rng())
    }
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Peers must serve blob sidecars for `MIN_EPOCHS_FOR_BLOB_SIDECARS_REQUESTS`
/// epochs. Requesting blobs outside that window, or before Deneb, is wasted
/// traffic.
fn blobs_available_in_range(config: &Config, start_slot: Slot, count: u64, wall_epoch: Epoch) -> bool {
    let end_epoch = misc::compute_epoch_at_slot(start_slot + count.saturating_sub(1));

    if config.phase_at_epoch(end_epoch) < Phase::Deneb {
        return false;
    }

    let earliest_available =
        wall_epoch.saturating_sub(MIN_EPOCHS_FOR_BLOB_SIDECARS_REQUESTS);

    end_epoch >= earliest_available
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synced_peer(head_slot: Slot) -> PeerStatus {
        PeerStatus {
            head_slot,
            finalized_epoch: misc::compute_epoch_at_slot(head_slot).saturating_sub(2),
            serves_historical_blocks: true,
        }
    }

    #[test]
    fn forward_batches_cover_the_range_from_head_to_wall_slot() {
        let mut manager = SyncManager::new();
        manager.add_peer(PeerId(1), synced_peer(200));

        let batches = manager.build_forward_batches(&Config::mainnet(), 100, 200);

        let (_, block_batch) = batches[0];

        assert_eq!(block_batch.target, SyncTarget::Block);
        assert_eq!(block_batch.start_slot, 101);
        assert_eq!(block_batch.count, SLOTS_PER_EPOCH.get());
    }

    #[test]
    fn blob_batches_accompany_block_batches_after_deneb() {
        let mut manager = SyncManager::new();
        manager.add_peer(PeerId(1), synced_peer(200));

        let batches =
            manager.build_back_batches(&Config::all_forks_at_genesis(), 64, 200);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].1.target, SyncTarget::Block);
        assert_eq!(batches[1].1.target, SyncTarget::BlobSidecar);

        // Before Deneb no blob batch is built.
        let batches = manager.build_back_batches(&Config::mainnet(), 64, 200);

        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn caught_up_nodes_build_no_batches() {
        let mut manager = SyncManager::new();
        manager.add_peer(PeerId(1), synced_peer(200));

        assert!(manager
            .build_forward_batches(&Config::mainnet(), 200, 200)
            .is_empty());
    }

    #[test]
    fn removing_a_peer_returns_its_batches_for_retry() {
        let mut manager = SyncManager::new();
        manager.add_peer(PeerId(1), synced_peer(200));
        manager.add_peer(PeerId(2), synced_peer(200));

        let batches = manager.build_forward_batches(&Config::mainnet(), 100, 200);
        let peer_id = batches[0].1.peer_id;

        let to_retry = manager.remove_peer(peer_id);

        assert_eq!(to_retry.len(), batches.len());

        let retried = manager
            .retry_batch(to_retry[0])
            .expect("another peer is available");

        assert_ne!(retried.1.peer_id, peer_id);
        assert_eq!(retried.1.retry_count, 1);
    }
}
