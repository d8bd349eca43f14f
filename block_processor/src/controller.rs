// Instead of mutating the block tree directly, the `on_*` methods enqueue
// work for the mutator thread. Query methods operate on a recent but
// potentially out-of-date snapshot. Submitting the same object twice in quick
// succession therefore results in one `Duplicate` rejection, not two inserts.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::SyncSender,
        Arc,
    },
    thread::{Builder, JoinHandle},
};

use anyhow::{Context as _, Result};
use arc_swap::{ArcSwap, Guard};
use chain_dag::{ChainDag, HeadInfo, Storage, SyncCheckpoint};
use clock::Tick;
use events::EventChannels;
use execution_engine::ExecutionEngine;
use futures::channel::{mpsc::UnboundedSender, oneshot};
use log::debug;
use metrics::Metrics;
use std_ext::ArcExt as _;
use thiserror::Error;
use types::{
    beacon_state::BeaconState,
    combined::SignedBeaconBlock,
    config::Config,
    containers::{BlobSidecar, Checkpoint},
    primitives::{Epoch, Gwei, PeerId, Slot, UnixSeconds, ValidatorIndex, H256},
};

use crate::{
    messages::{P2pMessage, ProcessorMessage},
    misc::{BlockOrigin, VerifierError},
    mutator::Mutator,
    state_transition::StateTransition,
};

/// Upper bound on queued work. When the queue is full, submissions observe
/// [`VerifierError::QueueFull`] and the sync services pause their fetches.
const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
enum Error {
    #[error("block processor thread panicked")]
    ProcessorPanicked,
    #[error("block processor thread failed")]
    ProcessorFailed,
}

pub struct Controller {
    config: Arc<Config>,
    genesis_time: UnixSeconds,
    dag_snapshot: Arc<ArcSwap<ChainDag>>,
    processor_tx: SyncSender<ProcessorMessage>,
    wall_slot: AtomicU64,
    is_forward_synced: AtomicBool,
    is_back_synced: AtomicBool,
    needs_pruning: Arc<AtomicBool>,
    is_optimistic: Arc<AtomicBool>,
}

pub struct ProcessorHandle {
    join_handle: Option<JoinHandle<Result<()>>>,
    processor_tx: SyncSender<ProcessorMessage>,
}

impl ProcessorHandle {
    pub fn join(mut self) -> Result<()> {
        // Ignore full and disconnected queues; both mean the thread is ending.
        self.processor_tx.try_send(ProcessorMessage::Stop).ok();

        self.join_handle
            .take()
            .expect("join is only called once")
            .join()
            .map_err(|_| Error::ProcessorPanicked)?
    }
}

impl Controller {
    #[expect(clippy::too_many_arguments)]
    pub fn new<S: StateTransition, E: ExecutionEngine + 'static>(
        config: Arc<Config>,
        anchor_block: Arc<SignedBeaconBlock>,
        anchor_state: Arc<BeaconState>,
        storage: Arc<Storage>,
        state_transition: S,
        execution_engine: E,
        event_channels: Arc<EventChannels>,
        metrics: Option<Arc<Metrics>>,
        p2p_tx: UnboundedSender<P2pMessage>,
    ) -> Result<(Arc<Self>, ProcessorHandle)> {
        let genesis_time = anchor_state.genesis_time;
        let dag = ChainDag::new(anchor_block, anchor_state);
        let dag_snapshot = Arc::new(ArcSwap::from_pointee(dag.clone()));

        let needs_pruning = Arc::new(AtomicBool::new(false));
        let is_optimistic = Arc::new(AtomicBool::new(false));

        let (processor_tx, processor_rx) = std::sync::mpsc::sync_channel(QUEUE_CAPACITY);

        let mutator = Mutator::new(
            dag,
            dag_snapshot.clone_arc(),
            storage,
            state_transition,
            execution_engine,
            event_channels,
            needs_pruning.clone_arc(),
            is_optimistic.clone_arc(),
            metrics,
            processor_rx,
            p2p_tx,
        );

        let join_handle = Builder::new()
            .name("block-processor".to_owned())
            .spawn(|| mutator.run().context(Error::ProcessorFailed))?;

        let controller = Arc::new(Self {
            config,
            genesis_time,
            dag_snapshot,
            processor_tx: processor_tx.clone(),
            wall_slot: AtomicU64::new(0),
            is_forward_synced: AtomicBool::new(false),
            is_back_synced: AtomicBool::new(false),
            needs_pruning,
            is_optimistic,
        });

        let handle = ProcessorHandle {
            join_handle: Some(join_handle),
            processor_tx,
        };

        Ok((controller, handle))
    }

    #[must_use]
    pub const fn chain_config(&self) -> &Arc<Config> {
        &self.config
    }

    #[must_use]
    pub const fn genesis_time(&self) -> UnixSeconds {
        self.genesis_time
    }

    pub fn on_gossip_block(
        &self,
        block: Arc<SignedBeaconBlock>,
        peer_id: PeerId,
    ) -> Result<(), VerifierError> {
        self.submit_block(block, None, BlockOrigin::Gossip(peer_id), None)
    }

    pub fn on_requested_block(
        &self,
        block: Arc<SignedBeaconBlock>,
        peer_id: PeerId,
    ) -> Result<(), VerifierError> {
        self.submit_block(block, None, BlockOrigin::RequestedByRoot(peer_id), None)
    }

    pub fn on_sync_block(
        &self,
        block: Arc<SignedBeaconBlock>,
        peer_id: PeerId,
        maybe_finalized: bool,
    ) -> Result<(), VerifierError> {
        self.submit_block(
            block,
            None,
            BlockOrigin::RangeSync {
                peer_id,
                maybe_finalized,
            },
            None,
        )
    }

    /// Submits a block and returns a future resolving to the verifier
    /// outcome once the mutator has processed it.
    pub fn on_own_block_with_reply(
        &self,
        block: Arc<SignedBeaconBlock>,
        blobs: Option<Vec<Arc<BlobSidecar>>>,
    ) -> Result<oneshot::Receiver<Result<(), VerifierError>>, VerifierError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit_block(block, blobs, BlockOrigin::Own, Some(reply_tx))?;
        Ok(reply_rx)
    }

    pub fn on_blob_sidecar(
        &self,
        blob_sidecar: Arc<BlobSidecar>,
        peer_id: Option<PeerId>,
    ) -> Result<(), VerifierError> {
        self.enqueue(ProcessorMessage::BlobSidecar {
            blob_sidecar,
            peer_id,
        })
    }

    pub fn on_attestation_vote(
        &self,
        validator_index: ValidatorIndex,
        beacon_block_root: H256,
        epoch: Epoch,
        weight: Gwei,
    ) {
        self.enqueue(ProcessorMessage::AttestationVote {
            validator_index,
            beacon_block_root,
            epoch,
            weight,
        })
        .unwrap_or_else(|error| debug!("dropping attestation vote: {error}"));
    }

    pub fn on_tick(&self, tick: Tick) {
        self.wall_slot.store(tick.slot, Ordering::SeqCst);

        self.enqueue(ProcessorMessage::Tick(tick))
            .unwrap_or_else(|error| debug!("dropping tick: {error}"));
    }

    /// Re-runs fork choice and waits for the mutator to finish doing so.
    /// Any head change or reorg events are published before this returns.
    pub async fn update_head(&self, wall_slot: Slot) -> Result<(), VerifierError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.enqueue(ProcessorMessage::UpdateHead {
            wall_slot,
            reply: reply_tx,
        })?;

        reply_rx.await.map_err(|_| VerifierError::QueueFull)
    }

    /// Pre-stages the next slot's state shortly before the slot boundary.
    pub fn advance_clearance_state(&self, next_slot: Slot) {
        self.enqueue(ProcessorMessage::AdvanceClearance { next_slot })
            .unwrap_or_else(|error| debug!("dropping advance clearance request: {error}"));
    }

    /// Triggers state cache and fork choice pruning if finalization advanced
    /// since the last call.
    pub fn prune_state_caches_and_fork_choice(&self) {
        if self.needs_pruning.swap(false, Ordering::SeqCst) {
            self.enqueue(ProcessorMessage::Prune)
                .unwrap_or_else(|error| debug!("dropping prune request: {error}"));
        }
    }

    pub fn stop(&self) {
        self.processor_tx.try_send(ProcessorMessage::Stop).ok();
    }

    // Queries. All of these read the latest published snapshot.

    #[must_use]
    pub fn snapshot(&self) -> Guard<Arc<ChainDag>> {
        self.dag_snapshot.load()
    }

    #[must_use]
    pub fn head(&self) -> HeadInfo {
        self.snapshot().head_info()
    }

    #[must_use]
    pub fn head_state(&self) -> Arc<BeaconState> {
        self.snapshot().head_state()
    }

    #[must_use]
    pub fn finalized_checkpoint(&self) -> Checkpoint {
        self.snapshot().finalized_checkpoint()
    }

    #[must_use]
    pub fn backfill(&self) -> SyncCheckpoint {
        self.snapshot().backfill()
    }

    #[must_use]
    pub fn contains_block(&self, root: H256) -> bool {
        self.snapshot().contains_block(root)
    }

    #[must_use]
    pub fn wall_slot(&self) -> Slot {
        self.wall_slot.load(Ordering::SeqCst)
    }

    /// Slots between the wall clock and the head. Zero while keeping up.
    #[must_use]
    pub fn head_distance(&self) -> u64 {
        self.wall_slot().saturating_sub(self.head().slot)
    }

    #[must_use]
    pub fn is_forward_synced(&self) -> bool {
        self.is_forward_synced.load(Ordering::SeqCst)
    }

    pub fn set_forward_synced(&self, is_forward_synced: bool) {
        self.is_forward_synced
            .store(is_forward_synced, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_back_synced(&self) -> bool {
        self.is_back_synced.load(Ordering::SeqCst)
    }

    pub fn set_back_synced(&self, is_back_synced: bool) {
        self.is_back_synced.store(is_back_synced, Ordering::SeqCst);
    }

    /// Whether the head's execution payload has not been fully validated yet.
    #[must_use]
    pub fn is_optimistic(&self) -> bool {
        self.is_optimistic.load(Ordering::SeqCst)
    }

    fn submit_block(
        &self,
        block: Arc<SignedBeaconBlock>,
        blobs: Option<Vec<Arc<BlobSidecar>>>,
        origin: BlockOrigin,
        reply: Option<oneshot::Sender<Result<(), VerifierError>>>,
    ) -> Result<(), VerifierError> {
        self.enqueue(ProcessorMessage::Block {
            block,
            blobs,
            origin,
            reply,
        })
    }

    fn enqueue(&self, message: ProcessorMessage) -> Result<(), VerifierError> {
        // A disconnected queue only happens during shutdown; submitters treat
        // it the same way as a full one.
        self.processor_tx
            .try_send(message)
            .map_err(|_| VerifierError::QueueFull)
    }
}
