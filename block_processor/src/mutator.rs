use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Receiver,
        Arc,
    },
    time::Instant,
};

use arc_swap::ArcSwap;
use block_pool::{BlobQuarantine, BlockQuarantine, QuarantineRejection};
use chain_dag::{ChainDag, DagError, HeadInfo, Storage};
use clock::Tick;
use events::{
    BlockEvent, ChainReorgEvent, Event, EventChannels, FinalizedCheckpointEvent, HeadEvent,
};
use execution_engine::ExecutionEngine;
use futures::channel::mpsc::UnboundedSender;
use log::{debug, info, warn};
use metrics::Metrics;
use std_ext::ArcExt as _;
use types::{
    combined::SignedBeaconBlock,
    containers::{BlobIdentifier, BlobSidecar, Checkpoint},
    misc,
    nonstandard::Phase,
    primitives::{PeerId, H256},
};

use crate::{
    messages::{BlockReply, P2pMessage, ProcessorMessage},
    misc::{BlockOrigin, VerifierError},
    state_transition::StateTransition,
};

/// Owns all mutable consensus state. Exactly one state transition proceeds at
/// a time; everything else observes snapshots published through an
/// [`ArcSwap`].
pub struct Mutator<S, E> {
    dag: ChainDag,
    dag_snapshot: Arc<ArcSwap<ChainDag>>,
    blob_quarantine: BlobQuarantine,
    block_quarantine: BlockQuarantine,
    storage: Arc<Storage>,
    state_transition: S,
    execution_engine: E,
    event_channels: Arc<EventChannels>,
    needs_pruning: Arc<AtomicBool>,
    is_optimistic: Arc<AtomicBool>,
    metrics: Option<Arc<Metrics>>,
    rx: Receiver<ProcessorMessage>,
    p2p_tx: UnboundedSender<P2pMessage>,
}

impl<S: StateTransition, E: ExecutionEngine> Mutator<S, E> {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        dag: ChainDag,
        dag_snapshot: Arc<ArcSwap<ChainDag>>,
        storage: Arc<Storage>,
        state_transition: S,
        execution_engine: E,
        event_channels: Arc<EventChannels>,
        needs_pruning: Arc<AtomicBool>,
        is_optimistic: Arc<AtomicBool>,
        metrics: Option<Arc<Metrics>>,
        rx: Receiver<ProcessorMessage>,
        p2p_tx: UnboundedSender<P2pMessage>,
    ) -> Self {
        Self {
            dag,
            dag_snapshot,
            blob_quarantine: BlobQuarantine::default(),
            block_quarantine: BlockQuarantine::default(),
            storage,
            state_transition,
            execution_engine,
            event_channels,
            needs_pruning,
            is_optimistic,
            metrics,
            rx,
            p2p_tx,
        }
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        while let Ok(message) = self.rx.recv() {
            match message {
                ProcessorMessage::Block {
                    block,
                    blobs,
                    origin,
                    reply,
                } => self.handle_block(block, blobs, origin, reply),
                ProcessorMessage::BlobSidecar {
                    blob_sidecar,
                    peer_id,
                } => self.handle_blob_sidecar(blob_sidecar, peer_id),
                ProcessorMessage::AttestationVote {
                    validator_index,
                    beacon_block_root,
                    epoch,
                    weight,
                } => {
                    self.dag
                        .apply_vote(validator_index, beacon_block_root, epoch, weight);
                }
                ProcessorMessage::Tick(tick) => self.handle_tick(tick),
                ProcessorMessage::UpdateHead { wall_slot, reply } => {
                    debug!("updating head at wall slot {wall_slot}");
                    self.update_head_and_emit();
                    reply.send(()).unwrap_or_default();
                }
                ProcessorMessage::AdvanceClearance { next_slot } => {
                    debug!("pre-staging state for slot {next_slot}");
                    self.update_head_and_emit();
                    self.publish_snapshot();
                }
                ProcessorMessage::Prune => self.handle_prune(),
                ProcessorMessage::Stop => break,
            }
        }

        P2pMessage::Stop.send(&self.p2p_tx);

        Ok(())
    }

    fn handle_tick(&mut self, tick: Tick) {
        if tick.is_start_of_slot() {
            self.update_head_and_emit();
        }
    }

    fn handle_block(
        &mut self,
        block: Arc<SignedBeaconBlock>,
        blobs: Option<Vec<Arc<BlobSidecar>>>,
        origin: BlockOrigin,
        reply: Option<BlockReply>,
    ) {
        let started_at = Instant::now();
        let result = self.process_block(&block, blobs, origin);

        if let Some(metrics) = self.metrics.as_ref() {
            metrics
                .block_processing_time
                .observe(started_at.elapsed().as_secs_f64());
        }

        if let Err(error) = result {
            if error.is_peer_fault() {
                if let Some(peer_id) = origin.peer_id() {
                    P2pMessage::PenalizePeer(peer_id, error).send(&self.p2p_tx);
                }
            }

            if let Some(reply) = reply {
                reply.send(Err(error)).unwrap_or_default();
            }

            return;
        }

        self.retry_descendants(block.hash_tree_root(), origin);
        self.publish_snapshot();

        if let Some(reply) = reply {
            reply.send(Ok(())).unwrap_or_default();
        }
    }

    fn process_block(
        &mut self,
        block: &Arc<SignedBeaconBlock>,
        blobs: Option<Vec<Arc<BlobSidecar>>>,
        origin: BlockOrigin,
    ) -> Result<(), VerifierError> {
        let block_root = block.hash_tree_root();
        let block_slot = block.slot();

        if self.dag.contains_block(block_root) {
            return Err(VerifierError::Duplicate);
        }

        if block_slot <= self.dag.finalized_slot() {
            return Err(VerifierError::UnviableFork);
        }

        // Deneb blocks are only processed once their blobs are available.
        let blobs = match blobs {
            Some(blobs) => blobs,
            None if block.phase() >= Phase::Deneb => {
                if self.blob_quarantine.has_blobs(block) {
                    self.blob_quarantine.pop_blobs(block_root)
                } else {
                    return Err(self.defer_blobless(block, origin));
                }
            }
            None => vec![],
        };

        let Some(parent_state) = self.dag.state_by_root(block.parent_root()) else {
            return Err(self.defer_orphan(block, origin));
        };

        let outcome = match self.state_transition.process_block(&parent_state, block) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!("invalid block {block_root:?} at slot {block_slot}: {error:#}");
                return Err(VerifierError::Invalid);
            }
        };

        if let Some(execution_block_hash) = block.execution_block_hash() {
            match self.execution_engine.notify_new_payload(execution_block_hash) {
                Ok(payload_status) if payload_status.is_invalid() => {
                    warn!("execution payload of block {block_root:?} is invalid");
                    return Err(VerifierError::Invalid);
                }
                Ok(payload_status) => {
                    self.is_optimistic
                        .store(!payload_status.is_valid(), Ordering::SeqCst);
                }
                Err(error) => {
                    // An unreachable execution layer leaves the node
                    // optimistic, never rejects the block.
                    debug!("execution engine is unreachable: {error:#}");
                    self.is_optimistic.store(true, Ordering::SeqCst);
                }
            }
        }

        match self.dag.insert(block.clone_arc(), outcome.post_state) {
            Ok(_) => {}
            Err(DagError::Duplicate) => return Err(VerifierError::Duplicate),
            Err(DagError::MissingParent) => return Err(self.defer_orphan(block, origin)),
            Err(DagError::UnviableFork) => return Err(VerifierError::UnviableFork),
        }

        if let Err(error) = self.storage.save_block(block) {
            warn!("failed to persist block {block_root:?}: {error:#}");
        }

        if let Err(error) = self.storage.save_blob_sidecars(blobs) {
            warn!("failed to persist blob sidecars of {block_root:?}: {error:#}");
        }

        self.event_channels.publish(Event::Block(BlockEvent {
            slot: block_slot,
            block: block_root,
        }));

        self.advance_finalization(block_root, outcome.finalized_checkpoint);
        self.update_head_and_emit();

        Ok(())
    }

    fn defer_blobless(&mut self, block: &Arc<SignedBeaconBlock>, origin: BlockOrigin) -> VerifierError {
        let record = self.blob_quarantine.fetch_record(block);
        let finalized_slot = self.dag.finalized_slot();

        match self.block_quarantine.add_blobless(finalized_slot, block.clone_arc()) {
            Ok(()) => {
                let identifiers = record
                    .missing_indices
                    .into_iter()
                    .map(|index| BlobIdentifier {
                        block_root: record.block_root,
                        index,
                    })
                    .collect();

                P2pMessage::BlobsNeeded(identifiers, block.slot(), origin.peer_id())
                    .send(&self.p2p_tx);

                VerifierError::MissingParent
            }
            Err(QuarantineRejection::UnviableFork) => VerifierError::UnviableFork,
            Err(QuarantineRejection::Full) => VerifierError::MissingParent,
        }
    }

    fn defer_orphan(&mut self, block: &Arc<SignedBeaconBlock>, origin: BlockOrigin) -> VerifierError {
        let parent_root = block.parent_root();
        let finalized_slot = self.dag.finalized_slot();

        match self.block_quarantine.add_orphan(finalized_slot, block.clone_arc()) {
            Ok(()) => {
                P2pMessage::BlockNeeded(parent_root, origin.peer_id()).send(&self.p2p_tx);
                VerifierError::MissingParent
            }
            Err(QuarantineRejection::UnviableFork) => VerifierError::UnviableFork,
            Err(QuarantineRejection::Full) => VerifierError::MissingParent,
        }
    }

    fn handle_blob_sidecar(&mut self, blob_sidecar: Arc<BlobSidecar>, _peer_id: Option<PeerId>) {
        let block_root = blob_sidecar.block_root();

        self.blob_quarantine.put(blob_sidecar);

        // A block may be waiting for exactly this blob.
        let Some(block) = self.block_quarantine.take_blobless(block_root) else {
            return;
        };

        if self.blob_quarantine.has_blobs(&block) {
            debug!("blobs for quarantined block {block_root:?} are complete; retrying");
            self.handle_block(block, None, BlockOrigin::Own, None);
        } else if let Err(rejection) = self
            .block_quarantine
            .add_blobless(self.dag.finalized_slot(), block)
        {
            debug!("failed to requarantine blobless block {block_root:?}: {rejection}");
        }
    }

    /// Retries quarantined blocks that were waiting for `root`, breadth first.
    fn retry_descendants(&mut self, root: H256, origin: BlockOrigin) {
        let mut parents = VecDeque::from([root]);

        while let Some(parent_root) = parents.pop_front() {
            for child in self.block_quarantine.take_children(parent_root) {
                let child_root = child.hash_tree_root();

                if self.process_block(&child, None, origin).is_ok() {
                    parents.push_back(child_root);
                }
            }
        }
    }

    fn advance_finalization(&mut self, block_root: H256, checkpoint: Checkpoint) {
        let checkpoint = if checkpoint.root.is_zero() {
            let Some(ancestor) = self.dag.ancestor_at_or_before(
                block_root,
                misc::compute_start_slot_at_epoch(checkpoint.epoch),
            ) else {
                return;
            };

            Checkpoint {
                epoch: checkpoint.epoch,
                root: ancestor.root,
            }
        } else {
            checkpoint
        };

        if !self.dag.update_finalized(checkpoint) {
            return;
        }

        info!(
            "finalized checkpoint advanced to epoch {} ({:?})",
            checkpoint.epoch, checkpoint.root,
        );

        self.needs_pruning.store(true, Ordering::SeqCst);
        self.block_quarantine.prune(self.dag.finalized_slot());

        if let Some(finalized_block_hash) = self
            .dag
            .block_by_root(checkpoint.root)
            .and_then(|block| block.execution_block_hash())
        {
            let head_block_hash = self
                .dag
                .head_block()
                .execution_block_hash()
                .unwrap_or(finalized_block_hash);

            if let Err(error) = self
                .execution_engine
                .notify_forkchoice_updated(head_block_hash, finalized_block_hash)
            {
                debug!("execution engine is unreachable: {error:#}");
            }
        }

        P2pMessage::FinalizedCheckpoint(checkpoint).send(&self.p2p_tx);

        self.event_channels
            .publish(Event::FinalizedCheckpoint(FinalizedCheckpointEvent {
                block: checkpoint.root,
                epoch: checkpoint.epoch,
            }));

        if let Some(metrics) = self.metrics.as_ref() {
            metrics.finalized_epoch.set(checkpoint.epoch as i64);
        }
    }

    fn update_head_and_emit(&mut self) {
        let old_head = self.dag.head_info();
        let new_head = self.dag.select_head();

        if old_head == new_head {
            return;
        }

        debug!(
            "head changed from {:?} to {:?} at slot {}",
            old_head.root, new_head.root, new_head.slot,
        );

        self.event_channels.publish(Event::Head(HeadEvent {
            slot: new_head.slot,
            block: new_head.root,
            previous_head: old_head.root,
            epoch_transition: misc::is_epoch_start(new_head.slot),
        }));

        // A head that does not descend from the previous head is a reorg.
        if !self.dag.is_ancestor(old_head.root, new_head.root) {
            let common_ancestor = self
                .dag
                .common_ancestor(old_head.root, new_head.root)
                .unwrap_or(HeadInfo {
                    root: self.dag.finalized_root(),
                    slot: self.dag.finalized_slot(),
                });

            info!(
                "chain reorganization at slot {} (depth: {})",
                new_head.slot,
                old_head.slot.saturating_sub(common_ancestor.slot),
            );

            self.event_channels
                .publish(Event::ChainReorg(ChainReorgEvent {
                    slot: new_head.slot,
                    depth: old_head.slot.saturating_sub(common_ancestor.slot),
                    old_head_block: old_head.root,
                    new_head_block: new_head.root,
                    common_ancestor: common_ancestor.root,
                    epoch: misc::compute_epoch_at_slot(new_head.slot),
                }));
        }

        if let Some(metrics) = self.metrics.as_ref() {
            metrics.set_head_slot(new_head.slot);
        }

        self.publish_snapshot();
    }

    fn handle_prune(&mut self) {
        let pruned = self.dag.prune_finalized();

        if pruned > 0 {
            debug!("pruned {pruned} block(s) from the block tree");
            self.publish_snapshot();
        }
    }

    fn publish_snapshot(&self) {
        self.dag_snapshot.store(Arc::new(self.dag.clone()));
    }
}
