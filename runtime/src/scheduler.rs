use core::time::Duration;
use std::{sync::Arc, time::Instant};

use anyhow::Result;
use block_processor::Controller;
use chain_dag::Storage;
use clock::Tick;
use consensus::ConsensusManager;
use futures::{channel::mpsc::UnboundedSender, select, stream::StreamExt as _};
use log::{debug, info, warn};
use metrics::Metrics;
use p2p::{GossipAction, GossipController, P2pToSync};
use tokio_stream::wrappers::IntervalStream;
use types::{
    config::Config,
    misc,
    primitives::{Epoch, Slot, UnixSeconds},
};
use validator::DutyDispatcher;

use crate::{
    node_config::HistoryMode,
    status::{NodeStatus, StatusCell},
};

/// Drives the per-slot control flow from the wall clock.
///
/// All consensus control plane work funnels through this single task;
/// everything it owns is touched from here only.
pub struct SlotScheduler {
    config: Arc<Config>,
    genesis_time: UnixSeconds,
    controller: Arc<Controller>,
    consensus_manager: ConsensusManager,
    gossip_controller: GossipController,
    duty_dispatcher: DutyDispatcher,
    storage: Arc<Storage>,
    status: Arc<StatusCell>,
    history_mode: HistoryMode,
    stop_at_epoch: Option<Epoch>,
    metrics: Option<Arc<Metrics>>,
    p2p_to_sync_tx: UnboundedSender<P2pToSync>,
    gossip_actions_tx: UnboundedSender<GossipAction>,
    last_slot: Slot,
    last_finalized_epoch: Epoch,
    was_forward_synced: bool,
}

impl SlotScheduler {
    #[expect(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        genesis_time: UnixSeconds,
        controller: Arc<Controller>,
        consensus_manager: ConsensusManager,
        gossip_controller: GossipController,
        duty_dispatcher: DutyDispatcher,
        storage: Arc<Storage>,
        status: Arc<StatusCell>,
        history_mode: HistoryMode,
        stop_at_epoch: Option<Epoch>,
        metrics: Option<Arc<Metrics>>,
        p2p_to_sync_tx: UnboundedSender<P2pToSync>,
        gossip_actions_tx: UnboundedSender<GossipAction>,
    ) -> Self {
        let last_finalized_epoch = controller.finalized_checkpoint().epoch;

        Self {
            config,
            genesis_time,
            controller,
            consensus_manager,
            gossip_controller,
            duty_dispatcher,
            storage,
            status,
            history_mode,
            stop_at_epoch,
            metrics,
            p2p_to_sync_tx,
            gossip_actions_tx,
            last_slot: 0,
            last_finalized_epoch,
            was_forward_synced: false,
        }
    }

    #[must_use]
    pub const fn gossip_controller(&self) -> &GossipController {
        &self.gossip_controller
    }

    #[must_use]
    pub const fn consensus_manager(&self) -> &ConsensusManager {
        &self.consensus_manager
    }

    /// The slot loop: wakes at every slot start and runs the slot handler
    /// over the full slot. `on_slot_start(s + 1)` is never entered before
    /// `on_slot_end(s)` has returned.
    pub async fn run_slot_loop(mut self) -> Result<()> {
        let mut ticks = clock::ticks(&self.config, self.genesis_time)?.fuse();

        while self.status.is_running() {
            select! {
                tick = ticks.select_next_some() => {
                    let tick = tick?;

                    self.controller.on_tick(tick);

                    if tick.is_start_of_slot() {
                        let last_slot = self.last_slot;
                        self.last_slot = tick.slot;

                        if let Err(error) = self.on_slot_start(tick, last_slot).await {
                            warn!("slot {} processing failed: {error:#}", tick.slot);
                            continue;
                        }

                        if let Err(error) = self.on_slot_end(tick.slot).await {
                            warn!("end of slot {} processing failed: {error:#}", tick.slot);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// The second loop: updates liveness metrics and checks the synced-epoch
    /// stop condition once per second.
    pub async fn run_second_loop(
        controller: Arc<Controller>,
        status: Arc<StatusCell>,
        stop_at_synced_epoch: Option<Epoch>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<()> {
        let mut interval =
            IntervalStream::new(tokio::time::interval(Duration::from_secs(1))).fuse();

        let mut last_iteration = Instant::now();

        while status.is_running() {
            interval.select_next_some().await;

            // The ratio of the actual sleep to one second surfaces event
            // loop starvation.
            let now = Instant::now();

            if let Some(metrics) = metrics.as_ref() {
                metrics
                    .ticks_delay
                    .set(now.duration_since(last_iteration).as_secs_f64());
            }

            last_iteration = now;

            if let Some(stop_epoch) = stop_at_synced_epoch {
                let head = controller.head();

                if controller.is_forward_synced()
                    && misc::compute_epoch_at_slot(head.slot) >= stop_epoch
                {
                    info!("reached synced epoch {stop_epoch}; shutting down");
                    status.transition(NodeStatus::Running, NodeStatus::Stopping);
                }
            }
        }

        Ok(())
    }

    async fn on_slot_start(&mut self, tick: Tick, last_slot: Slot) -> Result<()> {
        let slot = tick.slot;
        let epoch = tick.epoch();

        info!(
            "slot start (slot: {slot}, epoch: {epoch}, head: {:?})",
            self.controller.head().root,
        );

        if let Some(metrics) = self.metrics.as_ref() {
            metrics.set_head_slot(self.controller.head().slot);
        }

        if let Some(stop_epoch) = self.stop_at_epoch {
            if epoch >= stop_epoch {
                info!("reached epoch {stop_epoch}; shutting down");
                self.status
                    .transition(NodeStatus::Running, NodeStatus::Stopping);
                return Ok(());
            }
        }

        P2pToSync::Slot(slot).send(&self.p2p_to_sync_tx);

        if self.consensus_manager.update_head(slot).await.is_err() {
            warn!("head update at slot {slot} was dropped by the block processor");
        }

        // Doppelganger observation only works with gossip flowing, so it is
        // armed when forward sync completes and disarmed when it is lost.
        let is_forward_synced = self.controller.is_forward_synced();

        if is_forward_synced != self.was_forward_synced {
            self.was_forward_synced = is_forward_synced;

            let validator_indices = self.duty_dispatcher.validator_indices();

            if let Some(doppelganger) = self.duty_dispatcher.doppelganger_mut() {
                if is_forward_synced {
                    doppelganger.arm(validator_indices, epoch);
                } else {
                    doppelganger.disarm();
                }
            }
        }

        if tick.is_start_of_epoch() {
            if let Some(doppelganger) = self.duty_dispatcher.doppelganger_mut() {
                doppelganger.on_epoch(epoch);
            }
        }

        self.duty_dispatcher.handle_validator_duties(
            self.consensus_manager.action_tracker(),
            last_slot,
            slot,
        );

        self.duty_dispatcher.maybe_resubmit_registrations(slot);

        Ok(())
    }

    /// End-of-slot housekeeping. The step order is part of the component
    /// contract; reordering breaks the pre-staging of the next slot.
    async fn on_slot_end(&mut self, slot: Slot) -> Result<()> {
        // 1. Wait until aggregates from this slot have propagated.
        self.sleep_until_offset(slot, aggregate_wait_offset(&self.config))
            .await?;

        // 2. Slashing protection pruning, only when finalization advanced.
        let finalized = self.controller.finalized_checkpoint();

        if finalized.epoch > self.last_finalized_epoch {
            self.last_finalized_epoch = finalized.epoch;

            if self.history_mode.is_prune() {
                self.duty_dispatcher
                    .prune_slashing_protection(finalized.epoch);
            }
        }

        // 3. State cache and fork choice pruning.
        self.consensus_manager.prune_state_caches_and_fork_choice();

        // 4. History and blob pruning, kept away from epoch boundaries where
        //    the epoch transition already competes for the processor.
        if self.history_mode.is_prune() && !misc::is_epoch_start(slot + 1) {
            let finalized_slot = misc::compute_start_slot_at_epoch(finalized.epoch);

            self.storage.prune_history(finalized_slot)?;
            self.storage
                .prune_blob_sidecars(misc::compute_epoch_at_slot(slot))?;
        }

        // 5. Flush the write-ahead log.
        self.storage.checkpoint()?;

        // 6. Refresh duty assignments for the next epoch, but only off a head
        //    that is both synced and execution-valid.
        let next_epoch = misc::compute_epoch_at_slot(slot) + 1;

        if self.controller.is_forward_synced() && !self.controller.is_optimistic() {
            let head_state = self.controller.head_state();

            if misc::is_epoch_start(slot + 1) {
                self.consensus_manager
                    .prefetch_shuffling(&head_state, next_epoch);
            }

            let update = self
                .consensus_manager
                .maybe_update_action_tracker_next_epoch(&head_state, next_epoch);

            debug!("action tracker update for epoch {next_epoch}: {update:?}");

            // Sync committee membership rotates at period boundaries and the
            // attached validator set can change at any time, so the duty map
            // is refreshed from the head state alongside the epoch duties.
            self.consensus_manager
                .action_tracker_mut()
                .update_sync_committee_duties(&head_state);
        }

        // 7. Pre-stage the next slot's state shortly before the boundary.
        self.sleep_until_offset(slot, advance_clearance_offset(&self.config))
            .await?;

        self.controller.advance_clearance_state(slot + 1);

        // 8. Advance duty bookkeeping into the next slot.
        self.consensus_manager
            .action_tracker_mut()
            .update_slot(slot + 1);

        // 9. Gossip subscriptions for the next slot, sync committee topics
        //    first. These are applied before the clock reaches the next slot.
        self.update_gossip_for_slot(slot + 1)?;

        Ok(())
    }

    fn update_gossip_for_slot(&mut self, slot: Slot) -> Result<()> {
        let action_tracker = self.consensus_manager.action_tracker();
        let epoch = misc::compute_epoch_at_slot(slot);

        let sync_subnets = action_tracker
            .sync_committee_subnets()
            .into_iter()
            .map(|subnet_id| (subnet_id, epoch + 1))
            .collect::<Vec<_>>();

        let duty_subnets = action_tracker
            .aggregate_subnets(slot)
            .into_iter()
            .map(|subnet_id| (subnet_id, slot))
            .collect::<Vec<_>>();

        let mut actions = self
            .gossip_controller
            .update_sync_committee_topics(slot, sync_subnets);

        let head_distance = self.controller.head_distance();
        let should_sync_optimistically = self.controller.is_optimistic();

        actions.extend(self.gossip_controller.update_gossip_status(
            slot,
            head_distance,
            should_sync_optimistically,
        ));

        actions.extend(
            self.gossip_controller
                .update_attestation_subnets(slot, duty_subnets)?,
        );

        for action in actions {
            if self.gossip_actions_tx.unbounded_send(action).is_err() {
                debug!("send to network failed because the receiver was dropped");
            }
        }

        Ok(())
    }

    async fn sleep_until_offset(&self, slot: Slot, offset: Duration) -> Result<()> {
        let remaining =
            clock::time_until_slot_offset(&self.config, self.genesis_time, slot, offset)?;

        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }

        Ok(())
    }
}

/// Offset within a slot at which end-of-slot housekeeping may begin:
/// the aggregate broadcast point plus half of the remaining slot time.
#[must_use]
pub fn aggregate_wait_offset(config: &Config) -> Duration {
    let slot_duration = config.slot_duration();
    let aggregate_offset = slot_duration * 2 / 3;
    let remaining = slot_duration - aggregate_offset;

    aggregate_offset + remaining / 2
}

/// Offset within a slot at which the next slot's state is pre-staged:
/// one second before the slot ends.
#[must_use]
pub fn advance_clearance_offset(config: &Config) -> Duration {
    config.slot_duration() - Duration::from_secs(1)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(Config::mainnet() => (Duration::from_secs(10), Duration::from_secs(11)))]
    #[test_case(Config::minimal() => (Duration::from_secs(5), Duration::from_secs(5)))]
    fn end_of_slot_offsets(config: Config) -> (Duration, Duration) {
        (
            aggregate_wait_offset(&config),
            advance_clearance_offset(&config),
        )
    }

    #[test]
    fn aggregate_wait_precedes_advance_clearance() {
        for config in [Config::mainnet(), Config::minimal()] {
            assert!(aggregate_wait_offset(&config) <= advance_clearance_offset(&config));
            assert!(advance_clearance_offset(&config) < config.slot_duration());
        }
    }
}
