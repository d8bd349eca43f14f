use std::{collections::HashMap, sync::Arc};

use block_processor::{Controller, VerifierError};
use log::debug;
use types::{
    beacon_state::BeaconState,
    consts::{GENESIS_EPOCH, MAX_EFFECTIVE_BALANCE, TIMELY_SOURCE_FLAG, TIMELY_TARGET_FLAG},
    nonstandard::Phase,
    primitives::{Epoch, Slot},
};

use crate::{action_tracker::ActionTracker, epoch_ref::EpochRef, shuffling::ShufflingRef};

/// Which path a duty update took. Exposed for logging and tests.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ActionTrackerUpdate {
    AlreadyCurrent,
    FastPath,
    Fallback,
}

/// Holds the canonical head reference derived from fork choice, drives duty
/// bookkeeping and initiates pruning after finalization.
pub struct ConsensusManager {
    controller: Arc<Controller>,
    action_tracker: ActionTracker,
    shuffling_cache: HashMap<Epoch, Arc<ShufflingRef>>,
}

impl ConsensusManager {
    #[must_use]
    pub fn new(controller: Arc<Controller>, action_tracker: ActionTracker) -> Self {
        Self {
            controller,
            action_tracker,
            shuffling_cache: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn action_tracker(&self) -> &ActionTracker {
        &self.action_tracker
    }

    pub fn action_tracker_mut(&mut self) -> &mut ActionTracker {
        &mut self.action_tracker
    }

    /// Re-runs fork choice against the wall slot. Head change and reorg
    /// events are published before this returns.
    pub async fn update_head(&self, wall_slot: Slot) -> Result<(), VerifierError> {
        self.controller.update_head(wall_slot).await
    }

    /// Prunes state caches and fork choice if finalization advanced.
    pub fn prune_state_caches_and_fork_choice(&self) {
        self.controller.prune_state_caches_and_fork_choice();
    }

    /// Caches the shuffling for `epoch` computed from `state`, making the
    /// fast duty update path available for that epoch.
    pub fn prefetch_shuffling(&mut self, state: &BeaconState, epoch: Epoch) {
        self.shuffling_cache
            .entry(epoch)
            .or_insert_with(|| ShufflingRef::compute(state, epoch));

        self.shuffling_cache
            .retain(|cached_epoch, _| *cached_epoch + 2 > epoch);
    }

    /// Refreshes the action tracker for `next_epoch`.
    ///
    /// The fast path avoids computing a full [`EpochRef`] when the cached
    /// shuffling alone suffices. It applies iff all of:
    /// - the state is at least Altair,
    /// - the shuffling for `next_epoch` is cached,
    /// - the first proposer of `next_epoch` passes the stability predicate,
    ///   meaning its duties cannot change between now and the epoch boundary.
    pub fn maybe_update_action_tracker_next_epoch(
        &mut self,
        state: &BeaconState,
        next_epoch: Epoch,
    ) -> ActionTrackerUpdate {
        if self.action_tracker.last_updated_epoch() == Some(next_epoch) {
            return ActionTrackerUpdate::AlreadyCurrent;
        }

        if state.phase >= Phase::Altair {
            if let Some(shuffling) = self.shuffling_cache.get(&next_epoch).cloned() {
                let first_proposer = shuffling.beacon_proposer_index(
                    types::misc::compute_start_slot_at_epoch(next_epoch),
                );

                if let Some(proposer) = first_proposer {
                    if proposer_is_stable(state, proposer) {
                        self.action_tracker
                            .update_actions(&shuffling, &shuffling.proposers());

                        return ActionTrackerUpdate::FastPath;
                    }
                }
            }
        }

        debug!("duty update for epoch {next_epoch} fell back to a full epoch reference");

        let epoch_ref = EpochRef::compute(state, next_epoch);

        self.action_tracker
            .update_actions(&epoch_ref.shuffling, &epoch_ref.proposers);

        ActionTrackerUpdate::Fallback
    }
}

/// Whether the proposer's effective balance provably cannot change in the
/// next epoch transition, which would invalidate a shuffling-only duty
/// computation.
fn proposer_is_stable(state: &BeaconState, proposer: types::primitives::ValidatorIndex) -> bool {
    let participation = state.participation_flags(proposer);
    let timely = TIMELY_SOURCE_FLAG | TIMELY_TARGET_FLAG;

    participation & timely == timely
        && state.effective_balance(proposer) == MAX_EFFECTIVE_BALANCE
        && state.current_epoch() != GENESIS_EPOCH
        && state.inactivity_score(proposer) == 0
        && state.balance_within_hysteresis(proposer)
}

#[cfg(test)]
mod tests {
    use block_processor::TrivialStateTransition;
    use chain_dag::Storage;
    use database::Database;
    use events::EventChannels;
    use execution_engine::NullExecutionEngine;
    use futures::channel::mpsc;
    use types::{
        combined::{BeaconBlock, SignedBeaconBlock},
        config::Config,
        consts::{EFFECTIVE_BALANCE_INCREMENT, FAR_FUTURE_EPOCH, SLOTS_PER_EPOCH},
        containers::Validator,
        primitives::{NodeId, PublicKeyBytes, H256},
    };

    use super::*;

    fn stable_state(validator_count: usize) -> BeaconState {
        BeaconState {
            phase: Phase::Altair,
            slot: SLOTS_PER_EPOCH.get() * 3,
            genesis_validators_root: H256::repeat_byte(1),
            validators: (0..validator_count)
                .map(|_| Validator {
                    pubkey: PublicKeyBytes::zero(),
                    effective_balance: MAX_EFFECTIVE_BALANCE,
                    activation_epoch: 0,
                    exit_epoch: FAR_FUTURE_EPOCH,
                    slashed: false,
                })
                .collect(),
            balances: vec![MAX_EFFECTIVE_BALANCE; validator_count],
            inactivity_scores: vec![0; validator_count],
            current_epoch_participation: vec![
                TIMELY_SOURCE_FLAG | TIMELY_TARGET_FLAG;
                validator_count
            ],
            ..Default::default()
        }
    }

    fn manager() -> ConsensusManager {
        let config = Arc::new(Config::minimal());
        let anchor_block = Arc::new(SignedBeaconBlock::from_block(
            BeaconBlock::empty(Phase::Altair, 0, 0, H256::zero()),
            Default::default(),
        ));
        let anchor_state = Arc::new(stable_state(64));
        let (p2p_tx, _p2p_rx) = mpsc::unbounded();

        let (controller, _handle) = Controller::new(
            config.clone(),
            anchor_block,
            anchor_state,
            Arc::new(Storage::new(config, Database::in_memory())),
            TrivialStateTransition,
            NullExecutionEngine,
            Arc::new(EventChannels::default()),
            None,
            p2p_tx,
        )
        .expect("processor thread starts");

        ConsensusManager::new(
            controller,
            ActionTracker::new(NodeId::from(7_u64), false),
        )
    }

    #[test]
    fn fast_path_is_taken_when_the_first_proposer_is_stable() {
        let mut manager = manager();
        let state = stable_state(64);

        manager.prefetch_shuffling(&state, 4);

        assert_eq!(
            manager.maybe_update_action_tracker_next_epoch(&state, 4),
            ActionTrackerUpdate::FastPath,
        );
        assert_eq!(
            manager.maybe_update_action_tracker_next_epoch(&state, 4),
            ActionTrackerUpdate::AlreadyCurrent,
        );
    }

    #[test]
    fn missing_cached_shuffling_forces_the_fallback() {
        let mut manager = manager();
        let state = stable_state(64);

        assert_eq!(
            manager.maybe_update_action_tracker_next_epoch(&state, 4),
            ActionTrackerUpdate::Fallback,
        );
    }

    #[test]
    fn phase0_states_always_use_the_fallback() {
        let mut manager = manager();
        let mut state = stable_state(64);
        state.phase = Phase::Phase0;

        manager.prefetch_shuffling(&state, 4);

        assert_eq!(
            manager.maybe_update_action_tracker_next_epoch(&state, 4),
            ActionTrackerUpdate::Fallback,
        );
    }

    #[test]
    fn violating_any_stability_condition_forces_the_fallback() {
        let state = stable_state(64);
        let shuffling = ShufflingRef::compute(&state, 4);
        let first_proposer = shuffling
            .beacon_proposer_index(types::misc::compute_start_slot_at_epoch(4))
            .expect("the active set is nonempty");

        let break_participation = |state: &mut BeaconState| {
            state.current_epoch_participation[first_proposer as usize] = TIMELY_SOURCE_FLAG;
        };
        let break_effective_balance = |state: &mut BeaconState| {
            state.validators[first_proposer as usize].effective_balance =
                MAX_EFFECTIVE_BALANCE - EFFECTIVE_BALANCE_INCREMENT;
        };
        let break_genesis_epoch = |state: &mut BeaconState| {
            state.slot = 0;
        };
        let break_inactivity = |state: &mut BeaconState| {
            state.inactivity_scores[first_proposer as usize] = 1;
        };
        let break_hysteresis = |state: &mut BeaconState| {
            state.balances[first_proposer as usize] =
                MAX_EFFECTIVE_BALANCE - EFFECTIVE_BALANCE_INCREMENT;
        };

        let breakers: [&dyn Fn(&mut BeaconState); 5] = [
            &break_participation,
            &break_effective_balance,
            &break_genesis_epoch,
            &break_inactivity,
            &break_hysteresis,
        ];

        for breaker in breakers {
            let mut manager = manager();
            let mut state = stable_state(64);

            breaker(&mut state);
            manager.prefetch_shuffling(&state, 4);

            assert_eq!(
                manager.maybe_update_action_tracker_next_epoch(&state, 4),
                ActionTrackerUpdate::Fallback,
            );
        }
    }
}
