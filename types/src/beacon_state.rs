use serde::{Deserialize, Serialize};

use crate::{
    consts::{
        EFFECTIVE_BALANCE_INCREMENT, HYSTERESIS_DOWNWARD_MULTIPLIER, HYSTERESIS_QUOTIENT,
        HYSTERESIS_UPWARD_MULTIPLIER,
    },
    containers::{Checkpoint, Validator},
    misc,
    nonstandard::Phase,
    primitives::{Epoch, Gwei, ParticipationFlags, Slot, UnixSeconds, ValidatorIndex, H256},
};

/// The slice of a beacon state the orchestrator reads.
///
/// The full state and its transition function live in an external library.
/// This type carries only the registry-level fields that duty scheduling,
/// fork choice and gossip control need to observe.
#[derive(Clone, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct BeaconState {
    pub phase: Phase,
    pub slot: Slot,
    pub genesis_time: UnixSeconds,
    pub genesis_validators_root: H256,
    pub validators: Vec<Validator>,
    pub balances: Vec<Gwei>,
    pub inactivity_scores: Vec<u64>,
    pub current_epoch_participation: Vec<ParticipationFlags>,
    pub current_sync_committee: Vec<ValidatorIndex>,
    pub finalized_checkpoint: Checkpoint,
}

impl BeaconState {
    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        misc::compute_epoch_at_slot(self.slot)
    }

    #[must_use]
    pub fn active_validator_indices(&self, epoch: Epoch) -> Vec<ValidatorIndex> {
        self.validators
            .iter()
            .enumerate()
            .filter(|(_, validator)| validator.is_active_at(epoch))
            .map(|(index, _)| index as ValidatorIndex)
            .collect()
    }

    /// RANDAO-style seed for committee shuffling in `epoch`.
    #[must_use]
    pub fn shuffling_seed(&self, epoch: Epoch) -> H256 {
        hashing::hash_with_index(self.genesis_validators_root, epoch)
    }

    #[must_use]
    pub fn participation_flags(&self, validator_index: ValidatorIndex) -> ParticipationFlags {
        self.current_epoch_participation
            .get(validator_index as usize)
            .copied()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn inactivity_score(&self, validator_index: ValidatorIndex) -> u64 {
        self.inactivity_scores
            .get(validator_index as usize)
            .copied()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn balance(&self, validator_index: ValidatorIndex) -> Gwei {
        self.balances
            .get(validator_index as usize)
            .copied()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn effective_balance(&self, validator_index: ValidatorIndex) -> Gwei {
        self.validators
            .get(validator_index as usize)
            .map(|validator| validator.effective_balance)
            .unwrap_or_default()
    }

    /// Whether the balance of a validator is far enough from the effective
    /// balance hysteresis thresholds that the next epoch transition cannot
    /// change its effective balance.
    #[must_use]
    pub fn balance_within_hysteresis(&self, validator_index: ValidatorIndex) -> bool {
        let balance = self.balance(validator_index);
        let effective_balance = self.effective_balance(validator_index);

        let hysteresis_increment = EFFECTIVE_BALANCE_INCREMENT / HYSTERESIS_QUOTIENT;
        let downward_threshold = hysteresis_increment * HYSTERESIS_DOWNWARD_MULTIPLIER;
        let upward_threshold = hysteresis_increment * HYSTERESIS_UPWARD_MULTIPLIER;

        balance + downward_threshold > effective_balance
            && effective_balance + upward_threshold > balance
    }
}

#[cfg(test)]
mod tests {
    use crate::consts::{FAR_FUTURE_EPOCH, MAX_EFFECTIVE_BALANCE};
    use crate::primitives::PublicKeyBytes;

    use super::*;

    fn validator(effective_balance: Gwei) -> Validator {
        Validator {
            pubkey: PublicKeyBytes::zero(),
            effective_balance,
            activation_epoch: 0,
            exit_epoch: FAR_FUTURE_EPOCH,
            slashed: false,
        }
    }

    #[test]
    fn balance_within_hysteresis_holds_for_balance_at_effective_balance() {
        let state = BeaconState {
            validators: vec![validator(MAX_EFFECTIVE_BALANCE)],
            balances: vec![MAX_EFFECTIVE_BALANCE],
            ..Default::default()
        };

        assert!(state.balance_within_hysteresis(0));
    }

    #[test]
    fn balance_within_hysteresis_fails_near_downward_threshold() {
        let state = BeaconState {
            validators: vec![validator(MAX_EFFECTIVE_BALANCE)],
            balances: vec![MAX_EFFECTIVE_BALANCE - EFFECTIVE_BALANCE_INCREMENT],
            ..Default::default()
        };

        assert!(!state.balance_within_hysteresis(0));
    }
}
