use std::sync::Arc;

use types::{
    beacon_state::BeaconState,
    consts::{ATTESTATION_SUBNET_COUNT, SHUFFLE_ROUND_COUNT, SLOTS_PER_EPOCH},
    misc,
    primitives::{CommitteeIndex, Epoch, Slot, ValidatorIndex, H256},
};

const TARGET_COMMITTEE_SIZE: u64 = 128;
const MAX_COMMITTEES_PER_SLOT: u64 = 64;

/// The committee shuffling of one epoch.
///
/// Derivable from any state within one epoch of `epoch`, which is what makes
/// the duty update fast path possible: the shuffling for the next epoch can be
/// computed without running the epoch transition.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ShufflingRef {
    pub epoch: Epoch,
    pub seed: H256,
    /// Active validators in shuffled order.
    pub shuffled_indices: Vec<ValidatorIndex>,
    pub committees_per_slot: u64,
}

impl ShufflingRef {
    #[must_use]
    pub fn compute(state: &BeaconState, epoch: Epoch) -> Arc<Self> {
        let seed = state.shuffling_seed(epoch);
        let mut shuffled_indices = state.active_validator_indices(epoch);

        shuffle(&mut shuffled_indices, seed);

        let committees_per_slot = committee_count_per_slot(shuffled_indices.len() as u64);

        Arc::new(Self {
            epoch,
            seed,
            shuffled_indices,
            committees_per_slot,
        })
    }

    /// Members of the committee at `(slot, committee_index)`.
    #[must_use]
    pub fn committee(&self, slot: Slot, committee_index: CommitteeIndex) -> &[ValidatorIndex] {
        let slots_per_epoch = SLOTS_PER_EPOCH.get();
        let committee_count = self.committees_per_slot * slots_per_epoch;
        let validator_count = self.shuffled_indices.len() as u64;

        let index = (slot % slots_per_epoch) * self.committees_per_slot + committee_index;
        let start = (validator_count * index / committee_count) as usize;
        let end = (validator_count * (index + 1) / committee_count) as usize;

        &self.shuffled_indices[start..end]
    }

    /// The proposer for `slot`, selected from the shuffled active set.
    #[must_use]
    pub fn beacon_proposer_index(&self, slot: Slot) -> Option<ValidatorIndex> {
        if self.shuffled_indices.is_empty() {
            return None;
        }

        let digest = hashing::hash_with_index(self.seed, slot);
        let position = u64::from_le_bytes(
            digest.as_bytes()[..8]
                .try_into()
                .expect("hash output is at least 8 bytes long"),
        );

        let index = (position % self.shuffled_indices.len() as u64) as usize;

        Some(self.shuffled_indices[index])
    }

    /// Proposers for every slot of the epoch, in slot order.
    #[must_use]
    pub fn proposers(&self) -> Vec<ValidatorIndex> {
        let start_slot = misc::compute_start_slot_at_epoch(self.epoch);

        (start_slot..start_slot + SLOTS_PER_EPOCH.get())
            .filter_map(|slot| self.beacon_proposer_index(slot))
            .collect()
    }

    /// The attestation subnet for a committee in this shuffling.
    #[must_use]
    pub fn subnet_for_committee(&self, slot: Slot, committee_index: CommitteeIndex) -> u64 {
        let slots_since_epoch_start = slot % SLOTS_PER_EPOCH.get();
        let committees_since_epoch_start = self.committees_per_slot * slots_since_epoch_start;

        (committees_since_epoch_start + committee_index) % ATTESTATION_SUBNET_COUNT
    }
}

const fn committee_count_per_slot(active_validator_count: u64) -> u64 {
    let count = active_validator_count / SLOTS_PER_EPOCH.get() / TARGET_COMMITTEE_SIZE;

    if count == 0 {
        1
    } else if count > MAX_COMMITTEES_PER_SLOT {
        MAX_COMMITTEES_PER_SLOT
    } else {
        count
    }
}

// Swap-or-not shuffle over the whole slice at once.
// See <https://link.springer.com/chapter/10.1007/978-3-642-32009-5_1>.
fn shuffle<T>(slice: &mut [T], seed: H256) {
    let length = slice.len() as u64;

    if length == 0 {
        return;
    }

    for round in 0..SHUFFLE_ROUND_COUNT {
        let round_seed = hashing::hash_with_index(seed, round as u64);
        let pivot = u64::from_le_bytes(
            round_seed.as_bytes()[..8]
                .try_into()
                .expect("hash output is at least 8 bytes long"),
        ) % length;

        for index in 0..length {
            let flip = (pivot + length - index) % length;

            if index >= flip {
                continue;
            }

            let position = index.max(flip);
            let source = hashing::hash_pair(
                round_seed,
                hashing::hash_with_index(H256::zero(), position / 256),
            );
            let byte = source.as_bytes()[((position % 256) / 8) as usize];
            let bit = (byte >> (position % 8)) & 1;

            if bit == 1 {
                slice.swap(index as usize, flip as usize);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use types::{
        consts::FAR_FUTURE_EPOCH,
        containers::Validator,
        primitives::{Gwei, PublicKeyBytes},
    };

    use super::*;

    fn state_with_validators(count: usize) -> BeaconState {
        BeaconState {
            genesis_validators_root: H256::repeat_byte(42),
            validators: (0..count)
                .map(|_| Validator {
                    pubkey: PublicKeyBytes::zero(),
                    effective_balance: 32_000_000_000 as Gwei,
                    activation_epoch: 0,
                    exit_epoch: FAR_FUTURE_EPOCH,
                    slashed: false,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn shuffling_is_a_permutation_of_the_active_set() {
        let state = state_with_validators(100);
        let shuffling = ShufflingRef::compute(&state, 3);

        let mut sorted = shuffling.shuffled_indices.clone();
        sorted.sort_unstable();

        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
        assert_ne!(shuffling.shuffled_indices, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn shuffling_is_deterministic_in_the_seed() {
        let state = state_with_validators(64);

        assert_eq!(
            ShufflingRef::compute(&state, 5),
            ShufflingRef::compute(&state, 5),
        );
        assert_ne!(
            ShufflingRef::compute(&state, 5),
            ShufflingRef::compute(&state, 6),
        );
    }

    #[test]
    fn committees_partition_the_active_set_within_a_slot_range() {
        let state = state_with_validators(200);
        let shuffling = ShufflingRef::compute(&state, 0);

        let mut seen = vec![];

        for slot in 0..SLOTS_PER_EPOCH.get() {
            for committee_index in 0..shuffling.committees_per_slot {
                seen.extend_from_slice(shuffling.committee(slot, committee_index));
            }
        }

        seen.sort_unstable();

        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn proposers_are_selected_for_every_slot_of_the_epoch() {
        let state = state_with_validators(50);
        let shuffling = ShufflingRef::compute(&state, 2);

        assert_eq!(shuffling.proposers().len(), SLOTS_PER_EPOCH.get() as usize);
    }
}
