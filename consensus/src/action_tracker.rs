use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use itertools::Itertools as _;
use log::debug;
use types::{
    beacon_state::BeaconState,
    consts::{
        ATTESTATION_SUBNET_COUNT, SLOTS_PER_EPOCH, SYNC_COMMITTEE_SIZE,
        SYNC_COMMITTEE_SUBNET_COUNT, TARGET_AGGREGATORS_PER_COMMITTEE,
    },
    misc,
    primitives::{CommitteeIndex, Epoch, NodeId, Slot, SubnetId, ValidatorIndex},
};

use crate::shuffling::ShufflingRef;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AttestationDuty {
    pub slot: Slot,
    pub committee_index: CommitteeIndex,
    pub committees_at_slot: u64,
    pub position_in_committee: usize,
    pub subnet_id: SubnetId,
    pub is_aggregator: bool,
}

/// Per-epoch duty assignments of the attached validators.
///
/// Touched only from the scheduler. Updated when entering a new epoch or when
/// the validator set of the epoch of interest may have changed; updates are
/// idempotent for unchanged inputs.
pub struct ActionTracker {
    node_id: NodeId,
    subscribe_all_subnets: bool,
    attached_validators: BTreeSet<ValidatorIndex>,
    attesters: BTreeMap<Slot, BTreeMap<ValidatorIndex, AttestationDuty>>,
    proposers: BTreeMap<Slot, ValidatorIndex>,
    /// Sync committee subnets each attached validator serves in.
    sync_subnets: BTreeMap<ValidatorIndex, BTreeSet<SubnetId>>,
    last_updated_epoch: Option<Epoch>,
}

impl ActionTracker {
    #[must_use]
    pub fn new(node_id: NodeId, subscribe_all_subnets: bool) -> Self {
        Self {
            node_id,
            subscribe_all_subnets,
            attached_validators: BTreeSet::new(),
            attesters: BTreeMap::new(),
            proposers: BTreeMap::new(),
            sync_subnets: BTreeMap::new(),
            last_updated_epoch: None,
        }
    }

    pub fn register_validators(
        &mut self,
        validator_indices: impl IntoIterator<Item = ValidatorIndex>,
    ) {
        let before = self.attached_validators.len();

        self.attached_validators.extend(validator_indices);

        if self.attached_validators.len() != before {
            // Duties for the current epoch may be stale now.
            self.last_updated_epoch = None;
        }
    }

    #[must_use]
    pub fn attached_validator_count(&self) -> usize {
        self.attached_validators.len()
    }

    #[must_use]
    pub const fn last_updated_epoch(&self) -> Option<Epoch> {
        self.last_updated_epoch
    }

    /// Rebuilds duty maps for the epoch of `shuffling`. `proposers` are the
    /// proposer indices of that epoch in slot order.
    pub fn update_actions(&mut self, shuffling: &ShufflingRef, proposers: &[ValidatorIndex]) {
        let epoch = shuffling.epoch;
        let start_slot = misc::compute_start_slot_at_epoch(epoch);

        self.attesters
            .retain(|slot, _| misc::compute_epoch_at_slot(*slot) != epoch);
        self.proposers
            .retain(|slot, _| misc::compute_epoch_at_slot(*slot) != epoch);

        for (offset, proposer) in proposers.iter().enumerate() {
            if self.attached_validators.contains(proposer) {
                self.proposers.insert(start_slot + offset as Slot, *proposer);
            }
        }

        for slot in start_slot..start_slot + SLOTS_PER_EPOCH.get() {
            for committee_index in 0..shuffling.committees_per_slot {
                let committee = shuffling.committee(slot, committee_index);

                for (position, validator_index) in committee.iter().enumerate() {
                    if !self.attached_validators.contains(validator_index) {
                        continue;
                    }

                    let duty = AttestationDuty {
                        slot,
                        committee_index,
                        committees_at_slot: shuffling.committees_per_slot,
                        position_in_committee: position,
                        subnet_id: shuffling.subnet_for_committee(slot, committee_index),
                        is_aggregator: is_aggregator(committee.len(), *validator_index, slot),
                    };

                    self.attesters
                        .entry(slot)
                        .or_default()
                        .insert(*validator_index, duty);
                }
            }
        }

        self.last_updated_epoch = Some(epoch);

        debug!(
            "action tracker updated for epoch {epoch}: {} attester duty slot(s), {} proposal(s)",
            self.attesters.len(),
            self.proposers.len(),
        );
    }

    /// Rebuilds sync committee duties of attached validators from the
    /// current sync committee of `state`. A member's subnet is determined by
    /// its position within the committee.
    pub fn update_sync_committee_duties(&mut self, state: &BeaconState) {
        let subcommittee_size = SYNC_COMMITTEE_SIZE / SYNC_COMMITTEE_SUBNET_COUNT;

        let mut duties = BTreeMap::<ValidatorIndex, BTreeSet<SubnetId>>::new();

        for (position, validator_index) in state.current_sync_committee.iter().enumerate() {
            duties
                .entry(*validator_index)
                .or_default()
                .insert(position as SubnetId / subcommittee_size);
        }

        self.update_sync_duties(duties);
    }

    /// Replaces the sync committee subnets of the attached validators.
    pub fn update_sync_duties(
        &mut self,
        duties: impl IntoIterator<Item = (ValidatorIndex, BTreeSet<SubnetId>)>,
    ) {
        self.sync_subnets = duties
            .into_iter()
            .filter(|(validator_index, _)| self.attached_validators.contains(validator_index))
            .collect();
    }

    /// Attached validators serving in the current sync committee, with the
    /// subnets they serve in.
    pub fn sync_duties(&self) -> impl Iterator<Item = (ValidatorIndex, &BTreeSet<SubnetId>)> + '_ {
        self.sync_subnets
            .iter()
            .map(|(validator_index, subnets)| (*validator_index, subnets))
    }

    /// Drops duties for slots before `slot`.
    pub fn update_slot(&mut self, slot: Slot) {
        self.attesters = self.attesters.split_off(&slot);
        self.proposers = self.proposers.split_off(&slot);
    }

    #[must_use]
    pub fn attestation_duties_at(&self, slot: Slot) -> Vec<(ValidatorIndex, AttestationDuty)> {
        self.attesters
            .get(&slot)
            .map(|duties| {
                duties
                    .iter()
                    .map(|(validator_index, duty)| (*validator_index, *duty))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn proposer_at(&self, slot: Slot) -> Option<ValidatorIndex> {
        self.proposers.get(&slot).copied()
    }

    /// Subnets needed to publish and aggregate upcoming attestations.
    #[must_use]
    pub fn aggregate_subnets(&self, slot: Slot) -> BTreeSet<SubnetId> {
        if self.subscribe_all_subnets {
            return (0..ATTESTATION_SUBNET_COUNT).collect();
        }

        self.attesters
            .range(slot..slot + 2)
            .flat_map(|(_, duties)| duties.values())
            .map(|duty| duty.subnet_id)
            .collect()
    }

    /// Long-lived subnets advertised in the ENR, a pure function of node ID
    /// and epoch.
    pub fn stability_subnets(&self, epoch: Epoch) -> Result<BTreeSet<SubnetId>> {
        if self.subscribe_all_subnets {
            return Ok((0..ATTESTATION_SUBNET_COUNT).collect());
        }

        Ok(misc::compute_subscribed_subnets(self.node_id, epoch)?
            .into_iter()
            .collect())
    }

    /// The attestation subnet subscription set for a slot:
    /// aggregate subnets ∪ stability subnets.
    pub fn subscribed_subnets(&self, slot: Slot) -> Result<BTreeSet<SubnetId>> {
        let mut subnets = self.aggregate_subnets(slot);
        subnets.extend(self.stability_subnets(misc::compute_epoch_at_slot(slot))?);
        Ok(subnets)
    }

    #[must_use]
    pub fn sync_committee_subnets(&self) -> BTreeSet<SubnetId> {
        if self.subscribe_all_subnets {
            return (0..SYNC_COMMITTEE_SUBNET_COUNT).collect();
        }

        self.sync_subnets
            .values()
            .flatten()
            .copied()
            .sorted()
            .dedup()
            .collect()
    }
}

/// Aggregator selection. The committee elects on average
/// `TARGET_AGGREGATORS_PER_COMMITTEE` members per slot; the real protocol
/// derives this from a slot signature, which an external signer provides.
fn is_aggregator(committee_size: usize, validator_index: ValidatorIndex, slot: Slot) -> bool {
    let modulo = (committee_size as u64 / TARGET_AGGREGATORS_PER_COMMITTEE).max(1);
    let digest = hashing::hash_with_index(hashing::hash_bytes(&slot.to_le_bytes()), validator_index);
    let value = u64::from_le_bytes(
        digest.as_bytes()[..8]
            .try_into()
            .expect("hash output is at least 8 bytes long"),
    );

    value % modulo == 0
}

#[cfg(test)]
mod tests {
    use types::{
        beacon_state::BeaconState, consts::FAR_FUTURE_EPOCH, containers::Validator,
        primitives::PublicKeyBytes,
    };

    use super::*;

    fn shuffling_for(validator_count: usize, epoch: Epoch) -> std::sync::Arc<ShufflingRef> {
        let state = BeaconState {
            genesis_validators_root: types::primitives::H256::repeat_byte(1),
            validators: (0..validator_count)
                .map(|_| Validator {
                    pubkey: PublicKeyBytes::zero(),
                    effective_balance: 32_000_000_000,
                    activation_epoch: 0,
                    exit_epoch: FAR_FUTURE_EPOCH,
                    slashed: false,
                })
                .collect(),
            ..Default::default()
        };

        ShufflingRef::compute(&state, epoch)
    }

    #[test]
    fn every_attached_validator_gets_one_attestation_duty_per_epoch() {
        let shuffling = shuffling_for(64, 1);
        let mut tracker = ActionTracker::new(NodeId::from(7_u64), false);

        tracker.register_validators([3, 17]);
        tracker.update_actions(&shuffling, &shuffling.proposers());

        let duties = (32..64)
            .flat_map(|slot| tracker.attestation_duties_at(slot))
            .collect::<Vec<_>>();

        assert_eq!(duties.len(), 2);
    }

    #[test]
    fn update_actions_is_idempotent_for_unchanged_inputs() {
        let shuffling = shuffling_for(64, 1);
        let mut tracker = ActionTracker::new(NodeId::from(7_u64), false);

        tracker.register_validators([3, 17]);
        tracker.update_actions(&shuffling, &shuffling.proposers());

        let duties_before = (32..64)
            .map(|slot| tracker.attestation_duties_at(slot))
            .collect::<Vec<_>>();
        let subnets_before = tracker.aggregate_subnets(32);

        tracker.update_actions(&shuffling, &shuffling.proposers());

        let duties_after = (32..64)
            .map(|slot| tracker.attestation_duties_at(slot))
            .collect::<Vec<_>>();

        assert_eq!(duties_before, duties_after);
        assert_eq!(subnets_before, tracker.aggregate_subnets(32));
        assert_eq!(tracker.last_updated_epoch(), Some(1));
    }

    #[test]
    fn update_slot_drops_stale_duties() {
        let shuffling = shuffling_for(64, 0);
        let mut tracker = ActionTracker::new(NodeId::from(7_u64), false);

        tracker.register_validators(0..64);
        tracker.update_actions(&shuffling, &shuffling.proposers());

        assert!(!tracker.attestation_duties_at(3).is_empty());

        tracker.update_slot(10);

        assert!(tracker.attestation_duties_at(3).is_empty());
        assert!(tracker.proposer_at(5).is_none());
        assert!(!tracker.attestation_duties_at(10).is_empty());
    }

    #[test]
    fn sync_committee_duties_come_from_committee_membership() {
        let mut tracker = ActionTracker::new(NodeId::from(7_u64), false);
        tracker.register_validators([3, 17]);

        // Validator 3 serves in two subcommittees; validator 40 is a member
        // but not attached; validator 17 is attached but not a member.
        let mut state = BeaconState::default();
        state.current_sync_committee = vec![9; SYNC_COMMITTEE_SIZE as usize];
        state.current_sync_committee[0] = 3;
        state.current_sync_committee[200] = 3;
        state.current_sync_committee[300] = 40;

        tracker.update_sync_committee_duties(&state);

        assert_eq!(tracker.sync_committee_subnets(), BTreeSet::from([0, 1]));
        assert_eq!(
            tracker.sync_duties().collect::<Vec<_>>(),
            [(3, &BTreeSet::from([0, 1]))],
        );
    }

    #[test]
    fn sync_committee_duty_updates_are_idempotent() {
        let mut tracker = ActionTracker::new(NodeId::from(7_u64), false);
        tracker.register_validators([3]);

        let mut state = BeaconState::default();
        state.current_sync_committee = vec![3; SYNC_COMMITTEE_SIZE as usize];

        tracker.update_sync_committee_duties(&state);
        let subnets = tracker.sync_committee_subnets();

        tracker.update_sync_committee_duties(&state);

        assert_eq!(tracker.sync_committee_subnets(), subnets);
        assert_eq!(
            subnets,
            (0..SYNC_COMMITTEE_SUBNET_COUNT).collect::<BTreeSet<_>>(),
        );
    }

    #[test]
    fn subscribe_all_subnets_covers_every_subnet() {
        let tracker = ActionTracker::new(NodeId::from(7_u64), true);

        assert_eq!(
            tracker.aggregate_subnets(0).len(),
            ATTESTATION_SUBNET_COUNT as usize,
        );
        assert_eq!(
            tracker.sync_committee_subnets().len(),
            SYNC_COMMITTEE_SUBNET_COUNT as usize,
        );
    }

    #[test]
    fn subscribed_subnets_are_the_union_of_aggregate_and_stability_subnets() {
        let shuffling = shuffling_for(64, 0);
        let mut tracker = ActionTracker::new(NodeId::from(7_u64) << 200, false);

        tracker.register_validators([1]);
        tracker.update_actions(&shuffling, &[]);

        let subscribed = tracker.subscribed_subnets(0).expect("subnet count is small");
        let aggregate = tracker.aggregate_subnets(0);
        let stability = tracker.stability_subnets(0).expect("subnet count is small");

        assert_eq!(
            subscribed,
            aggregate.union(&stability).copied().collect::<BTreeSet<_>>(),
        );
        assert!(!stability.is_empty());
    }
}
