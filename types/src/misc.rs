//! Slot and epoch arithmetic shared across the workspace.

use anyhow::Result;

use crate::{
    config::Config,
    consts::{
        ATTESTATION_SUBNET_COUNT, EPOCHS_PER_SUBNET_SUBSCRIPTION,
        EPOCHS_PER_SYNC_COMMITTEE_PERIOD, SLOTS_PER_EPOCH, SUBNETS_PER_NODE,
    },
    primitives::{
        CommitteeIndex, Epoch, NodeId, Slot, SubnetId, SyncCommitteePeriod, UnixSeconds,
    },
};

#[must_use]
pub const fn compute_epoch_at_slot(slot: Slot) -> Epoch {
    slot / SLOTS_PER_EPOCH.get()
}

#[must_use]
pub const fn compute_start_slot_at_epoch(epoch: Epoch) -> Slot {
    epoch * SLOTS_PER_EPOCH.get()
}

#[must_use]
pub const fn is_epoch_start(slot: Slot) -> bool {
    slot % SLOTS_PER_EPOCH.get() == 0
}

#[must_use]
pub const fn slots_since_epoch_start(slot: Slot) -> u64 {
    slot % SLOTS_PER_EPOCH.get()
}

#[must_use]
pub const fn sync_committee_period(epoch: Epoch) -> SyncCommitteePeriod {
    epoch / EPOCHS_PER_SYNC_COMMITTEE_PERIOD
}

/// Returns the epoch at which the sync committee period containing `epoch` ends,
/// if that boundary is at most `lookahead` epochs away.
#[must_use]
pub fn near_sync_committee_period_boundary(epoch: Epoch, lookahead: u64) -> Option<Epoch> {
    let next_period_epoch = (sync_committee_period(epoch) + 1) * EPOCHS_PER_SYNC_COMMITTEE_PERIOD;
    (next_period_epoch - epoch <= lookahead).then_some(next_period_epoch)
}

#[must_use]
pub fn compute_timestamp_at_slot(config: &Config, genesis_time: UnixSeconds, slot: Slot) -> UnixSeconds {
    genesis_time + slot * config.seconds_per_slot.get()
}

#[must_use]
pub const fn compute_subnet_for_attestation(
    committees_at_slot: u64,
    slot: Slot,
    committee_index: CommitteeIndex,
) -> SubnetId {
    let slots_since_epoch_start = slots_since_epoch_start(slot);
    let committees_since_epoch_start = committees_at_slot * slots_since_epoch_start;

    (committees_since_epoch_start + committee_index) % ATTESTATION_SUBNET_COUNT
}

/// Long-lived attestation subnets this node advertises for the given epoch.
///
/// The assignment rotates every `EPOCHS_PER_SUBNET_SUBSCRIPTION` epochs and is
/// a pure function of the node ID, so peers can be discovered by subnet.
pub fn compute_subscribed_subnets(node_id: NodeId, epoch: Epoch) -> Result<Vec<SubnetId>> {
    let node_id_prefix = (node_id >> 248_u32).low_u64();
    let permutation_index = epoch / EPOCHS_PER_SUBNET_SUBSCRIPTION + node_id_prefix;

    (0..SUBNETS_PER_NODE)
        .map(|index| {
            let seed = hashing::hash_with_index(Default::default(), permutation_index + index);
            let subnet = u64::from_le_bytes(
                seed.as_bytes()[..8]
                    .try_into()
                    .expect("hash output is at least 8 bytes long"),
            );

            Ok(subnet % ATTESTATION_SUBNET_COUNT)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(0 => 0)]
    #[test_case(31 => 0)]
    #[test_case(32 => 1)]
    #[test_case(5_000_000 => 156_250)]
    fn epoch_at_slot(slot: Slot) -> Epoch {
        compute_epoch_at_slot(slot)
    }

    #[test]
    fn subscribed_subnets_are_stable_within_a_subscription_period() {
        let node_id = NodeId::from(0x1234_5678_u64) << 200;

        let first = compute_subscribed_subnets(node_id, 10).expect("subnet count is small");
        let second = compute_subscribed_subnets(node_id, 11).expect("subnet count is small");

        assert_eq!(first.len(), SUBNETS_PER_NODE as usize);
        assert_eq!(first, second);
    }

    #[test]
    fn near_sync_committee_period_boundary_detects_approaching_boundary() {
        assert_eq!(near_sync_committee_period_boundary(255, 1), Some(256));
        assert_eq!(near_sync_committee_period_boundary(254, 1), None);
        assert_eq!(near_sync_committee_period_boundary(256, 1), None);
    }
}
