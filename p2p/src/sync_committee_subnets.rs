use std::collections::BTreeMap;

use types::{
    consts::SYNC_COMMITTEE_SUBNET_COUNT,
    misc,
    primitives::{Epoch, Slot, SubnetId},
};

use SyncCommitteeSubnetAction::{Subscribe, Unsubscribe};
use SyncCommitteeSubnetState::{Subscribed, Unsubscribed};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncCommitteeSubnetAction {
    Subscribe,
    Unsubscribe,
}

#[derive(Clone, Copy, Default)]
pub enum SyncCommitteeSubnetState {
    #[default]
    Unsubscribed,
    Subscribed {
        expiration: Epoch,
    },
}

impl SyncCommitteeSubnetState {
    #[must_use]
    pub fn max_expiration(self, other_expiration: Epoch) -> Epoch {
        match self {
            Unsubscribed => other_expiration,
            Subscribed { expiration } => other_expiration.max(expiration),
        }
    }

    const fn is_subscribed(self) -> bool {
        matches!(self, Subscribed { .. })
    }
}

#[derive(Clone, Copy, Default)]
pub struct SyncCommitteeSubnets {
    states: [SyncCommitteeSubnetState; SYNC_COMMITTEE_SUBNET_COUNT as usize],
    subscribe_to_all: bool,
}

impl SyncCommitteeSubnets {
    #[must_use]
    pub fn new(subscribe_to_all: bool) -> Self {
        Self {
            states: [SyncCommitteeSubnetState::default(); SYNC_COMMITTEE_SUBNET_COUNT as usize],
            subscribe_to_all,
        }
    }

    /// Expires subscriptions at epoch boundaries.
    pub fn on_slot(&mut self, slot: Slot) -> BTreeMap<SubnetId, SyncCommitteeSubnetAction> {
        if !misc::is_epoch_start(slot) {
            return BTreeMap::new();
        }

        let current_epoch = misc::compute_epoch_at_slot(slot);
        let old = *self;

        if self.subscribe_to_all_if_needed(current_epoch) {
            return self.actions(old);
        }

        for state in &mut self.states {
            if let Subscribed { expiration } = *state {
                if expiration <= current_epoch {
                    *state = Unsubscribed;
                }
            }
        }

        self.actions(old)
    }

    /// Applies the sync committee duties of attached validators.
    pub fn update(
        &mut self,
        current_epoch: Epoch,
        subscriptions: impl IntoIterator<Item = (SubnetId, Epoch)>,
    ) -> BTreeMap<SubnetId, SyncCommitteeSubnetAction> {
        let old = *self;

        if self.subscribe_to_all_if_needed(current_epoch) {
            return self.actions(old);
        }

        for (subnet_id, until_epoch) in subscriptions {
            let subnet_state = &mut self.states[subnet_id as usize];
            let expiration = subnet_state.max_expiration(until_epoch);

            *subnet_state = Subscribed { expiration };
        }

        self.actions(old)
    }

    fn actions(self, old: Self) -> BTreeMap<SubnetId, SyncCommitteeSubnetAction> {
        (0..)
            .zip(old.states)
            .zip(self.states)
            .filter_map(|((subnet_id, old_state), new_state)| {
                let action = match (old_state.is_subscribed(), new_state.is_subscribed()) {
                    (false, true) => Subscribe,
                    (true, false) => Unsubscribe,
                    _ => return None,
                };

                Some((subnet_id, action))
            })
            .collect()
    }

    fn subscribe_to_all_if_needed(&mut self, current_epoch: Epoch) -> bool {
        if !self.subscribe_to_all {
            return false;
        }

        let expiration = current_epoch + 1;

        self.states = [Subscribed { expiration }; SYNC_COMMITTEE_SUBNET_COUNT as usize];

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriptions_last_until_their_expiration_epoch() {
        let mut subnets = SyncCommitteeSubnets::new(false);

        let actions = subnets.update(0, [(1, 2)]);

        assert_eq!(actions.get(&1), Some(&Subscribe));

        // Nothing changes inside the epoch or before expiration.
        assert!(subnets.on_slot(1).is_empty());
        assert!(subnets.on_slot(32).is_empty());

        let actions = subnets.on_slot(64);

        assert_eq!(actions.get(&1), Some(&Unsubscribe));
    }

    #[test]
    fn duplicate_updates_produce_no_actions() {
        let mut subnets = SyncCommitteeSubnets::new(false);

        subnets.update(0, [(2, 5)]);
        let repeat = subnets.update(0, [(2, 5)]);

        assert!(repeat.is_empty());
    }
}
