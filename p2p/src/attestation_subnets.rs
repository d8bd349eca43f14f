use anyhow::Result;
use types::{
    consts::ATTESTATION_SUBNET_COUNT,
    misc,
    primitives::{NodeId, Slot, SubnetId},
};

use crate::misc::AttestationSubnetActions;

use AttestationSubnetState::{Irrelevant, Persistent, Subscribed};

/// How long a duty-driven subscription outlives the duty slot.
const SUBSCRIPTION_EXTRA_SLOTS: u64 = 1;

#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(test, derive(Debug))]
pub enum AttestationSubnetState {
    /// Not subscribed to the subnet.
    #[default]
    Irrelevant,
    /// Subscribed for upcoming duties.
    Subscribed { expiration: Slot },
    /// Subscribed long-term and advertising the subscription in the ENR.
    Persistent { expiration: Slot },
}

impl AttestationSubnetState {
    #[must_use]
    pub fn max_expiration(self, other_expiration: Slot) -> Slot {
        match self {
            Irrelevant => other_expiration,
            Subscribed { expiration } | Persistent { expiration } => {
                other_expiration.max(expiration)
            }
        }
    }

    const fn is_subscribed(self) -> bool {
        matches!(self, Subscribed { .. } | Persistent { .. })
    }

    const fn is_persistent(self) -> bool {
        matches!(self, Persistent { .. })
    }
}

#[derive(Clone, Copy)]
pub struct AttestationSubnets {
    states: [AttestationSubnetState; ATTESTATION_SUBNET_COUNT as usize],
    // Tracks whether persistent subnets were initialized so the node can
    // subscribe to them mid-epoch on startup.
    initialized_persistent: bool,
    node_id: NodeId,
    subscribe_to_all: bool,
}

impl AttestationSubnets {
    #[must_use]
    pub fn new(node_id: NodeId, subscribe_to_all: bool) -> Self {
        Self {
            states: [AttestationSubnetState::default(); ATTESTATION_SUBNET_COUNT as usize],
            initialized_persistent: false,
            node_id,
            subscribe_to_all,
        }
    }

    /// Advances subnet states to `slot` and applies duty-driven
    /// subscriptions. `duty_subnets` are the subnets of upcoming attestation
    /// duties together with the slot of the duty.
    pub fn on_slot(
        &mut self,
        slot: Slot,
        duty_subnets: impl IntoIterator<Item = (SubnetId, Slot)>,
    ) -> Result<AttestationSubnetActions> {
        let old = *self;

        if self.subscribe_to_all {
            let expiration = misc::compute_start_slot_at_epoch(misc::compute_epoch_at_slot(slot) + 1);
            self.states = [Persistent { expiration }; ATTESTATION_SUBNET_COUNT as usize];
            return Ok(self.actions(old));
        }

        for state in &mut self.states {
            match *state {
                Subscribed { expiration } | Persistent { expiration } if expiration <= slot => {
                    *state = Irrelevant;
                }
                _ => {}
            }
        }

        if !self.initialized_persistent || misc::is_epoch_start(slot) {
            self.initialized_persistent = true;

            let current_epoch = misc::compute_epoch_at_slot(slot);
            let expiration = misc::compute_start_slot_at_epoch(current_epoch + 1);

            for subnet_id in misc::compute_subscribed_subnets(self.node_id, current_epoch)? {
                let position = usize::try_from(subnet_id)?;

                self.states[position] = Persistent {
                    expiration: self.states[position].max_expiration(expiration),
                };
            }
        }

        for (subnet_id, duty_slot) in duty_subnets {
            let position = usize::try_from(subnet_id)?;
            let subnet_state = &mut self.states[position];
            let expiration = duty_slot + SUBSCRIPTION_EXTRA_SLOTS;

            *subnet_state = match *subnet_state {
                // An existing persistent subscription covers the duty.
                Persistent { expiration } => Persistent { expiration },
                Subscribed { .. } | Irrelevant => Subscribed {
                    expiration: subnet_state.max_expiration(expiration),
                },
            };
        }

        Ok(self.actions(old))
    }

    /// Subnets currently subscribed, persistent or not.
    pub fn subscribed_subnets(&self) -> impl Iterator<Item = SubnetId> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, state)| state.is_subscribed())
            .map(|(subnet_id, _)| subnet_id as SubnetId)
    }

    fn actions(self, old: Self) -> AttestationSubnetActions {
        let subscriptions = (0..)
            .zip(old.states)
            .zip(self.states)
            .filter_map(|((subnet_id, old_state), new_state)| {
                (old_state.is_subscribed() != new_state.is_subscribed())
                    .then_some((subnet_id, new_state.is_subscribed()))
            })
            .collect();

        let enr = (0..)
            .zip(old.states)
            .zip(self.states)
            .filter_map(|((subnet_id, old_state), new_state)| {
                (old_state.is_persistent() != new_state.is_persistent())
                    .then_some((subnet_id, new_state.is_persistent()))
            })
            .collect();

        AttestationSubnetActions { subscriptions, enr }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn node_id() -> NodeId {
        NodeId::from(0x42_u64) << 240
    }

    #[test]
    fn persistent_subnets_are_subscribed_on_the_first_slot() -> Result<()> {
        let mut subnets = AttestationSubnets::new(node_id(), false);

        let actions = subnets.on_slot(5, [])?;

        let subscribed = actions
            .subscriptions
            .iter()
            .filter(|(_, subscribe)| **subscribe)
            .count();

        assert_eq!(subscribed, 2);
        assert_eq!(actions.enr.len(), 2);
        assert!(actions.enr.values().all(|advertised| *advertised));

        Ok(())
    }

    #[test]
    fn duty_subscriptions_expire_after_their_slot() -> Result<()> {
        let mut subnets = AttestationSubnets::new(node_id(), false);
        let stability = subnets.on_slot(1, [])?;

        let stability_ids = stability
            .subscriptions
            .keys()
            .copied()
            .collect::<BTreeSet<_>>();

        // Pick a duty subnet that is not a stability subnet.
        let duty_subnet = (0..ATTESTATION_SUBNET_COUNT)
            .find(|subnet_id| !stability_ids.contains(subnet_id))
            .expect("there are more subnets than stability subnets");

        let actions = subnets.on_slot(2, [(duty_subnet, 4)])?;

        assert_eq!(actions.subscriptions.get(&duty_subnet), Some(&true));
        assert!(actions.enr.is_empty());

        // Still subscribed at the duty slot.
        let actions = subnets.on_slot(4, [])?;
        assert_eq!(actions.subscriptions.get(&duty_subnet), None);

        // Expired one slot after the duty.
        let actions = subnets.on_slot(5, [])?;
        assert_eq!(actions.subscriptions.get(&duty_subnet), Some(&false));

        Ok(())
    }

    #[test]
    fn identical_inputs_produce_no_actions_on_the_second_call() -> Result<()> {
        let mut subnets = AttestationSubnets::new(node_id(), false);

        subnets.on_slot(1, [(7, 3)])?;
        let repeat = subnets.on_slot(1, [(7, 3)])?;

        assert!(repeat.is_empty());

        Ok(())
    }

    #[test]
    fn subscribe_to_all_subscribes_every_subnet_persistently() -> Result<()> {
        let mut subnets = AttestationSubnets::new(node_id(), true);

        let actions = subnets.on_slot(0, [])?;

        assert_eq!(
            actions.subscriptions.len() as u64,
            ATTESTATION_SUBNET_COUNT,
        );
        assert!(actions.subscriptions.values().all(|subscribe| *subscribe));

        Ok(())
    }
}
