use std::{collections::BTreeSet, sync::Arc};

use anyhow::Result;
use itertools::Itertools as _;
use log::info;
use types::{
    config::Config,
    misc,
    nonstandard::Phase,
    primitives::{Epoch, Slot, SubnetId, SyncCommitteePeriod, H256},
};

use crate::{
    attestation_subnets::AttestationSubnets,
    gossip_topics::{block_topic_for_phase, core_topics_for_phase, GossipTopic},
    misc::AttestationSubnetActions,
    sync_committee_subnets::{SyncCommitteeSubnetAction, SyncCommitteeSubnets},
};

/// Head distance at which a node stops gossip subscriptions.
const TOPIC_SUBSCRIBE_THRESHOLD: u64 = 64;
/// Extra distance before unsubscribing, so the node does not flap around the
/// threshold.
const HYSTERESIS_BUFFER: u64 = 16;

/// How many epochs before a sync committee period boundary the next period's
/// subnets are joined.
const SYNC_COMMITTEE_LOOKAHEAD_EPOCHS: u64 = 1;

/// The consensus forks gossip is currently subscribed for. Nonempty iff the
/// node is subscribed; holds two forks only across a fork transition.
pub type GossipState = BTreeSet<Phase>;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum GossipAction {
    Subscribe(GossipTopic),
    Unsubscribe(GossipTopic),
    /// Subscribe or unsubscribe an attestation subnet under every active fork
    /// digest, and mirror persistent changes into the ENR `attnets` field.
    UpdateAttestationSubnets(AttestationSubnetActions),
    /// Subscribe (`true`) or unsubscribe sync committee subnets, mirrored
    /// into the ENR `syncnets` field.
    UpdateSyncCommitteeSubnet(SubnetId, bool),
}

/// The target fork set for gossip at `epoch`: empty while behind, otherwise
/// the current fork, plus the next fork while its activation epoch is one
/// epoch away.
#[must_use]
pub fn target_gossip_state(config: &Config, epoch: Epoch, is_behind: bool) -> GossipState {
    if is_behind {
        return GossipState::new();
    }

    let current_phase = config.phase_at_epoch(epoch);
    let mut state = GossipState::from([current_phase]);

    if let Some(next_phase) = config.next_scheduled_phase(current_phase) {
        if config.fork_epoch(next_phase) == epoch + 1 {
            state.insert(next_phase);
        }
    }

    state
}

/// Subscribes and unsubscribes gossip topics as the node crosses forks and
/// sync thresholds. Owned by the scheduler; never touched concurrently.
pub struct GossipController {
    config: Arc<Config>,
    genesis_validators_root: H256,
    gossip_state: GossipState,
    /// Managed separately from the other topics: optimistic sync requires
    /// receiving blocks while still behind.
    blocks_gossip_state: GossipState,
    attestation_subnets: AttestationSubnets,
    sync_committee_subnets: SyncCommitteeSubnets,
    last_sync_update: Option<SyncCommitteePeriod>,
}

impl GossipController {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        genesis_validators_root: H256,
        node_id: types::primitives::NodeId,
        subscribe_all_subnets: bool,
    ) -> Self {
        Self {
            config,
            genesis_validators_root,
            gossip_state: GossipState::new(),
            blocks_gossip_state: GossipState::new(),
            attestation_subnets: AttestationSubnets::new(node_id, subscribe_all_subnets),
            sync_committee_subnets: SyncCommitteeSubnets::new(subscribe_all_subnets),
            last_sync_update: None,
        }
    }

    #[must_use]
    pub const fn gossip_state(&self) -> &GossipState {
        &self.gossip_state
    }

    #[must_use]
    pub const fn blocks_gossip_state(&self) -> &GossipState {
        &self.blocks_gossip_state
    }

    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        !self.gossip_state.is_empty()
    }

    /// Subnets currently subscribed for attestations.
    pub fn subscribed_subnets(&self) -> BTreeSet<SubnetId> {
        self.attestation_subnets.subscribed_subnets().collect()
    }

    /// Recomputes the fork topic subscriptions for `slot`.
    ///
    /// `head_distance` is the distance between the wall clock and the head;
    /// `should_sync_optimistically` keeps block topics alive while other
    /// topics are dropped.
    pub fn update_gossip_status(
        &mut self,
        slot: Slot,
        head_distance: u64,
        should_sync_optimistically: bool,
    ) -> Vec<GossipAction> {
        let epoch = misc::compute_epoch_at_slot(slot);

        let is_behind = self.is_behind(head_distance, &self.gossip_state.clone());
        let is_behind_for_blocks = is_behind && !should_sync_optimistically;

        let target = target_gossip_state(&self.config, epoch, is_behind);
        let blocks_target = target_gossip_state(&self.config, epoch, is_behind_for_blocks);

        debug_assert!(target.len() <= 2);

        let mut actions = vec![];

        let removed = self.gossip_state.difference(&target).copied().collect_vec();
        let added = target.difference(&self.gossip_state).copied().collect_vec();

        // Remove handlers for obsolete forks before adding new ones, so a
        // transition never handles one message under two digests.
        for phase in removed {
            info!("unsubscribing gossip topics of {phase}");

            actions.extend(
                core_topics_for_phase(&self.config, phase, self.genesis_validators_root)
                    .into_iter()
                    .map(GossipAction::Unsubscribe),
            );
        }

        for phase in added {
            info!("subscribing gossip topics of {phase}");

            actions.extend(
                core_topics_for_phase(&self.config, phase, self.genesis_validators_root)
                    .into_iter()
                    .map(GossipAction::Subscribe),
            );
        }

        for phase in self.blocks_gossip_state.difference(&blocks_target) {
            actions.push(GossipAction::Unsubscribe(block_topic_for_phase(
                &self.config,
                *phase,
                self.genesis_validators_root,
            )));
        }

        for phase in blocks_target.difference(&self.blocks_gossip_state) {
            actions.push(GossipAction::Subscribe(block_topic_for_phase(
                &self.config,
                *phase,
                self.genesis_validators_root,
            )));
        }

        self.gossip_state = target;
        self.blocks_gossip_state = blocks_target;

        actions
    }

    /// Updates attestation subnet subscriptions for `slot`. The result is the
    /// union of duty-driven and long-lived stability subscriptions.
    pub fn update_attestation_subnets(
        &mut self,
        slot: Slot,
        duty_subnets: impl IntoIterator<Item = (SubnetId, Slot)>,
    ) -> Result<Option<GossipAction>> {
        let actions = self.attestation_subnets.on_slot(slot, duty_subnets)?;

        if actions.is_empty() {
            return Ok(None);
        }

        Ok(Some(GossipAction::UpdateAttestationSubnets(actions)))
    }

    /// Recomputes sync committee subnet subscriptions.
    ///
    /// Runs when the sync committee period changes and when the next period
    /// boundary is near, and is a no-op otherwise.
    pub fn update_sync_committee_topics(
        &mut self,
        slot: Slot,
        member_subnets: impl IntoIterator<Item = (SubnetId, Epoch)>,
    ) -> Vec<GossipAction> {
        let epoch = misc::compute_epoch_at_slot(slot);
        let period = misc::sync_committee_period(epoch);

        let near_boundary =
            misc::near_sync_committee_period_boundary(epoch, SYNC_COMMITTEE_LOOKAHEAD_EPOCHS)
                .is_some();

        let is_stale = self.last_sync_update != Some(period);

        if !is_stale && !near_boundary && !misc::is_epoch_start(slot) {
            return vec![];
        }

        self.last_sync_update = Some(period);

        let mut actions = self
            .sync_committee_subnets
            .on_slot(slot)
            .into_iter()
            .collect::<std::collections::BTreeMap<_, _>>();

        actions.extend(self.sync_committee_subnets.update(epoch, member_subnets));

        actions
            .into_iter()
            .map(|(subnet_id, action)| {
                let subscribe = matches!(action, SyncCommitteeSubnetAction::Subscribe);
                GossipAction::UpdateSyncCommitteeSubnet(subnet_id, subscribe)
            })
            .collect()
    }

    /// Whether the node counts as behind for gossip purposes, with hysteresis:
    /// an unsubscribed node rejoins at a lower distance than the one at which
    /// a subscribed node drops out.
    fn is_behind(&self, head_distance: u64, state: &GossipState) -> bool {
        if state.is_empty() {
            head_distance > TOPIC_SUBSCRIBE_THRESHOLD
        } else {
            head_distance > TOPIC_SUBSCRIBE_THRESHOLD + HYSTERESIS_BUFFER
        }
    }
}

#[cfg(test)]
mod tests {
    use types::primitives::NodeId;

    use super::*;

    fn controller_with(config: Config) -> GossipController {
        GossipController::new(
            Arc::new(config),
            H256::repeat_byte(3),
            NodeId::from(0x42_u64) << 240,
            false,
        )
    }

    fn mainnet_controller() -> GossipController {
        controller_with(Config::mainnet())
    }

    #[test]
    fn gossip_state_transitions_across_a_fork_boundary() {
        let config = Config::mainnet();
        let capella_epoch = config.capella_fork_epoch;
        let mut controller = controller_with(config.clone());

        // Synced, two epochs before the fork: only Bellatrix.
        let slot = misc::compute_start_slot_at_epoch(capella_epoch - 2);
        controller.update_gossip_status(slot, 0, false);

        assert_eq!(
            controller.gossip_state(),
            &GossipState::from([Phase::Bellatrix]),
        );

        // One epoch before the fork: both forks coexist.
        let slot = misc::compute_start_slot_at_epoch(capella_epoch - 1);
        let actions = controller.update_gossip_status(slot, 0, false);

        assert_eq!(
            controller.gossip_state(),
            &GossipState::from([Phase::Bellatrix, Phase::Capella]),
        );

        // The BLS-to-execution-change topic becomes subscribed with Capella.
        let bls_change_subscribed = actions.iter().any(|action| {
            matches!(
                action,
                GossipAction::Subscribe(topic)
                    if topic.kind == crate::gossip_topics::GossipTopicKind::BlsToExecutionChange,
            )
        });

        assert!(bls_change_subscribed);

        // At the fork epoch: only Capella remains.
        let slot = misc::compute_start_slot_at_epoch(capella_epoch);
        controller.update_gossip_status(slot, 0, false);

        assert_eq!(
            controller.gossip_state(),
            &GossipState::from([Phase::Capella]),
        );
    }

    #[test]
    fn gossip_state_never_holds_more_than_two_forks() {
        let config = Config::mainnet();
        let mut controller = controller_with(config.clone());

        for epoch in (config.capella_fork_epoch - 2)..(config.capella_fork_epoch + 2) {
            controller.update_gossip_status(misc::compute_start_slot_at_epoch(epoch), 0, false);
            assert!(controller.gossip_state().len() <= 2);
        }
    }

    #[test]
    fn falling_behind_unsubscribes_with_hysteresis() {
        let mut controller = mainnet_controller();
        let slot = misc::compute_start_slot_at_epoch(300_000);

        controller.update_gossip_status(slot, 0, false);
        assert!(controller.is_subscribed());

        // 80 slots behind is exactly at the limit; still subscribed.
        controller.update_gossip_status(slot, 80, false);
        assert!(controller.is_subscribed());

        // Crossing 64 + 16 drops every subscription.
        controller.update_gossip_status(slot, 81, false);
        assert!(!controller.is_subscribed());

        // Coming back within 64 slots of the wall clock resubscribes.
        controller.update_gossip_status(slot, 65, false);
        assert!(!controller.is_subscribed());

        controller.update_gossip_status(slot, 63, false);
        assert!(controller.is_subscribed());
    }

    #[test]
    fn optimistic_sync_keeps_block_topics_while_behind() {
        let mut controller = mainnet_controller();
        let slot = misc::compute_start_slot_at_epoch(300_000);

        let actions = controller.update_gossip_status(slot, 100, true);

        assert!(!controller.is_subscribed());
        assert_eq!(controller.blocks_gossip_state().len(), 1);

        let block_subscriptions = actions
            .iter()
            .filter(|action| {
                matches!(
                    action,
                    GossipAction::Subscribe(topic)
                        if topic.kind == crate::gossip_topics::GossipTopicKind::BeaconBlock,
                )
            })
            .count();

        assert_eq!(block_subscriptions, 1);
    }

    #[test]
    fn repeated_updates_with_identical_inputs_produce_no_actions() {
        let mut controller = mainnet_controller();
        let slot = misc::compute_start_slot_at_epoch(300_000);

        controller.update_gossip_status(slot, 0, false);
        controller
            .update_attestation_subnets(slot, [(7, slot + 2)])
            .expect("subnet ids are valid");

        assert!(controller.update_gossip_status(slot, 0, false).is_empty());
        assert!(controller
            .update_attestation_subnets(slot, [(7, slot + 2)])
            .expect("subnet ids are valid")
            .is_none());
    }

    #[test]
    fn member_subnets_drive_sync_committee_subscriptions() {
        let mut controller = mainnet_controller();

        let actions = controller.update_sync_committee_topics(
            misc::compute_start_slot_at_epoch(512),
            [(1, 513), (3, 513)],
        );

        assert!(actions.contains(&GossipAction::UpdateSyncCommitteeSubnet(1, true)));
        assert!(actions.contains(&GossipAction::UpdateSyncCommitteeSubnet(3, true)));

        // Expired memberships unsubscribe at the next epoch boundary.
        let actions =
            controller.update_sync_committee_topics(misc::compute_start_slot_at_epoch(514), []);

        assert!(actions.contains(&GossipAction::UpdateSyncCommitteeSubnet(1, false)));
        assert!(actions.contains(&GossipAction::UpdateSyncCommitteeSubnet(3, false)));
    }

    #[test]
    fn sync_committee_topics_update_only_at_period_boundaries_or_when_stale() {
        let mut controller = mainnet_controller();

        // First call is always stale.
        let actions = controller.update_sync_committee_topics(misc::compute_start_slot_at_epoch(512), [(1, 513)]);
        assert!(!actions.is_empty());

        // Mid-period, mid-epoch: nothing to do.
        let actions =
            controller.update_sync_committee_topics(misc::compute_start_slot_at_epoch(513) + 5, []);
        assert!(actions.is_empty());
    }
}
