use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Instant,
};

use block_processor::Controller;
use consensus::{ActionTracker, AttestationDuty};
use futures::channel::mpsc::UnboundedSender;
use log::{debug, info, warn};
use metrics::Metrics;
use slashing_protection::{SlashingProtector, SlashingValidationOutcome};
use types::{
    combined::{BeaconBlock, SignedBeaconBlock},
    consts::{EPOCHS_PER_VALIDATOR_REGISTRATION_SUBMISSION, MAX_EFFECTIVE_BALANCE, SLOTS_PER_EPOCH},
    containers::{
        AggregateAndProof, Attestation, AttestationData, Checkpoint, SignedAggregateAndProof,
        SignedValidatorRegistration, SyncCommitteeMessage, ValidatorRegistration,
    },
    misc,
    primitives::{Epoch, PublicKeyBytes, Slot, ValidatorIndex},
};

use crate::{
    doppelganger::DoppelgangerProtection,
    messages::ValidatorToP2p,
    signer::{Signer, SigningMessage},
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DutyKind {
    Propose,
    Attest,
    Aggregate,
    SyncCommittee,
}

/// Runs attached-validator duties each slot.
///
/// Owned by the scheduler; every duty runs at most once per slot and passes
/// slashing protection before a signature is produced.
pub struct DutyDispatcher {
    controller: Arc<Controller>,
    signer: Arc<dyn Signer>,
    slashing_protector: SlashingProtector,
    doppelganger: Option<DoppelgangerProtection>,
    validators: BTreeMap<ValidatorIndex, PublicKeyBytes>,
    performed: BTreeSet<(Slot, DutyKind, ValidatorIndex)>,
    last_registration_epoch: Option<Epoch>,
    metrics: Option<Arc<Metrics>>,
    p2p_tx: UnboundedSender<ValidatorToP2p>,
}

impl DutyDispatcher {
    #[must_use]
    pub fn new(
        controller: Arc<Controller>,
        signer: Arc<dyn Signer>,
        slashing_protector: SlashingProtector,
        doppelganger: Option<DoppelgangerProtection>,
        validators: BTreeMap<ValidatorIndex, PublicKeyBytes>,
        metrics: Option<Arc<Metrics>>,
        p2p_tx: UnboundedSender<ValidatorToP2p>,
    ) -> Self {
        Self {
            controller,
            signer,
            slashing_protector,
            doppelganger,
            validators,
            performed: BTreeSet::new(),
            last_registration_epoch: None,
            metrics,
            p2p_tx,
        }
    }

    #[must_use]
    pub fn validator_indices(&self) -> Vec<ValidatorIndex> {
        self.validators.keys().copied().collect()
    }

    pub fn doppelganger_mut(&mut self) -> Option<&mut DoppelgangerProtection> {
        self.doppelganger.as_mut()
    }

    /// Drops slashing protection records outside the history limit.
    pub fn prune_slashing_protection(&mut self, finalized_epoch: Epoch) {
        self.slashing_protector.prune(finalized_epoch);
    }

    /// Runs duties whose slot falls in `(last_slot, wall_slot]`.
    pub fn handle_validator_duties(
        &mut self,
        action_tracker: &ActionTracker,
        last_slot: Slot,
        wall_slot: Slot,
    ) {
        if self.validators.is_empty() {
            return;
        }

        let started_at = Instant::now();

        // Duties older than an epoch are expired; after a long gap (first
        // slot after startup or sync) only the recent window is replayed.
        let first_slot = (last_slot + 1).max(wall_slot.saturating_sub(SLOTS_PER_EPOCH.get() - 1));

        for slot in first_slot..=wall_slot {
            self.propose(action_tracker, slot);
            self.attest(action_tracker, slot);
            self.publish_sync_committee_messages(action_tracker, slot);
        }

        self.performed = self
            .performed
            .split_off(&(last_slot.saturating_sub(1), DutyKind::Propose, 0));

        if let Some(metrics) = self.metrics.as_ref() {
            metrics
                .next_action_wait
                .set(started_at.elapsed().as_secs_f64());
        }
    }

    /// Re-submits validator registrations to the external payload builder.
    /// Runs at epoch boundaries, once every
    /// `EPOCHS_PER_VALIDATOR_REGISTRATION_SUBMISSION` epochs.
    pub fn maybe_resubmit_registrations(&mut self, slot: Slot) {
        if self.validators.is_empty() || !misc::is_epoch_start(slot) {
            return;
        }

        let epoch = misc::compute_epoch_at_slot(slot);

        if let Some(last) = self.last_registration_epoch {
            if epoch < last + EPOCHS_PER_VALIDATOR_REGISTRATION_SUBMISSION {
                return;
            }
        }

        self.last_registration_epoch = Some(epoch);

        let timestamp = misc::compute_timestamp_at_slot(
            self.controller.chain_config(),
            self.controller.genesis_time(),
            slot,
        );

        let registrations = self
            .validators
            .values()
            .map(|pubkey| {
                let message = ValidatorRegistration {
                    fee_recipient: Default::default(),
                    gas_limit: 30_000_000,
                    timestamp,
                    pubkey: *pubkey,
                };

                let signature = self
                    .signer
                    .sign(*pubkey, SigningMessage::ValidatorRegistration { timestamp });

                SignedValidatorRegistration { message, signature }
            })
            .collect::<Vec<_>>();

        debug!(
            "resubmitting {} validator registration(s) at epoch {epoch}",
            registrations.len(),
        );

        ValidatorToP2p::PublishValidatorRegistrations(registrations).send(&self.p2p_tx);
    }

    fn propose(&mut self, action_tracker: &ActionTracker, slot: Slot) {
        let Some(validator_index) = action_tracker.proposer_at(slot) else {
            return;
        };

        let Some(pubkey) = self.signing_pubkey(validator_index) else {
            return;
        };

        if !self.mark_performed(slot, DutyKind::Propose, validator_index) {
            return;
        }

        let head = self.controller.head();
        let phase = self.controller.chain_config().phase_at_slot(slot);
        let block = BeaconBlock::empty(phase, slot, validator_index, head.root);
        let block_root = block.hash_tree_root();

        match self
            .slashing_protector
            .validate_and_store_block_proposal(pubkey, slot, block_root)
        {
            SlashingValidationOutcome::Accept => {}
            SlashingValidationOutcome::Ignore => return,
            SlashingValidationOutcome::Reject(error) => {
                warn!("refusing to propose at slot {slot}: {error}");
                return;
            }
        }

        let signature = self
            .signer
            .sign(pubkey, SigningMessage::BlockProposal { slot, block_root });

        let block = Arc::new(SignedBeaconBlock::from_block(block, signature));

        info!("proposing block at slot {slot} (root: {block_root:?})");

        if let Ok(reply) = self.controller.on_own_block_with_reply(block.clone(), None) {
            // The outcome is observed by the processor's event stream; the
            // reply future is only dropped here to avoid blocking the slot.
            drop(reply);
        }

        ValidatorToP2p::PublishBlock(block).send(&self.p2p_tx);
    }

    fn attest(&mut self, action_tracker: &ActionTracker, slot: Slot) {
        for (validator_index, duty) in action_tracker.attestation_duties_at(slot) {
            self.attest_single(slot, validator_index, duty);
        }
    }

    fn attest_single(&mut self, slot: Slot, validator_index: ValidatorIndex, duty: AttestationDuty) {
        let AttestationDuty {
            committee_index,
            is_aggregator,
            ..
        } = duty;

        let Some(pubkey) = self.signing_pubkey(validator_index) else {
            return;
        };

        if !self.mark_performed(slot, DutyKind::Attest, validator_index) {
            return;
        }

        let head = self.controller.head();
        let finalized = self.controller.finalized_checkpoint();
        let target_epoch = misc::compute_epoch_at_slot(slot);

        let data = AttestationData {
            slot,
            index: committee_index,
            beacon_block_root: head.root,
            source: finalized,
            target: Checkpoint {
                epoch: target_epoch,
                root: head.root,
            },
        };

        match self.slashing_protector.validate_and_store_attestation(
            pubkey,
            data.source.epoch,
            data.target.epoch,
            data.beacon_block_root,
        ) {
            SlashingValidationOutcome::Accept => {}
            SlashingValidationOutcome::Ignore => return,
            SlashingValidationOutcome::Reject(error) => {
                warn!("refusing to attest at slot {slot}: {error}");
                return;
            }
        }

        let signature = self.signer.sign(pubkey, SigningMessage::Attestation(data));
        let attestation = Attestation { data, signature };

        ValidatorToP2p::PublishAttestation(Box::new(attestation)).send(&self.p2p_tx);

        // Count the node's own vote in fork choice.
        self.controller.on_attestation_vote(
            validator_index,
            data.beacon_block_root,
            target_epoch,
            MAX_EFFECTIVE_BALANCE,
        );

        if is_aggregator && self.mark_performed(slot, DutyKind::Aggregate, validator_index) {
            let selection_proof = self
                .signer
                .sign(pubkey, SigningMessage::AggregationSlot { slot });

            let message = AggregateAndProof {
                aggregator_index: validator_index,
                aggregate: attestation,
                selection_proof,
            };

            let signature = self.signer.sign(
                pubkey,
                SigningMessage::AggregateAndProof {
                    slot,
                    beacon_block_root: data.beacon_block_root,
                },
            );

            ValidatorToP2p::PublishAggregateAndProof(Box::new(SignedAggregateAndProof {
                message,
                signature,
            }))
            .send(&self.p2p_tx);
        }
    }

    fn publish_sync_committee_messages(&mut self, action_tracker: &ActionTracker, slot: Slot) {
        let head = self.controller.head();

        // Only attached validators serving in the current sync committee
        // sign; one message per validator per slot regardless of how many
        // subcommittees it sits in.
        for (validator_index, _subnets) in action_tracker.sync_duties() {
            let Some(pubkey) = self.signing_pubkey(validator_index) else {
                continue;
            };

            if !self.mark_performed(slot, DutyKind::SyncCommittee, validator_index) {
                continue;
            }

            let signature = self.signer.sign(
                pubkey,
                SigningMessage::SyncCommitteeMessage {
                    slot,
                    beacon_block_root: head.root,
                },
            );

            let message = SyncCommitteeMessage {
                slot,
                beacon_block_root: head.root,
                validator_index,
                signature,
            };

            ValidatorToP2p::PublishSyncCommitteeMessage(Box::new(message)).send(&self.p2p_tx);
        }
    }

    fn signing_pubkey(&self, validator_index: ValidatorIndex) -> Option<PublicKeyBytes> {
        if !self.allows_signing(validator_index) {
            return None;
        }

        self.validators.get(&validator_index).copied()
    }

    fn allows_signing(&self, validator_index: ValidatorIndex) -> bool {
        self.doppelganger
            .as_ref()
            .map(|doppelganger| doppelganger.allows_signing(validator_index))
            .unwrap_or(true)
    }

    fn mark_performed(&mut self, slot: Slot, kind: DutyKind, validator_index: ValidatorIndex) -> bool {
        self.performed.insert((slot, kind, validator_index))
    }
}

#[cfg(test)]
mod tests {
    use block_processor::TrivialStateTransition;
    use chain_dag::Storage;
    use consensus::ShufflingRef;
    use database::Database;
    use events::EventChannels;
    use execution_engine::NullExecutionEngine;
    use futures::channel::mpsc::{self, UnboundedReceiver};
    use types::{
        beacon_state::BeaconState,
        config::Config,
        consts::{FAR_FUTURE_EPOCH, SYNC_COMMITTEE_SIZE},
        containers::Validator,
        nonstandard::Phase,
        primitives::{NodeId, H256},
    };

    use crate::signer::NullSigner;

    use super::*;

    const VALIDATOR_COUNT: usize = 64;

    fn state() -> BeaconState {
        BeaconState {
            phase: Phase::Capella,
            genesis_validators_root: H256::repeat_byte(1),
            validators: (0..VALIDATOR_COUNT)
                .map(|_| Validator {
                    pubkey: PublicKeyBytes::zero(),
                    effective_balance: MAX_EFFECTIVE_BALANCE,
                    activation_epoch: 0,
                    exit_epoch: FAR_FUTURE_EPOCH,
                    slashed: false,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn harness(
        doppelganger: Option<DoppelgangerProtection>,
    ) -> (DutyDispatcher, ActionTracker, UnboundedReceiver<ValidatorToP2p>) {
        let config = Arc::new(Config::minimal());
        let anchor_block = Arc::new(SignedBeaconBlock::from_block(
            BeaconBlock::empty(Phase::Capella, 0, 0, H256::zero()),
            Default::default(),
        ));

        let (p2p_tx, p2p_rx) = mpsc::unbounded();
        let (processor_p2p_tx, _processor_p2p_rx) = mpsc::unbounded();

        let (controller, _handle) = Controller::new(
            config.clone(),
            anchor_block,
            Arc::new(state()),
            Arc::new(Storage::new(config, Database::in_memory())),
            TrivialStateTransition,
            NullExecutionEngine,
            Arc::new(EventChannels::default()),
            None,
            processor_p2p_tx,
        )
        .expect("processor thread starts");

        let mut tracker = ActionTracker::new(NodeId::from(7_u64), false);
        tracker.register_validators(0..VALIDATOR_COUNT as ValidatorIndex);

        let shuffling = ShufflingRef::compute(&state(), 0);
        tracker.update_actions(&shuffling, &shuffling.proposers());

        let validators = (0..VALIDATOR_COUNT as ValidatorIndex)
            .map(|validator_index| {
                (
                    validator_index,
                    PublicKeyBytes::repeat_byte(validator_index as u8 + 1),
                )
            })
            .collect();

        let dispatcher = DutyDispatcher::new(
            controller,
            Arc::new(NullSigner),
            SlashingProtector::in_memory(H256::repeat_byte(1), 64),
            doppelganger,
            validators,
            None,
            p2p_tx,
        );

        (dispatcher, tracker, p2p_rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ValidatorToP2p>) -> Vec<ValidatorToP2p> {
        let mut messages = vec![];

        while let Ok(Some(message)) = rx.try_next() {
            messages.push(message);
        }

        messages
    }

    #[test]
    fn duties_run_at_most_once_per_slot() {
        let (mut dispatcher, tracker, mut p2p_rx) = harness(None);

        dispatcher.handle_validator_duties(&tracker, 0, 1);

        let first_run = drain(&mut p2p_rx);

        let attestations = first_run
            .iter()
            .filter(|message| matches!(message, ValidatorToP2p::PublishAttestation(_)))
            .count();
        let proposals = first_run
            .iter()
            .filter(|message| matches!(message, ValidatorToP2p::PublishBlock(_)))
            .count();

        // Every validator is attached, so the whole committee of slot 1
        // attests and the proposer of slot 1 proposes.
        assert!(attestations > 0);
        assert_eq!(proposals, 1);

        // Re-running the same slot range produces nothing new.
        dispatcher.handle_validator_duties(&tracker, 0, 1);

        assert!(drain(&mut p2p_rx).is_empty());
    }

    #[test]
    fn sync_committee_members_publish_messages_once_per_slot() {
        let (mut dispatcher, mut tracker, mut p2p_rx) = harness(None);

        // Validators 1 and 2 serve in the current sync committee; validator 1
        // fills every other position, so it sits in several subcommittees.
        let mut state = state();
        state.current_sync_committee = vec![1; SYNC_COMMITTEE_SIZE as usize];
        state.current_sync_committee[200] = 2;

        tracker.update_sync_committee_duties(&state);

        dispatcher.handle_validator_duties(&tracker, 0, 1);

        let published = drain(&mut p2p_rx)
            .iter()
            .filter_map(|message| match message {
                ValidatorToP2p::PublishSyncCommitteeMessage(message) => {
                    Some(message.validator_index)
                }
                _ => None,
            })
            .collect::<BTreeSet<_>>();

        assert_eq!(published, BTreeSet::from([1, 2]));

        // Re-running the same slot range publishes nothing new.
        dispatcher.handle_validator_duties(&tracker, 0, 1);

        assert!(drain(&mut p2p_rx).is_empty());
    }

    #[test]
    fn validators_outside_the_sync_committee_publish_no_messages() {
        let (mut dispatcher, tracker, mut p2p_rx) = harness(None);

        dispatcher.handle_validator_duties(&tracker, 0, 1);

        assert!(drain(&mut p2p_rx)
            .iter()
            .all(|message| !matches!(
                message,
                ValidatorToP2p::PublishSyncCommitteeMessage(_),
            )));
    }

    #[test]
    fn armed_doppelganger_protection_suppresses_all_signing() {
        let mut doppelganger = DoppelgangerProtection::default();
        doppelganger.arm(0..VALIDATOR_COUNT as ValidatorIndex, 0);

        let (mut dispatcher, tracker, mut p2p_rx) = harness(Some(doppelganger));

        dispatcher.handle_validator_duties(&tracker, 0, 1);

        assert!(drain(&mut p2p_rx).is_empty());
    }

    #[test]
    fn registrations_are_resubmitted_once_per_submission_period() {
        let (mut dispatcher, _tracker, mut p2p_rx) = harness(None);

        dispatcher.maybe_resubmit_registrations(0);
        dispatcher.maybe_resubmit_registrations(0);
        // Not an epoch boundary.
        dispatcher.maybe_resubmit_registrations(33);

        let registrations = drain(&mut p2p_rx)
            .into_iter()
            .filter(|message| {
                matches!(message, ValidatorToP2p::PublishValidatorRegistrations(_))
            })
            .count();

        assert_eq!(registrations, 1);

        // The next submission period triggers again.
        dispatcher.maybe_resubmit_registrations(32);

        assert_eq!(drain(&mut p2p_rx).len(), 1);
    }
}
