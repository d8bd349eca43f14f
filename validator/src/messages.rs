use std::sync::Arc;

use futures::channel::mpsc::UnboundedSender;
use log::debug;
use types::{
    combined::SignedBeaconBlock,
    containers::{
        Attestation, SignedAggregateAndProof, SignedValidatorRegistration, SyncCommitteeMessage,
    },
};

pub enum ValidatorToP2p {
    PublishBlock(Arc<SignedBeaconBlock>),
    PublishAttestation(Box<Attestation>),
    PublishAggregateAndProof(Box<SignedAggregateAndProof>),
    PublishSyncCommitteeMessage(Box<SyncCommitteeMessage>),
    /// Forwarded to the external payload builder.
    PublishValidatorRegistrations(Vec<SignedValidatorRegistration>),
    Stop,
}

impl ValidatorToP2p {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("send to p2p failed because the receiver was dropped");
        }
    }
}
