use std::sync::Arc;

use clock::Tick;
use futures::channel::{mpsc::UnboundedSender, oneshot::Sender as OneshotSender};
use log::debug;
use types::{
    combined::SignedBeaconBlock,
    containers::{BlobIdentifier, BlobSidecar, Checkpoint},
    primitives::{Epoch, Gwei, PeerId, Slot, ValidatorIndex, H256},
};

use crate::misc::{BlockOrigin, VerifierError};

pub type BlockReply = OneshotSender<Result<(), VerifierError>>;

/// Work submitted to the mutator thread. The queue is bounded; see
/// [`Controller`](crate::Controller) for the backpressure contract.
pub enum ProcessorMessage {
    Block {
        block: Arc<SignedBeaconBlock>,
        blobs: Option<Vec<Arc<BlobSidecar>>>,
        origin: BlockOrigin,
        reply: Option<BlockReply>,
    },
    BlobSidecar {
        blob_sidecar: Arc<BlobSidecar>,
        peer_id: Option<PeerId>,
    },
    /// A verified attestation vote for fork choice.
    AttestationVote {
        validator_index: ValidatorIndex,
        beacon_block_root: H256,
        epoch: Epoch,
        weight: Gwei,
    },
    Tick(Tick),
    UpdateHead {
        wall_slot: Slot,
        reply: OneshotSender<()>,
    },
    /// Pre-stage the next slot: re-run fork choice and refresh the published
    /// snapshot shortly before the slot boundary.
    AdvanceClearance {
        next_slot: Slot,
    },
    Prune,
    Stop,
}

/// Messages from the mutator to the networking side.
#[derive(PartialEq, Eq, Debug)]
pub enum P2pMessage {
    /// A quarantined block is waiting for this parent.
    BlockNeeded(H256, Option<PeerId>),
    /// A block is waiting for these blobs.
    BlobsNeeded(Vec<BlobIdentifier>, Slot, Option<PeerId>),
    PenalizePeer(PeerId, VerifierError),
    FinalizedCheckpoint(Checkpoint),
    Stop,
}

impl P2pMessage {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("send to p2p failed because the receiver was dropped");
        }
    }
}
