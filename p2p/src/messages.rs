use std::sync::Arc;

use futures::channel::mpsc::UnboundedSender;
use log::debug;
use types::{
    combined::SignedBeaconBlock,
    containers::{BlobIdentifier, BlobSidecar, Checkpoint},
    primitives::{PeerId, Slot, H256},
};

use crate::misc::{PeerStatus, RequestId};

/// Events flowing from the networking layer into the sync service.
pub enum P2pToSync {
    Slot(Slot),
    AddPeer(PeerId, PeerStatus),
    RemovePeer(PeerId),
    RequestFailed(PeerId, RequestId),
    GossipBlock(Arc<SignedBeaconBlock>, PeerId),
    RequestedBlock(Arc<SignedBeaconBlock>, PeerId, RequestId),
    GossipBlobSidecar(Arc<BlobSidecar>, PeerId),
    RequestedBlobSidecar(Arc<BlobSidecar>, PeerId, RequestId),
    /// All chunks of a range request have been delivered.
    RangeRequestFinished(RequestId, PeerId),
    /// A quarantined block is waiting for this parent root.
    BlockNeeded(H256, Option<PeerId>),
    /// A quarantined block is waiting for these blobs.
    BlobsNeeded(Vec<BlobIdentifier>, Slot, Option<PeerId>),
    FinalizedCheckpoint(Checkpoint),
    Stop,
}

impl P2pToSync {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("send to sync service failed because the receiver was dropped");
        }
    }
}

/// Requests the sync service asks the networking layer to perform.
#[derive(PartialEq, Eq, Debug)]
pub enum SyncToP2p {
    RequestBlocksByRange(RequestId, PeerId, Slot, u64),
    RequestBlocksByRoot(RequestId, PeerId, Vec<H256>),
    RequestBlobsByRange(RequestId, PeerId, Slot, u64),
    RequestBlobsByRoot(RequestId, PeerId, Vec<BlobIdentifier>),
    RequestPeerStatus(PeerId),
    PenalizePeer(PeerId),
    Stop,
}

impl SyncToP2p {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("send to p2p failed because the receiver was dropped");
        }
    }
}

/// Sync status notifications for the REST API and the scheduler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncToApi {
    SyncStatus(bool),
    BackSyncStatus(bool),
    Stop,
}

impl SyncToApi {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("send to api failed because the receiver was dropped");
        }
    }
}
