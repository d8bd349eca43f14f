use thiserror::Error;
use types::primitives::PeerId;

/// Outcome of submitting an object to the block processor.
///
/// Only `Invalid` reflects on the peer that sent the object; every other
/// variant is either benign or a local condition.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum VerifierError {
    #[error("block failed state transition")]
    Invalid,
    /// The block cannot be processed yet. Either its parent is unknown or its
    /// blobs have not all arrived; it has been quarantined and will be retried.
    #[error("block is missing its parent or blobs")]
    MissingParent,
    #[error("block conflicts with finalized chain")]
    UnviableFork,
    #[error("block is already known")]
    Duplicate,
    #[error("block processor queue is full")]
    QueueFull,
}

impl VerifierError {
    /// Whether a peer that sent an object rejected with this error should be
    /// penalized in its gossip score.
    #[must_use]
    pub const fn is_peer_fault(self) -> bool {
        matches!(self, Self::Invalid)
    }
}

/// Where a block entered the node. Determines peer accounting and whether a
/// finalized-range fast path may be taken.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockOrigin {
    Gossip(PeerId),
    RequestedByRoot(PeerId),
    RangeSync { peer_id: PeerId, maybe_finalized: bool },
    Own,
}

impl BlockOrigin {
    #[must_use]
    pub const fn peer_id(self) -> Option<PeerId> {
        match self {
            Self::Gossip(peer_id) | Self::RequestedByRoot(peer_id) => Some(peer_id),
            Self::RangeSync { peer_id, .. } => Some(peer_id),
            Self::Own => None,
        }
    }

    #[must_use]
    pub const fn maybe_finalized(self) -> bool {
        matches!(self, Self::RangeSync { maybe_finalized: true, .. })
    }
}
