use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{
    altair, bellatrix, capella,
    containers::{BeaconBlockHeader, SignedBeaconBlockHeader},
    deneb,
    nonstandard::Phase,
    phase0,
    primitives::{
        ExecutionBlockHash, KzgCommitment, SignatureBytes, Slot, ValidatorIndex, H256,
    },
};

#[derive(Clone, PartialEq, Eq, Debug, From, Serialize, Deserialize)]
#[serde(tag = "version", content = "data", rename_all = "lowercase")]
pub enum BeaconBlock {
    Phase0(phase0::BeaconBlock),
    Altair(altair::BeaconBlock),
    Bellatrix(bellatrix::BeaconBlock),
    Capella(capella::BeaconBlock),
    Deneb(deneb::BeaconBlock),
}

impl BeaconBlock {
    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self {
            Self::Phase0(_) => Phase::Phase0,
            Self::Altair(_) => Phase::Altair,
            Self::Bellatrix(_) => Phase::Bellatrix,
            Self::Capella(_) => Phase::Capella,
            Self::Deneb(_) => Phase::Deneb,
        }
    }

    #[must_use]
    pub const fn slot(&self) -> Slot {
        match self {
            Self::Phase0(block) => block.slot,
            Self::Altair(block) => block.slot,
            Self::Bellatrix(block) => block.slot,
            Self::Capella(block) => block.slot,
            Self::Deneb(block) => block.slot,
        }
    }

    #[must_use]
    pub const fn proposer_index(&self) -> ValidatorIndex {
        match self {
            Self::Phase0(block) => block.proposer_index,
            Self::Altair(block) => block.proposer_index,
            Self::Bellatrix(block) => block.proposer_index,
            Self::Capella(block) => block.proposer_index,
            Self::Deneb(block) => block.proposer_index,
        }
    }

    #[must_use]
    pub const fn parent_root(&self) -> H256 {
        match self {
            Self::Phase0(block) => block.parent_root,
            Self::Altair(block) => block.parent_root,
            Self::Bellatrix(block) => block.parent_root,
            Self::Capella(block) => block.parent_root,
            Self::Deneb(block) => block.parent_root,
        }
    }

    #[must_use]
    pub const fn state_root(&self) -> H256 {
        match self {
            Self::Phase0(block) => block.state_root,
            Self::Altair(block) => block.state_root,
            Self::Bellatrix(block) => block.state_root,
            Self::Capella(block) => block.state_root,
            Self::Deneb(block) => block.state_root,
        }
    }

    #[must_use]
    pub fn to_header(&self) -> BeaconBlockHeader {
        match self {
            Self::Phase0(block) => block.to_header(),
            Self::Altair(block) => block.to_header(),
            Self::Bellatrix(block) => block.to_header(),
            Self::Capella(block) => block.to_header(),
            Self::Deneb(block) => block.to_header(),
        }
    }

    #[must_use]
    pub fn hash_tree_root(&self) -> H256 {
        self.to_header().hash_tree_root()
    }

    /// Commitments to the blobs this block depends on for availability.
    /// Forks before Deneb have no blobs, which is distinct from an empty list.
    #[must_use]
    pub fn blob_kzg_commitments(&self) -> Option<&[KzgCommitment]> {
        match self {
            Self::Phase0(_) | Self::Altair(_) | Self::Bellatrix(_) | Self::Capella(_) => None,
            Self::Deneb(block) => Some(&block.body.blob_kzg_commitments),
        }
    }

    #[must_use]
    pub const fn execution_block_hash(&self) -> Option<ExecutionBlockHash> {
        match self {
            Self::Phase0(_) | Self::Altair(_) => None,
            Self::Bellatrix(block) => Some(block.body.execution_payload.block_hash),
            Self::Capella(block) => Some(block.body.execution_payload.block_hash),
            Self::Deneb(block) => Some(block.body.execution_payload.block_hash),
        }
    }

    /// A block with an empty body in the given phase. Used by the block
    /// production path when the external producer supplies no payload and by
    /// tests building chains.
    #[must_use]
    pub fn empty(phase: Phase, slot: Slot, proposer_index: ValidatorIndex, parent_root: H256) -> Self {
        match phase {
            Phase::Phase0 => Self::Phase0(phase0::BeaconBlock {
                slot,
                proposer_index,
                parent_root,
                ..Default::default()
            }),
            Phase::Altair => Self::Altair(altair::BeaconBlock {
                slot,
                proposer_index,
                parent_root,
                ..Default::default()
            }),
            Phase::Bellatrix => Self::Bellatrix(bellatrix::BeaconBlock {
                slot,
                proposer_index,
                parent_root,
                ..Default::default()
            }),
            Phase::Capella => Self::Capella(capella::BeaconBlock {
                slot,
                proposer_index,
                parent_root,
                ..Default::default()
            }),
            Phase::Deneb => Self::Deneb(deneb::BeaconBlock {
                slot,
                proposer_index,
                parent_root,
                ..Default::default()
            }),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, From, Serialize, Deserialize)]
#[serde(tag = "version", content = "data", rename_all = "lowercase")]
pub enum SignedBeaconBlock {
    Phase0(phase0::SignedBeaconBlock),
    Altair(altair::SignedBeaconBlock),
    Bellatrix(bellatrix::SignedBeaconBlock),
    Capella(capella::SignedBeaconBlock),
    Deneb(deneb::SignedBeaconBlock),
}

impl SignedBeaconBlock {
    #[must_use]
    pub fn from_block(message: BeaconBlock, signature: SignatureBytes) -> Self {
        match message {
            BeaconBlock::Phase0(message) => {
                Self::Phase0(phase0::SignedBeaconBlock { message, signature })
            }
            BeaconBlock::Altair(message) => {
                Self::Altair(altair::SignedBeaconBlock { message, signature })
            }
            BeaconBlock::Bellatrix(message) => {
                Self::Bellatrix(bellatrix::SignedBeaconBlock { message, signature })
            }
            BeaconBlock::Capella(message) => {
                Self::Capella(capella::SignedBeaconBlock { message, signature })
            }
            BeaconBlock::Deneb(message) => {
                Self::Deneb(deneb::SignedBeaconBlock { message, signature })
            }
        }
    }

    #[must_use]
    pub fn message(&self) -> BeaconBlockSummary {
        BeaconBlockSummary {
            phase: self.phase(),
            slot: self.slot(),
            proposer_index: self.proposer_index(),
            parent_root: self.parent_root(),
            state_root: self.state_root(),
            root: self.hash_tree_root(),
        }
    }

    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self {
            Self::Phase0(_) => Phase::Phase0,
            Self::Altair(_) => Phase::Altair,
            Self::Bellatrix(_) => Phase::Bellatrix,
            Self::Capella(_) => Phase::Capella,
            Self::Deneb(_) => Phase::Deneb,
        }
    }

    #[must_use]
    pub const fn slot(&self) -> Slot {
        match self {
            Self::Phase0(block) => block.message.slot,
            Self::Altair(block) => block.message.slot,
            Self::Bellatrix(block) => block.message.slot,
            Self::Capella(block) => block.message.slot,
            Self::Deneb(block) => block.message.slot,
        }
    }

    #[must_use]
    pub const fn proposer_index(&self) -> ValidatorIndex {
        match self {
            Self::Phase0(block) => block.message.proposer_index,
            Self::Altair(block) => block.message.proposer_index,
            Self::Bellatrix(block) => block.message.proposer_index,
            Self::Capella(block) => block.message.proposer_index,
            Self::Deneb(block) => block.message.proposer_index,
        }
    }

    #[must_use]
    pub const fn parent_root(&self) -> H256 {
        match self {
            Self::Phase0(block) => block.message.parent_root,
            Self::Altair(block) => block.message.parent_root,
            Self::Bellatrix(block) => block.message.parent_root,
            Self::Capella(block) => block.message.parent_root,
            Self::Deneb(block) => block.message.parent_root,
        }
    }

    #[must_use]
    pub const fn state_root(&self) -> H256 {
        match self {
            Self::Phase0(block) => block.message.state_root,
            Self::Altair(block) => block.message.state_root,
            Self::Bellatrix(block) => block.message.state_root,
            Self::Capella(block) => block.message.state_root,
            Self::Deneb(block) => block.message.state_root,
        }
    }

    #[must_use]
    pub const fn signature(&self) -> SignatureBytes {
        match self {
            Self::Phase0(block) => block.signature,
            Self::Altair(block) => block.signature,
            Self::Bellatrix(block) => block.signature,
            Self::Capella(block) => block.signature,
            Self::Deneb(block) => block.signature,
        }
    }

    #[must_use]
    pub fn to_header(&self) -> BeaconBlockHeader {
        match self {
            Self::Phase0(block) => block.message.to_header(),
            Self::Altair(block) => block.message.to_header(),
            Self::Bellatrix(block) => block.message.to_header(),
            Self::Capella(block) => block.message.to_header(),
            Self::Deneb(block) => block.message.to_header(),
        }
    }

    #[must_use]
    pub fn signed_header(&self) -> SignedBeaconBlockHeader {
        SignedBeaconBlockHeader {
            message: self.to_header(),
            signature: self.signature(),
        }
    }

    #[must_use]
    pub fn hash_tree_root(&self) -> H256 {
        self.to_header().hash_tree_root()
    }

    #[must_use]
    pub fn blob_kzg_commitments(&self) -> Option<&[KzgCommitment]> {
        match self {
            Self::Phase0(_) | Self::Altair(_) | Self::Bellatrix(_) | Self::Capella(_) => None,
            Self::Deneb(block) => Some(&block.message.body.blob_kzg_commitments),
        }
    }

    #[must_use]
    pub const fn execution_block_hash(&self) -> Option<ExecutionBlockHash> {
        match self {
            Self::Phase0(_) | Self::Altair(_) => None,
            Self::Bellatrix(block) => Some(block.message.body.execution_payload.block_hash),
            Self::Capella(block) => Some(block.message.body.execution_payload.block_hash),
            Self::Deneb(block) => Some(block.message.body.execution_payload.block_hash),
        }
    }
}

/// Fields of a block message that matter to the orchestrator, with the root
/// precomputed. Cheaper to pass around than the forked block itself.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BeaconBlockSummary {
    pub phase: Phase,
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub parent_root: H256,
    pub state_root: H256,
    pub root: H256,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blocks_in_different_phases_have_different_roots() {
        let parent = H256::repeat_byte(1);
        let capella = BeaconBlock::empty(Phase::Capella, 10, 0, parent);
        let deneb = BeaconBlock::empty(Phase::Deneb, 10, 0, parent);

        assert_ne!(capella.hash_tree_root(), deneb.hash_tree_root());
    }

    #[test]
    fn block_root_commits_to_blob_commitments() {
        let mut block = deneb::BeaconBlock {
            slot: 5,
            ..Default::default()
        };

        let root_without_blobs = block.hash_tree_root();

        block.body.blob_kzg_commitments.push(KzgCommitment::repeat_byte(3));

        assert_ne!(block.hash_tree_root(), root_without_blobs);
    }
}
