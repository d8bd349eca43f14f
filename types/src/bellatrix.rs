use serde::{Deserialize, Serialize};

use crate::{
    containers::{BeaconBlockHeader, Eth1Data, ExecutionPayload, SyncAggregate},
    primitives::{SignatureBytes, Slot, ValidatorIndex, H256},
};

#[derive(Clone, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct BeaconBlockBody {
    pub randao_reveal: SignatureBytes,
    pub eth1_data: Eth1Data,
    pub graffiti: H256,
    pub sync_aggregate: SyncAggregate,
    pub execution_payload: ExecutionPayload,
}

impl BeaconBlockBody {
    #[must_use]
    pub fn hash_tree_root(&self) -> H256 {
        let mut bytes = Vec::with_capacity(350);
        bytes.push(2);
        bytes.extend_from_slice(&self.randao_reveal.0);
        bytes.extend_from_slice(self.eth1_data.block_hash.as_bytes());
        bytes.extend_from_slice(&self.eth1_data.deposit_count.to_le_bytes());
        bytes.extend_from_slice(self.graffiti.as_bytes());
        bytes.extend_from_slice(&self.sync_aggregate.sync_committee_bits);
        bytes.extend_from_slice(self.execution_payload.block_hash.as_bytes());
        bytes.extend_from_slice(&self.execution_payload.block_number.to_le_bytes());

        hashing::hash_bytes(&bytes)
    }
}

#[derive(Clone, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct BeaconBlock {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub parent_root: H256,
    pub state_root: H256,
    pub body: BeaconBlockBody,
}

impl BeaconBlock {
    #[must_use]
    pub fn to_header(&self) -> BeaconBlockHeader {
        BeaconBlockHeader {
            slot: self.slot,
            proposer_index: self.proposer_index,
            parent_root: self.parent_root,
            state_root: self.state_root,
            body_root: self.body.hash_tree_root(),
        }
    }

    #[must_use]
    pub fn hash_tree_root(&self) -> H256 {
        self.to_header().hash_tree_root()
    }
}

#[derive(Clone, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct SignedBeaconBlock {
    pub message: BeaconBlock,
    pub signature: SignatureBytes,
}
