use core::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};

pub use primitive_types::{H160, H256, H384, U256};

pub type Slot = u64;
pub type Epoch = u64;
pub type SyncCommitteePeriod = u64;
pub type CommitteeIndex = u64;
pub type SubnetId = u64;
pub type ValidatorIndex = u64;
pub type Gwei = u64;
pub type UnixSeconds = u64;
pub type BlobIndex = u64;
pub type ParticipationFlags = u8;
pub type NodeId = U256;
pub type ExecutionAddress = H160;
pub type ExecutionBlockHash = H256;
pub type PublicKeyBytes = H384;
pub type KzgCommitment = H384;
pub type KzgProof = H384;
pub type Version = [u8; 4];
pub type ForkDigest = [u8; 4];
pub type DomainType = [u8; 4];

/// Identity of a connected peer, assigned by the networking layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl Display for PeerId {
    fn fmt(&self, formatter: &mut Formatter) -> FmtResult {
        write!(formatter, "peer-{}", self.0)
    }
}

/// Opaque bytes standing in for a 96 byte BLS signature.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBytes(#[serde(with = "serde_signature")] pub [u8; 96]);

impl SignatureBytes {
    #[must_use]
    pub const fn empty() -> Self {
        Self([0; 96])
    }
}

impl Default for SignatureBytes {
    fn default() -> Self {
        Self::empty()
    }
}

impl core::fmt::Debug for SignatureBytes {
    fn fmt(&self, formatter: &mut Formatter) -> FmtResult {
        write!(formatter, "0x{}…", hex_prefix(&self.0))
    }
}

impl Display for SignatureBytes {
    fn fmt(&self, formatter: &mut Formatter) -> FmtResult {
        core::fmt::Debug::fmt(self, formatter)
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|byte| format!("{byte:02x}")).collect()
}

mod serde_signature {
    use serde::{de::Error as _, Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 96], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 96], D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("signature must be 96 bytes long"))
    }
}
