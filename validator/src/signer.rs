use types::{
    containers::AttestationData,
    primitives::{PublicKeyBytes, SignatureBytes, Slot, UnixSeconds, H256},
};

/// A message to be signed by a validator key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SigningMessage {
    BlockProposal { slot: Slot, block_root: H256 },
    Attestation(AttestationData),
    SyncCommitteeMessage { slot: Slot, beacon_block_root: H256 },
    AggregationSlot { slot: Slot },
    AggregateAndProof { slot: Slot, beacon_block_root: H256 },
    ValidatorRegistration { timestamp: UnixSeconds },
}

impl SigningMessage {
    /// The root covered by the signature, used for slashing protection
    /// records.
    #[must_use]
    pub fn signing_root(&self) -> H256 {
        match self {
            Self::BlockProposal { block_root, .. } => *block_root,
            Self::Attestation(data) => data.beacon_block_root,
            Self::SyncCommitteeMessage {
                beacon_block_root, ..
            } => *beacon_block_root,
            Self::AggregationSlot { slot } => hashing::hash_bytes(&slot.to_le_bytes()),
            Self::AggregateAndProof {
                beacon_block_root, ..
            } => *beacon_block_root,
            Self::ValidatorRegistration { timestamp } => {
                hashing::hash_bytes(&timestamp.to_le_bytes())
            }
        }
    }
}

/// Produces signatures for attached validators.
///
/// Keystore loading and remote signer transports are provided externally;
/// the dispatcher only depends on this seam.
pub trait Signer: Send + Sync {
    fn sign(&self, public_key: PublicKeyBytes, message: SigningMessage) -> SignatureBytes;
}

/// Signs everything with an empty signature. Useful in tests and interop
/// setups where signature verification is disabled.
#[derive(Clone, Copy, Default)]
pub struct NullSigner;

impl Signer for NullSigner {
    fn sign(&self, _public_key: PublicKeyBytes, _message: SigningMessage) -> SignatureBytes {
        SignatureBytes::empty()
    }
}
