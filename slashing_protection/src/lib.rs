//! Slashing protection records and the
//! [EIP-3076](https://eips.ethereum.org/EIPS/eip-3076) interchange format.
//!
//! The persistent SQLite backend is provided externally; this crate holds the
//! validation rules, the in-memory record store backing tests and the
//! interchange import/export used by the `slashingdb` subcommands.

use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
};

use anyhow::{ensure, Result};
use itertools::Itertools as _;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use types::primitives::{Epoch, PublicKeyBytes, Slot, H256};

const INTERCHANGE_FORMAT_VERSION: usize = 5;

#[derive(Debug, Error)]
pub enum Error {
    #[error("interchange format version {version} is not supported")]
    UnsupportedVersion { version: usize },
    #[error(
        "genesis validators root mismatch \
         (in chain: {in_chain:?}, in interchange file: {in_metadata:?})"
    )]
    GenesisValidatorsRootMismatch { in_chain: H256, in_metadata: H256 },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlashingValidationOutcome {
    Accept,
    /// The message was already signed with the same signing root.
    Ignore,
    Reject(SlashingValidationError),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum SlashingValidationError {
    #[error("block proposal at or below the minimum stored slot")]
    DoubleProposal,
    #[error("attestation source is newer than its target")]
    SourceExceedsTarget,
    #[error("attestation votes for an already attested target")]
    DoubleVote,
    #[error("attestation surrounds or is surrounded by a previous vote")]
    SurroundVote,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct BlockRecord {
    pub slot: Slot,
    pub signing_root: Option<H256>,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct AttestationRecord {
    pub source_epoch: Epoch,
    pub target_epoch: Epoch,
    pub signing_root: Option<H256>,
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InterchangeFormat {
    pub metadata: InterchangeMeta,
    pub data: Vec<InterchangeData>,
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InterchangeMeta {
    pub interchange_format_version: usize,
    pub genesis_validators_root: H256,
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InterchangeData {
    pub pubkey: PublicKeyBytes,
    pub signed_blocks: Vec<BlockRecord>,
    pub signed_attestations: Vec<AttestationRecord>,
}

#[derive(Default)]
struct ValidatorRecords {
    blocks: BTreeSet<BlockRecord>,
    attestations: BTreeSet<AttestationRecord>,
}

pub struct SlashingProtector {
    genesis_validators_root: H256,
    history_limit: u64,
    records: HashMap<PublicKeyBytes, ValidatorRecords>,
}

impl SlashingProtector {
    #[must_use]
    pub fn in_memory(genesis_validators_root: H256, history_limit: u64) -> Self {
        Self {
            genesis_validators_root,
            history_limit,
            records: HashMap::new(),
        }
    }

    pub fn register_validators(&mut self, pubkeys: impl IntoIterator<Item = PublicKeyBytes>) {
        for pubkey in pubkeys {
            self.records.entry(pubkey).or_default();
        }
    }

    /// Validates a block proposal against stored records and stores it if
    /// admissible. Proposing twice in the same slot is only allowed when the
    /// signing root is identical.
    pub fn validate_and_store_block_proposal(
        &mut self,
        pubkey: PublicKeyBytes,
        slot: Slot,
        signing_root: H256,
    ) -> SlashingValidationOutcome {
        let records = self.records.entry(pubkey).or_default();

        let same_message = records
            .blocks
            .iter()
            .any(|block| block.slot == slot && block.signing_root == Some(signing_root));

        if same_message {
            return SlashingValidationOutcome::Ignore;
        }

        let conflicting = records.blocks.iter().any(|block| block.slot >= slot);

        if conflicting {
            return SlashingValidationOutcome::Reject(SlashingValidationError::DoubleProposal);
        }

        records.blocks.insert(BlockRecord {
            slot,
            signing_root: Some(signing_root),
        });

        SlashingValidationOutcome::Accept
    }

    /// Validates an attestation against stored records and stores it if
    /// admissible. Rejects double votes and surround votes.
    pub fn validate_and_store_attestation(
        &mut self,
        pubkey: PublicKeyBytes,
        source_epoch: Epoch,
        target_epoch: Epoch,
        signing_root: H256,
    ) -> SlashingValidationOutcome {
        if source_epoch > target_epoch {
            return SlashingValidationOutcome::Reject(
                SlashingValidationError::SourceExceedsTarget,
            );
        }

        let records = self.records.entry(pubkey).or_default();

        let same_message = records.attestations.iter().any(|attestation| {
            attestation.target_epoch == target_epoch
                && attestation.signing_root == Some(signing_root)
        });

        if same_message {
            return SlashingValidationOutcome::Ignore;
        }

        let double_vote = records
            .attestations
            .iter()
            .any(|attestation| attestation.target_epoch == target_epoch);

        if double_vote {
            return SlashingValidationOutcome::Reject(SlashingValidationError::DoubleVote);
        }

        let surround = records.attestations.iter().any(|attestation| {
            let surrounds = source_epoch < attestation.source_epoch
                && attestation.target_epoch < target_epoch;
            let surrounded = attestation.source_epoch < source_epoch
                && target_epoch < attestation.target_epoch;

            surrounds || surrounded
        });

        if surround {
            return SlashingValidationOutcome::Reject(SlashingValidationError::SurroundVote);
        }

        records.attestations.insert(AttestationRecord {
            source_epoch,
            target_epoch,
            signing_root: Some(signing_root),
        });

        SlashingValidationOutcome::Accept
    }

    /// Drops records older than the history limit relative to the finalized
    /// epoch. Only called in pruning mode, after finalization advances.
    pub fn prune(&mut self, finalized_epoch: Epoch) {
        let Some(cutoff_epoch) = finalized_epoch.checked_sub(self.history_limit) else {
            return;
        };

        let cutoff_slot = types::misc::compute_start_slot_at_epoch(cutoff_epoch);

        for records in self.records.values_mut() {
            // The newest record is always retained so future proposals keep
            // being compared against something.
            let newest_block = records.blocks.iter().next_back().copied();
            let newest_attestation = records.attestations.iter().next_back().copied();

            records.blocks.retain(|block| block.slot >= cutoff_slot);
            records
                .attestations
                .retain(|attestation| attestation.target_epoch >= cutoff_epoch);

            records.blocks.extend(newest_block);
            records.attestations.extend(newest_attestation);
        }
    }

    pub fn export_interchange(&self) -> InterchangeFormat {
        let data = self
            .records
            .iter()
            .sorted_by_key(|(pubkey, _)| **pubkey)
            .map(|(pubkey, records)| InterchangeData {
                pubkey: *pubkey,
                signed_blocks: records.blocks.iter().copied().collect(),
                signed_attestations: records.attestations.iter().copied().collect(),
            })
            .collect();

        InterchangeFormat {
            metadata: InterchangeMeta {
                interchange_format_version: INTERCHANGE_FORMAT_VERSION,
                genesis_validators_root: self.genesis_validators_root,
            },
            data,
        }
    }

    pub fn import_interchange(&mut self, interchange: InterchangeFormat) -> Result<usize> {
        let version = interchange.metadata.interchange_format_version;

        ensure!(
            version == INTERCHANGE_FORMAT_VERSION,
            Error::UnsupportedVersion { version },
        );

        let in_chain = self.genesis_validators_root;
        let in_metadata = interchange.metadata.genesis_validators_root;

        ensure!(
            in_chain == in_metadata,
            Error::GenesisValidatorsRootMismatch {
                in_chain,
                in_metadata,
            },
        );

        let mut imported = 0;

        for data in interchange.data {
            let records = self.records.entry(data.pubkey).or_default();

            imported += data.signed_blocks.len() + data.signed_attestations.len();

            records.blocks.extend(data.signed_blocks);
            records.attestations.extend(data.signed_attestations);
        }

        info!("imported {imported} slashing protection record(s)");

        Ok(imported)
    }

    pub fn export_to_interchange_file(&self, file: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.export_interchange())?;
        fs_err::write(file, json)?;
        Ok(())
    }

    pub fn import_interchange_file(&mut self, file: impl AsRef<Path>) -> Result<usize> {
        let bytes = fs_err::read(file)?;
        let interchange = serde_json::from_slice(bytes.as_slice())?;
        self.import_interchange(interchange)
    }
}
