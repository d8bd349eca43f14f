use core::fmt::{Display, Formatter, Result as FmtResult};

use types::{
    config::Config,
    consts::MAX_BLOBS_PER_BLOCK,
    nonstandard::Phase,
    primitives::{ForkDigest, SubnetId, H256},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GossipTopicKind {
    BeaconBlock,
    AggregateAndProof,
    VoluntaryExit,
    ProposerSlashing,
    AttesterSlashing,
    Attestation(SubnetId),
    SyncCommittee(SubnetId),
    ContributionAndProof,
    BlsToExecutionChange,
    BlobSidecar(SubnetId),
}

impl Display for GossipTopicKind {
    fn fmt(&self, formatter: &mut Formatter) -> FmtResult {
        match self {
            Self::BeaconBlock => formatter.write_str("beacon_block"),
            Self::AggregateAndProof => formatter.write_str("beacon_aggregate_and_proof"),
            Self::VoluntaryExit => formatter.write_str("voluntary_exit"),
            Self::ProposerSlashing => formatter.write_str("proposer_slashing"),
            Self::AttesterSlashing => formatter.write_str("attester_slashing"),
            Self::Attestation(subnet_id) => write!(formatter, "beacon_attestation_{subnet_id}"),
            Self::SyncCommittee(subnet_id) => write!(formatter, "sync_committee_{subnet_id}"),
            Self::ContributionAndProof => {
                formatter.write_str("sync_committee_contribution_and_proof")
            }
            Self::BlsToExecutionChange => formatter.write_str("bls_to_execution_change"),
            Self::BlobSidecar(subnet_id) => write!(formatter, "blob_sidecar_{subnet_id}"),
        }
    }
}

/// A gossipsub topic: a message kind under the digest of a consensus fork.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GossipTopic {
    pub phase: Phase,
    pub fork_digest: ForkDigest,
    pub kind: GossipTopicKind,
}

impl Display for GossipTopic {
    fn fmt(&self, formatter: &mut Formatter) -> FmtResult {
        let Self {
            fork_digest, kind, ..
        } = self;

        let [a, b, c, d] = fork_digest;

        write!(formatter, "/eth2/{a:02x}{b:02x}{c:02x}{d:02x}/{kind}/ssz_snappy")
    }
}

/// The static topics of one fork, excluding blocks and the dynamically
/// managed attestation and sync committee subnets.
#[must_use]
pub fn core_topics_for_phase(
    config: &Config,
    phase: Phase,
    genesis_validators_root: H256,
) -> Vec<GossipTopic> {
    let fork_digest = config.fork_digest(phase, genesis_validators_root);

    let topic = |kind| GossipTopic {
        phase,
        fork_digest,
        kind,
    };

    let mut topics = vec![
        topic(GossipTopicKind::AttesterSlashing),
        topic(GossipTopicKind::ProposerSlashing),
        topic(GossipTopicKind::VoluntaryExit),
        topic(GossipTopicKind::AggregateAndProof),
    ];

    if phase >= Phase::Altair {
        topics.push(topic(GossipTopicKind::ContributionAndProof));
    }

    if phase >= Phase::Capella {
        topics.push(topic(GossipTopicKind::BlsToExecutionChange));
    }

    if phase >= Phase::Deneb {
        topics.extend(
            (0..MAX_BLOBS_PER_BLOCK).map(|subnet_id| topic(GossipTopicKind::BlobSidecar(subnet_id))),
        );
    }

    topics
}

#[must_use]
pub fn block_topic_for_phase(
    config: &Config,
    phase: Phase,
    genesis_validators_root: H256,
) -> GossipTopic {
    GossipTopic {
        phase,
        fork_digest: config.fork_digest(phase, genesis_validators_root),
        kind: GossipTopicKind::BeaconBlock,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_follow_the_gossipsub_convention() {
        let config = Config::mainnet();
        let topic = block_topic_for_phase(&config, Phase::Capella, H256::zero());

        let name = topic.to_string();

        assert!(name.starts_with("/eth2/"));
        assert!(name.ends_with("/beacon_block/ssz_snappy"));
    }

    #[test]
    fn capella_core_topics_include_bls_changes_but_no_blob_subnets() {
        let config = Config::mainnet();
        let topics = core_topics_for_phase(&config, Phase::Capella, H256::zero());

        assert!(topics
            .iter()
            .any(|topic| topic.kind == GossipTopicKind::BlsToExecutionChange));
        assert!(!topics
            .iter()
            .any(|topic| matches!(topic.kind, GossipTopicKind::BlobSidecar(_))));
    }

    #[test]
    fn deneb_core_topics_include_every_blob_subnet() {
        let config = Config::mainnet();
        let topics = core_topics_for_phase(&config, Phase::Deneb, H256::zero());

        let blob_subnets = topics
            .iter()
            .filter(|topic| matches!(topic.kind, GossipTopicKind::BlobSidecar(_)))
            .count();

        assert_eq!(blob_subnets as u64, MAX_BLOBS_PER_BLOCK);
    }
}
