use core::{num::NonZeroU64, time::Duration};
use std::borrow::Cow;

use hex_literal::hex;
use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};

use crate::{
    misc,
    nonstandard::Phase,
    primitives::{Epoch, ForkDigest, Slot, UnixSeconds, Version, H256},
};

/// Chain configuration: fork schedule and time parameters.
///
/// Preset-level constants that never vary between the networks this node
/// supports live in [`crate::consts`].
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub config_name: Cow<'static, str>,

    // Genesis
    pub genesis_fork_version: Version,
    pub min_genesis_time: UnixSeconds,

    // Forking
    pub altair_fork_epoch: Epoch,
    pub altair_fork_version: Version,
    pub bellatrix_fork_epoch: Epoch,
    pub bellatrix_fork_version: Version,
    pub capella_fork_epoch: Epoch,
    pub capella_fork_version: Version,
    pub deneb_fork_epoch: Epoch,
    pub deneb_fork_version: Version,

    // Time parameters
    pub seconds_per_slot: NonZeroU64,
}

impl Default for Config {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl Config {
    #[must_use]
    pub const fn mainnet() -> Self {
        Self {
            config_name: Cow::Borrowed("mainnet"),
            genesis_fork_version: hex!("00000000"),
            min_genesis_time: 1_606_824_000,
            altair_fork_epoch: 74_240,
            altair_fork_version: hex!("01000000"),
            bellatrix_fork_epoch: 144_896,
            bellatrix_fork_version: hex!("02000000"),
            capella_fork_epoch: 194_048,
            capella_fork_version: hex!("03000000"),
            deneb_fork_epoch: 269_568,
            deneb_fork_version: hex!("04000000"),
            seconds_per_slot: nonzero!(12_u64),
        }
    }

    #[must_use]
    pub const fn minimal() -> Self {
        Self {
            config_name: Cow::Borrowed("minimal"),
            genesis_fork_version: hex!("00000001"),
            min_genesis_time: 1_578_009_600,
            altair_fork_epoch: 0,
            altair_fork_version: hex!("01000001"),
            bellatrix_fork_epoch: 0,
            bellatrix_fork_version: hex!("02000001"),
            capella_fork_epoch: 0,
            capella_fork_version: hex!("03000001"),
            deneb_fork_epoch: 0,
            deneb_fork_version: hex!("04000001"),
            seconds_per_slot: nonzero!(6_u64),
        }
    }

    /// All forks active from genesis. Convenient in tests exercising Deneb paths.
    #[must_use]
    pub fn all_forks_at_genesis() -> Self {
        Self {
            config_name: Cow::Borrowed("all-forks-at-genesis"),
            ..Self::minimal()
        }
    }

    #[must_use]
    pub const fn fork_epoch(&self, phase: Phase) -> Epoch {
        match phase {
            Phase::Phase0 => 0,
            Phase::Altair => self.altair_fork_epoch,
            Phase::Bellatrix => self.bellatrix_fork_epoch,
            Phase::Capella => self.capella_fork_epoch,
            Phase::Deneb => self.deneb_fork_epoch,
        }
    }

    #[must_use]
    pub const fn fork_version(&self, phase: Phase) -> Version {
        match phase {
            Phase::Phase0 => self.genesis_fork_version,
            Phase::Altair => self.altair_fork_version,
            Phase::Bellatrix => self.bellatrix_fork_version,
            Phase::Capella => self.capella_fork_version,
            Phase::Deneb => self.deneb_fork_version,
        }
    }

    #[must_use]
    pub fn phase_at_epoch(&self, epoch: Epoch) -> Phase {
        enum_iterator::reverse_all::<Phase>()
            .find(|phase| self.fork_epoch(*phase) <= epoch)
            .unwrap_or(Phase::Phase0)
    }

    #[must_use]
    pub fn phase_at_slot(&self, slot: Slot) -> Phase {
        self.phase_at_epoch(misc::compute_epoch_at_slot(slot))
    }

    /// The phase activating after `phase`, if the schedule contains one.
    #[must_use]
    pub fn next_scheduled_phase(&self, phase: Phase) -> Option<Phase> {
        phase
            .next()
            .filter(|next| self.fork_epoch(*next) < Epoch::MAX)
    }

    #[must_use]
    pub fn fork_digest(&self, phase: Phase, genesis_validators_root: H256) -> ForkDigest {
        let version = self.fork_version(phase);

        let mut bytes = [0; 36];
        bytes[..4].copy_from_slice(&version);
        bytes[4..].copy_from_slice(genesis_validators_root.as_bytes());

        let digest = hashing::hash_bytes(&bytes);

        digest.as_bytes()[..4]
            .try_into()
            .expect("hash output is longer than 4 bytes")
    }

    #[must_use]
    pub const fn slot_duration(&self) -> Duration {
        Duration::from_secs(self.seconds_per_slot.get())
    }
}
