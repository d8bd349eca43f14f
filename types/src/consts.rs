use core::num::{NonZeroU64, NonZeroUsize};

use nonzero_ext::nonzero;

use crate::primitives::{Epoch, Gwei, Slot};

pub const GENESIS_EPOCH: Epoch = 0;
pub const GENESIS_SLOT: Slot = 0;
pub const FAR_FUTURE_EPOCH: Epoch = Epoch::MAX;

pub const SLOTS_PER_EPOCH: NonZeroU64 = nonzero!(32_u64);
pub const INTERVALS_PER_SLOT: NonZeroUsize = nonzero!(3_usize);
pub const EPOCHS_PER_SYNC_COMMITTEE_PERIOD: u64 = 256;

pub const ATTESTATION_SUBNET_COUNT: u64 = 64;
pub const SYNC_COMMITTEE_SUBNET_COUNT: u64 = 4;
pub const SYNC_COMMITTEE_SIZE: u64 = 512;
pub const SUBNETS_PER_NODE: u64 = 2;
pub const EPOCHS_PER_SUBNET_SUBSCRIPTION: u64 = 256;

pub const MAX_BLOBS_PER_BLOCK: u64 = 6;
pub const MIN_EPOCHS_FOR_BLOB_SIDECARS_REQUESTS: u64 = 4096;
pub const MIN_EPOCHS_FOR_BLOCK_REQUESTS: u64 = 33024;

pub const MAX_EFFECTIVE_BALANCE: Gwei = 32_000_000_000;
pub const EFFECTIVE_BALANCE_INCREMENT: Gwei = 1_000_000_000;
pub const HYSTERESIS_QUOTIENT: u64 = 4;
pub const HYSTERESIS_DOWNWARD_MULTIPLIER: u64 = 1;
pub const HYSTERESIS_UPWARD_MULTIPLIER: u64 = 5;

pub const TIMELY_SOURCE_FLAG: u8 = 1 << 0;
pub const TIMELY_TARGET_FLAG: u8 = 1 << 1;
pub const TIMELY_HEAD_FLAG: u8 = 1 << 2;

pub const SHUFFLE_ROUND_COUNT: u8 = 90;
pub const TARGET_AGGREGATORS_PER_COMMITTEE: u64 = 16;

pub const EPOCHS_PER_VALIDATOR_REGISTRATION_SUBMISSION: Epoch = 1;
