pub use crate::{
    action_tracker::{ActionTracker, AttestationDuty},
    epoch_ref::EpochRef,
    manager::{ActionTrackerUpdate, ConsensusManager},
    shuffling::ShufflingRef,
};

mod action_tracker;
mod epoch_ref;
mod manager;
mod shuffling;
