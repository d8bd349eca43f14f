use std::sync::Arc;

use types::{beacon_state::BeaconState, primitives::{Epoch, ValidatorIndex}};

use crate::shuffling::ShufflingRef;

/// Full per-epoch reference data: shuffling plus proposer schedule.
///
/// Computing this is the expensive fallback of the duty update path; the fast
/// path gets by with a cached [`ShufflingRef`] alone.
#[derive(Clone)]
pub struct EpochRef {
    pub epoch: Epoch,
    pub shuffling: Arc<ShufflingRef>,
    pub proposers: Vec<ValidatorIndex>,
}

impl EpochRef {
    #[must_use]
    pub fn compute(state: &BeaconState, epoch: Epoch) -> Self {
        let shuffling = ShufflingRef::compute(state, epoch);
        let proposers = shuffling.proposers();

        Self {
            epoch,
            shuffling,
            proposers,
        }
    }
}
