use std::sync::Arc;

use anyhow::{ensure, Result};
use types::{
    beacon_state::BeaconState, combined::SignedBeaconBlock, containers::Checkpoint, misc,
    primitives::H256,
};

/// Outcome of applying a block to its parent state.
pub struct TransitionOutcome {
    pub post_state: Arc<BeaconState>,
    /// The finalized checkpoint recorded in the post-state. Fork choice
    /// advances finalization from this, never computes it itself.
    pub finalized_checkpoint: Checkpoint,
}

/// The beacon state transition function.
///
/// The real implementation, including signature verification on a worker
/// pool, lives in an external library. The processor only depends on this
/// seam.
pub trait StateTransition: Send + 'static {
    fn process_block(
        &self,
        pre_state: &BeaconState,
        block: &SignedBeaconBlock,
    ) -> Result<TransitionOutcome>;
}

/// A structural stand-in for the full transition function used in tests and
/// interop tooling: checks slot ordering, advances the state to the block
/// slot and finalizes two epochs behind the block.
#[derive(Clone, Copy, Default)]
pub struct TrivialStateTransition;

impl StateTransition for TrivialStateTransition {
    fn process_block(
        &self,
        pre_state: &BeaconState,
        block: &SignedBeaconBlock,
    ) -> Result<TransitionOutcome> {
        ensure!(
            block.slot() > pre_state.slot,
            "block slot {} is not after parent state slot {}",
            block.slot(),
            pre_state.slot,
        );

        let mut post_state = pre_state.clone();
        post_state.slot = block.slot();

        let block_epoch = misc::compute_epoch_at_slot(block.slot());

        if let Some(finalized_epoch) = block_epoch.checked_sub(2) {
            if finalized_epoch > post_state.finalized_checkpoint.epoch {
                post_state.finalized_checkpoint = Checkpoint {
                    epoch: finalized_epoch,
                    // The processor resolves the checkpoint root against the
                    // block tree; a zero root means "ancestor at epoch start".
                    root: H256::zero(),
                };
            }
        }

        let finalized_checkpoint = post_state.finalized_checkpoint;

        Ok(TransitionOutcome {
            post_state: Arc::new(post_state),
            finalized_checkpoint,
        })
    }
}
