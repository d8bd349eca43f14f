use std::sync::Arc;

use anyhow::Result;
use chain_dag::SyncCheckpoint;
use database::Database;
use log::{debug, info};
use thiserror::Error;
use types::{combined::SignedBeaconBlock, primitives::H256};

const CHECKPOINT_KEY: &str = "latest_back_sync_checkpoint";

#[derive(Debug, Error)]
pub enum Error {
    #[error("received block does not match the expected ancestry (expected root {expected:?}, got {actual:?})")]
    ChainMismatch { expected: H256, actual: H256 },
}

/// Backward range sync from the anchor towards genesis.
///
/// Runs only after forward sync has completed. Verifies that each received
/// batch links into the already verified ancestry and persists the checkpoint
/// so a restart resumes where it left off.
pub struct BackSync {
    database: Arc<Database>,
    current: SyncCheckpoint,
}

impl BackSync {
    /// Loads the persisted checkpoint, falling back to `anchor`.
    pub fn load(database: Arc<Database>, anchor: SyncCheckpoint) -> Result<Self> {
        let current = database
            .get(CHECKPOINT_KEY)?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()?
            .unwrap_or(anchor);

        debug!("back-sync starts from {current:?}");

        Ok(Self { database, current })
    }

    #[must_use]
    pub const fn checkpoint(&self) -> SyncCheckpoint {
        self.current
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.current.is_genesis()
    }

    /// Verifies a batch of blocks sorted by descending slot and advances the
    /// checkpoint.
    pub fn push_blocks(
        &mut self,
        blocks: impl IntoIterator<Item = Arc<SignedBeaconBlock>>,
    ) -> Result<()> {
        for block in blocks {
            let actual = block.hash_tree_root();
            let expected = self.current.parent_root;

            if actual != expected {
                // Empty slots are legal; only a block claiming to be the
                // parent must actually hash to the expected root.
                if block.slot() >= self.current.slot {
                    continue;
                }

                return Err(Error::ChainMismatch { expected, actual }.into());
            }

            self.current = SyncCheckpoint {
                slot: block.slot(),
                block_root: actual,
                parent_root: block.parent_root(),
            };
        }

        self.save()?;

        if self.is_finished() {
            info!("back-sync reached genesis");
        }

        Ok(())
    }

    fn save(&self) -> Result<()> {
        self.database
            .put(CHECKPOINT_KEY, serde_json::to_vec(&self.current)?)
    }
}

#[cfg(test)]
mod tests {
    use types::{combined::BeaconBlock, nonstandard::Phase};

    use super::*;

    fn chain(length: u64) -> Vec<Arc<SignedBeaconBlock>> {
        let mut blocks = vec![];
        let mut parent_root = H256::zero();

        for slot in 0..length {
            let block = Arc::new(SignedBeaconBlock::from_block(
                BeaconBlock::empty(Phase::Phase0, slot, 0, parent_root),
                Default::default(),
            ));

            parent_root = block.hash_tree_root();
            blocks.push(block);
        }

        blocks
    }

    fn checkpoint_for(block: &SignedBeaconBlock) -> SyncCheckpoint {
        SyncCheckpoint {
            slot: block.slot(),
            block_root: block.hash_tree_root(),
            parent_root: block.parent_root(),
        }
    }

    #[test]
    fn back_sync_walks_the_ancestry_to_genesis() -> Result<()> {
        let blocks = chain(5);
        let anchor = checkpoint_for(&blocks[4]);

        let database = Arc::new(Database::in_memory());
        let mut back_sync = BackSync::load(database.clone(), anchor)?;

        back_sync.push_blocks(blocks[..4].iter().rev().cloned())?;

        assert!(back_sync.is_finished());
        assert_eq!(back_sync.checkpoint().slot, 0);

        // The checkpoint was persisted and survives a reload.
        let reloaded = BackSync::load(database, anchor)?;
        assert_eq!(reloaded.checkpoint(), back_sync.checkpoint());

        Ok(())
    }

    #[test]
    fn blocks_off_the_verified_ancestry_are_rejected() -> Result<()> {
        let blocks = chain(5);
        let anchor = checkpoint_for(&blocks[4]);

        let database = Arc::new(Database::in_memory());
        let mut back_sync = BackSync::load(database, anchor)?;

        let impostor = Arc::new(SignedBeaconBlock::from_block(
            BeaconBlock::empty(Phase::Phase0, 3, 9, H256::repeat_byte(9)),
            Default::default(),
        ));

        assert!(back_sync.push_blocks([impostor]).is_err());

        Ok(())
    }
}
