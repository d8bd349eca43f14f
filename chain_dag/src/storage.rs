use std::sync::Arc;

use anyhow::Result;
use database::Database;
use log::debug;
use types::{
    combined::SignedBeaconBlock,
    config::Config,
    consts::MIN_EPOCHS_FOR_BLOB_SIDECARS_REQUESTS,
    containers::BlobSidecar,
    misc,
    nonstandard::Phase,
    primitives::{Epoch, Slot, H256},
};

const BLOB_PREFIX: &str = "blob";
const BLOCK_PREFIX: &str = "block";

/// Persists finalized blocks and blob sidecars and answers pruning requests.
///
/// Keys embed the slot zero-padded to 20 digits so that lexicographic order
/// over keys matches slot order.
pub struct Storage {
    config: Arc<Config>,
    database: Database,
}

impl Storage {
    #[must_use]
    pub const fn new(config: Arc<Config>, database: Database) -> Self {
        Self { config, database }
    }

    pub fn save_block(&self, block: &SignedBeaconBlock) -> Result<()> {
        let key = block_key(block.slot(), block.hash_tree_root());
        let value = serde_json::to_vec(block)?;

        self.database.put(key, value)
    }

    pub fn save_blob_sidecars(
        &self,
        blob_sidecars: impl IntoIterator<Item = Arc<BlobSidecar>>,
    ) -> Result<()> {
        for blob_sidecar in blob_sidecars {
            let key = blob_key(
                blob_sidecar.slot(),
                blob_sidecar.block_root(),
                blob_sidecar.index,
            );
            let value = serde_json::to_vec(blob_sidecar.as_ref())?;

            self.database.put(key, value)?;
        }

        Ok(())
    }

    pub fn contains_block(&self, slot: Slot, root: H256) -> Result<bool> {
        self.database.contains(block_key(slot, root))
    }

    /// Deletes sidecars outside the blob retention window.
    ///
    /// Sidecars must be served for `MIN_EPOCHS_FOR_BLOB_SIDECARS_REQUESTS`
    /// epochs, so everything up to and including
    /// `current_epoch - MIN_EPOCHS_FOR_BLOB_SIDECARS_REQUESTS - 1` is deleted.
    /// A no-op before the retention window has passed since the Deneb fork.
    pub fn prune_blob_sidecars(&self, current_epoch: Epoch) -> Result<usize> {
        let Some(cutoff_epoch) =
            current_epoch.checked_sub(MIN_EPOCHS_FOR_BLOB_SIDECARS_REQUESTS + 1)
        else {
            return Ok(0);
        };

        if cutoff_epoch < self.config.fork_epoch(Phase::Deneb) {
            return Ok(0);
        }

        let first_retained_slot = misc::compute_start_slot_at_epoch(cutoff_epoch + 1);
        let pruned = self.delete_up_to(BLOB_PREFIX, first_retained_slot)?;

        if pruned > 0 {
            debug!("pruned {pruned} blob sidecar(s) below slot {first_retained_slot}");
        }

        Ok(pruned)
    }

    /// Deletes blocks below `up_to_slot`. Only called in pruning history mode.
    pub fn prune_history(&self, up_to_slot: Slot) -> Result<usize> {
        let pruned = self.delete_up_to(BLOCK_PREFIX, up_to_slot)?;

        if pruned > 0 {
            debug!("pruned {pruned} block(s) below slot {up_to_slot}");
        }

        Ok(pruned)
    }

    /// Flushes the write-ahead log.
    pub fn checkpoint(&self) -> Result<()> {
        self.database.checkpoint()
    }

    fn delete_up_to(&self, prefix: &str, up_to_slot: Slot) -> Result<usize> {
        let mut pruned = 0;

        for key in self.database.keys_with_prefix(format!("{prefix}/"))? {
            if key_slot(&key) < Some(up_to_slot) {
                self.database.delete(&key)?;
                pruned += 1;
            }
        }

        Ok(pruned)
    }
}

fn block_key(slot: Slot, root: H256) -> String {
    format!("{BLOCK_PREFIX}/{slot:020}/{root:?}")
}

fn blob_key(slot: Slot, root: H256, index: u64) -> String {
    format!("{BLOB_PREFIX}/{slot:020}/{root:?}/{index}")
}

fn key_slot(key: &[u8]) -> Option<Slot> {
    let key = core::str::from_utf8(key).ok()?;
    key.split('/').nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use types::containers::{BeaconBlockHeader, SignedBeaconBlockHeader};

    use super::*;

    fn blob_at_slot(slot: Slot, index: u64) -> Arc<BlobSidecar> {
        Arc::new(BlobSidecar {
            index,
            blob: Arc::from(vec![0; 8].into_boxed_slice()),
            kzg_commitment: Default::default(),
            kzg_proof: Default::default(),
            signed_block_header: SignedBeaconBlockHeader {
                message: BeaconBlockHeader {
                    slot,
                    ..Default::default()
                },
                signature: Default::default(),
            },
        })
    }

    fn storage_with_deneb_at(deneb_fork_epoch: Epoch) -> Storage {
        let mut config = Config::minimal();
        config.deneb_fork_epoch = deneb_fork_epoch;

        Storage::new(Arc::new(config), Database::in_memory())
    }

    #[test]
    fn prune_blob_sidecars_deletes_exactly_the_expired_epoch() -> Result<()> {
        let storage = storage_with_deneb_at(0);
        let current_epoch = MIN_EPOCHS_FOR_BLOB_SIDECARS_REQUESTS + 2;

        let expired_epoch = current_epoch - MIN_EPOCHS_FOR_BLOB_SIDECARS_REQUESTS - 1;
        let retained_epoch = current_epoch - MIN_EPOCHS_FOR_BLOB_SIDECARS_REQUESTS;

        let expired_slot = misc::compute_start_slot_at_epoch(expired_epoch);
        let retained_slot = misc::compute_start_slot_at_epoch(retained_epoch);

        storage.save_blob_sidecars([
            blob_at_slot(expired_slot, 0),
            blob_at_slot(expired_slot + 1, 0),
            blob_at_slot(retained_slot, 0),
        ])?;

        assert_eq!(storage.prune_blob_sidecars(current_epoch)?, 2);

        // Pruning again is a no-op.
        assert_eq!(storage.prune_blob_sidecars(current_epoch)?, 0);

        Ok(())
    }

    #[test]
    fn prune_blob_sidecars_is_a_no_op_before_the_retention_window_passes() -> Result<()> {
        let storage = storage_with_deneb_at(10);

        storage.save_blob_sidecars([blob_at_slot(320, 0)])?;

        assert_eq!(
            storage.prune_blob_sidecars(MIN_EPOCHS_FOR_BLOB_SIDECARS_REQUESTS + 10)?,
            0,
        );

        Ok(())
    }
}
