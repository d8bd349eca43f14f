use std::{collections::HashMap, sync::Arc};

use log::debug;
use metrics::Metrics;
use thiserror::Error;
use types::{combined::SignedBeaconBlock, primitives::{Slot, H256}};

const CAPACITY: usize = 64;

/// Why a block was not admitted to the quarantine.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum QuarantineRejection {
    /// The block cannot extend the canonical chain anymore.
    #[error("block conflicts with finalized chain")]
    UnviableFork,
    /// The quarantine is full; the block may be resubmitted later.
    #[error("block quarantine is full")]
    Full,
}

/// Blocks that cannot be processed yet: orphans whose parent is unknown and
/// Deneb blocks whose blobs have not all arrived.
#[derive(Default)]
pub struct BlockQuarantine {
    /// Orphans keyed by the missing parent root.
    by_parent: HashMap<H256, Vec<Arc<SignedBeaconBlock>>>,
    /// Blocks waiting for blob sidecars, keyed by their own root.
    blobless: HashMap<H256, Arc<SignedBeaconBlock>>,
    stored: usize,
}

impl BlockQuarantine {
    /// Admits a block whose parent is unknown.
    pub fn add_orphan(
        &mut self,
        finalized_slot: Slot,
        block: Arc<SignedBeaconBlock>,
    ) -> Result<(), QuarantineRejection> {
        self.check_admissible(finalized_slot, &block)?;

        let parent_root = block.parent_root();

        debug!(
            "quarantining orphan (slot: {}, parent: {parent_root:?})",
            block.slot(),
        );

        self.by_parent.entry(parent_root).or_default().push(block);
        self.stored += 1;

        Ok(())
    }

    /// Admits a block whose blobs are incomplete.
    pub fn add_blobless(
        &mut self,
        finalized_slot: Slot,
        block: Arc<SignedBeaconBlock>,
    ) -> Result<(), QuarantineRejection> {
        self.check_admissible(finalized_slot, &block)?;

        let block_root = block.hash_tree_root();

        debug!(
            "quarantining blobless block (slot: {}, root: {block_root:?})",
            block.slot(),
        );

        if self.blobless.insert(block_root, block).is_none() {
            self.stored += 1;
        }

        Ok(())
    }

    /// Removes and returns the blocks waiting for `parent_root`.
    pub fn take_children(&mut self, parent_root: H256) -> Vec<Arc<SignedBeaconBlock>> {
        let children = self.by_parent.remove(&parent_root).unwrap_or_default();
        self.stored -= children.len();
        children
    }

    /// Removes and returns the blobless block with the given root.
    pub fn take_blobless(&mut self, block_root: H256) -> Option<Arc<SignedBeaconBlock>> {
        let block = self.blobless.remove(&block_root);
        self.stored -= usize::from(block.is_some());
        block
    }

    /// Roots of blocks waiting for blobs, for retry when blobs arrive.
    pub fn blobless_roots(&self) -> impl Iterator<Item = H256> + '_ {
        self.blobless.keys().copied()
    }

    /// Parent roots this quarantine is waiting for, for by-root requests.
    pub fn missing_parent_roots(&self) -> impl Iterator<Item = H256> + '_ {
        self.by_parent.keys().copied()
    }

    /// Drops entries that can no longer become canonical.
    pub fn prune(&mut self, finalized_slot: Slot) {
        self.by_parent.retain(|_, blocks| {
            blocks.retain(|block| block.slot() > finalized_slot);
            !blocks.is_empty()
        });

        self.blobless.retain(|_, block| block.slot() > finalized_slot);

        self.stored = self.blobless.len()
            + self
                .by_parent
                .values()
                .map(Vec::len)
                .sum::<usize>();
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.stored
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.stored == 0
    }

    pub fn track_collection_metrics(&self, metrics: &Arc<Metrics>) {
        metrics.set_collection_length(module_path!(), "orphans", self.by_parent.len());
        metrics.set_collection_length(module_path!(), "blobless", self.blobless.len());
    }

    fn check_admissible(
        &self,
        finalized_slot: Slot,
        block: &SignedBeaconBlock,
    ) -> Result<(), QuarantineRejection> {
        if block.slot() <= finalized_slot {
            return Err(QuarantineRejection::UnviableFork);
        }

        if self.stored >= CAPACITY {
            return Err(QuarantineRejection::Full);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use types::{combined::BeaconBlock, nonstandard::Phase};

    use super::*;

    fn block_at(slot: Slot, parent_root: H256) -> Arc<SignedBeaconBlock> {
        Arc::new(SignedBeaconBlock::from_block(
            BeaconBlock::empty(Phase::Capella, slot, slot, parent_root),
            Default::default(),
        ))
    }

    #[test]
    fn blocks_at_or_before_the_finalized_slot_are_unviable() {
        let mut quarantine = BlockQuarantine::default();

        assert_eq!(
            quarantine.add_orphan(100, block_at(100, H256::zero())),
            Err(QuarantineRejection::UnviableFork),
        );
        assert!(quarantine.add_orphan(100, block_at(101, H256::zero())).is_ok());
    }

    #[test]
    fn a_full_quarantine_rejects_with_a_retryable_error() {
        let mut quarantine = BlockQuarantine::default();

        for slot in 0..CAPACITY as u64 {
            quarantine
                .add_orphan(0, block_at(slot + 1, H256::repeat_byte(1)))
                .expect("quarantine is not full yet");
        }

        assert_eq!(
            quarantine.add_orphan(0, block_at(999, H256::zero())),
            Err(QuarantineRejection::Full),
        );
    }

    #[test]
    fn children_are_returned_for_their_missing_parent() {
        let mut quarantine = BlockQuarantine::default();
        let parent_root = H256::repeat_byte(3);

        let child_a = block_at(5, parent_root);
        let child_b = block_at(6, parent_root);

        quarantine.add_orphan(0, child_a.clone()).expect("not full");
        quarantine.add_orphan(0, child_b.clone()).expect("not full");
        quarantine
            .add_orphan(0, block_at(7, H256::repeat_byte(9)))
            .expect("not full");

        let children = quarantine.take_children(parent_root);

        assert_eq!(children, [child_a, child_b]);
        assert_eq!(quarantine.len(), 1);
    }

    #[test]
    fn pruning_removes_entries_at_or_below_the_finalized_slot() {
        let mut quarantine = BlockQuarantine::default();

        quarantine.add_orphan(0, block_at(5, H256::zero())).expect("not full");
        quarantine.add_blobless(0, block_at(50, H256::zero())).expect("not full");

        quarantine.prune(10);

        assert_eq!(quarantine.len(), 1);
        assert_eq!(quarantine.blobless_roots().count(), 1);
    }
}
