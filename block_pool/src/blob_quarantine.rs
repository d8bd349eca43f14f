use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use log::debug;
use metrics::Metrics;
use types::{
    combined::SignedBeaconBlock,
    consts::{MAX_BLOBS_PER_BLOCK, SLOTS_PER_EPOCH},
    containers::{BlobIdentifier, BlobSidecar},
    primitives::{BlobIndex, Slot, ValidatorIndex, H256},
};

/// Blobs retained while waiting for their block. Bounded; the oldest entry by
/// insertion order is evicted when a new blob would exceed the capacity, so
/// insertion is advisory and may silently drop under pressure.
const CAPACITY: usize = (SLOTS_PER_EPOCH.get() * MAX_BLOBS_PER_BLOCK) as usize;

#[derive(Default)]
pub struct BlobQuarantine {
    blobs: HashMap<BlobIdentifier, Arc<BlobSidecar>>,
    insertion_order: VecDeque<BlobIdentifier>,
}

/// Roots and indices a block is still missing, for by-root requests.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlobFetchRecord {
    pub block_root: H256,
    pub missing_indices: Vec<BlobIndex>,
}

impl BlobQuarantine {
    /// Inserts a blob keyed by `(block_root, index)`. At most once: a blob
    /// already present under the same key is left untouched.
    pub fn put(&mut self, blob_sidecar: Arc<BlobSidecar>) {
        let blob_identifier = BlobIdentifier::from(blob_sidecar.as_ref());

        if self.blobs.contains_key(&blob_identifier) {
            return;
        }

        while self.blobs.len() >= CAPACITY {
            let Some(oldest) = self.insertion_order.pop_front() else {
                break;
            };

            debug!("blob quarantine full; evicting {oldest:?}");

            self.blobs.remove(&oldest);
        }

        self.blobs.insert(blob_identifier, blob_sidecar);
        self.insertion_order.push_back(blob_identifier);
    }

    /// Indices present for `block_root`, sorted ascending.
    #[must_use]
    pub fn blob_indices(&self, block_root: H256) -> Vec<BlobIndex> {
        let mut indices = self
            .blobs
            .keys()
            .filter(|blob_identifier| blob_identifier.block_root == block_root)
            .map(|blob_identifier| blob_identifier.index)
            .collect::<Vec<_>>();

        indices.sort_unstable();
        indices
    }

    /// Used for gossip deduplication before the block (and thus its root)
    /// is known. Linear scan; the quarantine is small.
    #[must_use]
    pub fn has_blob_at(
        &self,
        slot: Slot,
        proposer_index: ValidatorIndex,
        index: BlobIndex,
    ) -> bool {
        self.blobs.values().any(|blob_sidecar| {
            blob_sidecar.slot() == slot
                && blob_sidecar.proposer_index() == proposer_index
                && blob_sidecar.index == index
        })
    }

    /// True iff every commitment of `block` has its blob present, i.e. the
    /// indices for the block root are exactly `0..commitment_count`.
    #[must_use]
    pub fn has_blobs(&self, block: &SignedBeaconBlock) -> bool {
        let Some(commitments) = block.blob_kzg_commitments() else {
            return true;
        };

        let block_root = block.hash_tree_root();
        let indices = self.blob_indices(block_root);

        indices.len() == commitments.len()
            && indices
                .iter()
                .zip(0..)
                .all(|(index, expected)| *index == expected)
    }

    /// Removes and returns the contiguous prefix of blobs starting at index 0,
    /// stopping at the first gap.
    pub fn pop_blobs(&mut self, block_root: H256) -> Vec<Arc<BlobSidecar>> {
        let mut popped = vec![];

        for index in 0..MAX_BLOBS_PER_BLOCK {
            let blob_identifier = BlobIdentifier { block_root, index };

            match self.blobs.remove(&blob_identifier) {
                Some(blob_sidecar) => popped.push(blob_sidecar),
                None => break,
            }
        }

        if !popped.is_empty() {
            let blobs = &self.blobs;
            self.insertion_order
                .retain(|blob_identifier| blobs.contains_key(blob_identifier));
        }

        popped
    }

    /// What `block` is still missing from the quarantine.
    #[must_use]
    pub fn fetch_record(&self, block: &SignedBeaconBlock) -> BlobFetchRecord {
        let block_root = block.hash_tree_root();
        let commitment_count = block
            .blob_kzg_commitments()
            .map(<[_]>::len)
            .unwrap_or_default() as BlobIndex;

        let missing_indices = (0..commitment_count)
            .filter(|index| {
                let blob_identifier = BlobIdentifier {
                    block_root,
                    index: *index,
                };

                !self.blobs.contains_key(&blob_identifier)
            })
            .collect();

        BlobFetchRecord {
            block_root,
            missing_indices,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn track_collection_metrics(&self, metrics: &Arc<Metrics>) {
        metrics.set_collection_length(module_path!(), "blobs", self.blobs.len());
    }
}

#[cfg(test)]
mod tests {
    use types::{
        containers::{BeaconBlockHeader, SignedBeaconBlockHeader},
        deneb,
        nonstandard::Phase,
        primitives::KzgCommitment,
    };

    use super::*;

    fn deneb_block_with_commitments(slot: Slot, commitment_count: usize) -> SignedBeaconBlock {
        let mut block = deneb::BeaconBlock {
            slot,
            ..Default::default()
        };

        block.body.blob_kzg_commitments =
            vec![KzgCommitment::repeat_byte(1); commitment_count];

        SignedBeaconBlock::from_block(block.into(), Default::default())
    }

    fn blob_for(block: &SignedBeaconBlock, index: BlobIndex) -> Arc<BlobSidecar> {
        Arc::new(BlobSidecar {
            index,
            blob: Arc::from(vec![0; 8].into_boxed_slice()),
            kzg_commitment: KzgCommitment::repeat_byte(1),
            kzg_proof: Default::default(),
            signed_block_header: block.signed_header(),
        })
    }

    fn unrelated_blob(slot: Slot, index: BlobIndex) -> Arc<BlobSidecar> {
        Arc::new(BlobSidecar {
            index,
            blob: Arc::from(vec![0; 8].into_boxed_slice()),
            kzg_commitment: KzgCommitment::repeat_byte(2),
            kzg_proof: Default::default(),
            signed_block_header: SignedBeaconBlockHeader {
                message: BeaconBlockHeader {
                    slot,
                    proposer_index: slot,
                    ..Default::default()
                },
                signature: Default::default(),
            },
        })
    }

    #[test]
    fn has_blobs_requires_a_contiguous_prefix_of_all_commitments() {
        let block = deneb_block_with_commitments(5, 3);
        let mut quarantine = BlobQuarantine::default();

        quarantine.put(blob_for(&block, 1));
        quarantine.put(blob_for(&block, 2));

        assert!(!quarantine.has_blobs(&block));

        quarantine.put(blob_for(&block, 0));

        assert!(quarantine.has_blobs(&block));
    }

    #[test]
    fn has_blobs_holds_trivially_for_blocks_before_deneb() {
        let block = SignedBeaconBlock::from_block(
            types::combined::BeaconBlock::empty(Phase::Capella, 5, 0, H256::zero()),
            Default::default(),
        );

        assert!(BlobQuarantine::default().has_blobs(&block));
    }

    #[test]
    fn pop_blobs_returns_the_contiguous_prefix_in_index_order() {
        let block = deneb_block_with_commitments(5, 4);
        let block_root = block.hash_tree_root();
        let mut quarantine = BlobQuarantine::default();

        quarantine.put(blob_for(&block, 0));
        quarantine.put(blob_for(&block, 1));
        quarantine.put(blob_for(&block, 3));

        let popped = quarantine.pop_blobs(block_root);

        assert_eq!(
            popped.iter().map(|blob| blob.index).collect::<Vec<_>>(),
            [0, 1],
        );
        assert_eq!(quarantine.blob_indices(block_root), [3]);
    }

    #[test]
    fn put_is_idempotent_per_identifier() {
        let block = deneb_block_with_commitments(5, 1);
        let mut quarantine = BlobQuarantine::default();

        quarantine.put(blob_for(&block, 0));
        quarantine.put(blob_for(&block, 0));

        assert_eq!(quarantine.len(), 1);
    }

    #[test]
    fn capacity_is_enforced_by_evicting_the_oldest_entry() {
        let mut quarantine = BlobQuarantine::default();

        for slot in 0..CAPACITY as u64 {
            quarantine.put(unrelated_blob(slot, 0));
        }

        assert_eq!(quarantine.len(), CAPACITY);
        assert!(quarantine.has_blob_at(0, 0, 0));

        quarantine.put(unrelated_blob(CAPACITY as u64, 0));

        assert_eq!(quarantine.len(), CAPACITY);
        assert!(!quarantine.has_blob_at(0, 0, 0));
        assert!(quarantine.has_blob_at(CAPACITY as u64, CAPACITY as u64, 0));
    }

    #[test]
    fn fetch_record_lists_missing_indices() {
        let block = deneb_block_with_commitments(5, 3);
        let mut quarantine = BlobQuarantine::default();

        quarantine.put(blob_for(&block, 1));

        let record = quarantine.fetch_record(&block);

        assert_eq!(record.block_root, block.hash_tree_root());
        assert_eq!(record.missing_indices, [0, 2]);
    }
}
