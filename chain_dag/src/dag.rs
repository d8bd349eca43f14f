use std::{collections::HashMap, sync::Arc};

use log::debug;
use std_ext::ArcExt as _;
use thiserror::Error;
use types::{
    beacon_state::BeaconState,
    combined::SignedBeaconBlock,
    containers::Checkpoint,
    misc,
    primitives::{Epoch, Gwei, Slot, ValidatorIndex, H256},
};

use crate::sync_pointers::SyncCheckpoint;

/// Index of a block in the arena. Handles are only valid for the [`ChainDag`]
/// value that produced them and are invalidated by pruning.
pub type NodeHandle = usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum DagError {
    #[error("parent of block is not in the block tree")]
    MissingParent,
    #[error("block is already in the block tree")]
    Duplicate,
    #[error("block conflicts with finalized chain")]
    UnviableFork,
}

#[derive(Clone)]
struct BlockNode {
    root: H256,
    slot: Slot,
    parent: Option<NodeHandle>,
    children: Vec<NodeHandle>,
    block: Arc<SignedBeaconBlock>,
    state: Arc<BeaconState>,
}

#[derive(Clone, Copy)]
struct LatestVote {
    root: H256,
    epoch: Epoch,
    weight: Gwei,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeadInfo {
    pub root: H256,
    pub slot: Slot,
}

/// The unfinalized block tree.
///
/// Nodes live in an arena indexed by [`NodeHandle`]; parents are stored as
/// handles and children as vectors of handles, so the tree contains no owning
/// cycles. The arena is kept in topological order: a parent's handle is always
/// lower than the handles of its descendants. Pruning rebuilds the arena.
#[derive(Clone)]
pub struct ChainDag {
    nodes: Vec<BlockNode>,
    index: HashMap<H256, NodeHandle>,
    head: NodeHandle,
    finalized: NodeHandle,
    finalized_checkpoint: Checkpoint,
    latest_votes: HashMap<ValidatorIndex, LatestVote>,
    backfill: SyncCheckpoint,
}

impl ChainDag {
    #[must_use]
    pub fn new(anchor_block: Arc<SignedBeaconBlock>, anchor_state: Arc<BeaconState>) -> Self {
        let root = anchor_block.hash_tree_root();
        let slot = anchor_block.slot();
        let parent_root = anchor_block.parent_root();

        let anchor = BlockNode {
            root,
            slot,
            parent: None,
            children: vec![],
            block: anchor_block,
            state: anchor_state,
        };

        Self {
            nodes: vec![anchor],
            index: HashMap::from([(root, 0)]),
            head: 0,
            finalized: 0,
            finalized_checkpoint: Checkpoint {
                epoch: misc::compute_epoch_at_slot(slot),
                root,
            },
            latest_votes: HashMap::new(),
            backfill: SyncCheckpoint {
                slot,
                block_root: root,
                parent_root,
            },
        }
    }

    pub fn insert(
        &mut self,
        block: Arc<SignedBeaconBlock>,
        state: Arc<BeaconState>,
    ) -> Result<NodeHandle, DagError> {
        let root = block.hash_tree_root();

        if self.index.contains_key(&root) {
            return Err(DagError::Duplicate);
        }

        if block.slot() <= self.finalized_slot() {
            return Err(DagError::UnviableFork);
        }

        let parent = *self
            .index
            .get(&block.parent_root())
            .ok_or(DagError::MissingParent)?;

        let handle = self.nodes.len();

        self.nodes.push(BlockNode {
            root,
            slot: block.slot(),
            parent: Some(parent),
            children: vec![],
            block,
            state,
        });

        self.nodes[parent].children.push(handle);
        self.index.insert(root, handle);

        Ok(handle)
    }

    /// Records the latest attestation of a validator for fork choice.
    /// Older votes from the same validator are superseded, never combined.
    pub fn apply_vote(
        &mut self,
        validator_index: ValidatorIndex,
        beacon_block_root: H256,
        epoch: Epoch,
        weight: Gwei,
    ) {
        match self.latest_votes.get(&validator_index) {
            Some(existing) if existing.epoch >= epoch => {}
            _ => {
                self.latest_votes.insert(
                    validator_index,
                    LatestVote {
                        root: beacon_block_root,
                        epoch,
                        weight,
                    },
                );
            }
        }
    }

    /// LMD-GHOST: walk from the finalized block towards the leaves, at each
    /// step descending into the child with the greatest attestation weight.
    /// Equal weights are broken in favor of the lower block root.
    pub fn select_head(&mut self) -> HeadInfo {
        let weights = self.subtree_weights();

        let mut current = self.finalized;

        loop {
            let best_child = self.nodes[current]
                .children
                .iter()
                .copied()
                .min_by(|left, right| {
                    weights[*right]
                        .cmp(&weights[*left])
                        .then_with(|| self.nodes[*left].root.cmp(&self.nodes[*right].root))
                });

            match best_child {
                Some(child) => current = child,
                None => break,
            }
        }

        self.head = current;
        self.head_info()
    }

    fn subtree_weights(&self) -> Vec<Gwei> {
        let mut weights = vec![0; self.nodes.len()];

        for vote in self.latest_votes.values() {
            if let Some(handle) = self.index.get(&vote.root) {
                weights[*handle] += vote.weight;
            }
        }

        // The arena is topologically ordered, so a single reverse pass
        // accumulates every subtree into its root.
        for handle in (1..self.nodes.len()).rev() {
            if let Some(parent) = self.nodes[handle].parent {
                weights[parent] += weights[handle];
            }
        }

        weights
    }

    #[must_use]
    pub fn head_info(&self) -> HeadInfo {
        HeadInfo {
            root: self.nodes[self.head].root,
            slot: self.nodes[self.head].slot,
        }
    }

    #[must_use]
    pub fn head_state(&self) -> Arc<BeaconState> {
        self.nodes[self.head].state.clone_arc()
    }

    #[must_use]
    pub fn head_block(&self) -> Arc<SignedBeaconBlock> {
        self.nodes[self.head].block.clone_arc()
    }

    #[must_use]
    pub const fn finalized_checkpoint(&self) -> Checkpoint {
        self.finalized_checkpoint
    }

    #[must_use]
    pub fn finalized_slot(&self) -> Slot {
        self.nodes[self.finalized].slot
    }

    #[must_use]
    pub fn finalized_root(&self) -> H256 {
        self.nodes[self.finalized].root
    }

    #[must_use]
    pub const fn backfill(&self) -> SyncCheckpoint {
        self.backfill
    }

    pub fn set_backfill(&mut self, checkpoint: SyncCheckpoint) {
        self.backfill = checkpoint;
    }

    #[must_use]
    pub fn contains_block(&self, root: H256) -> bool {
        self.index.contains_key(&root)
    }

    #[must_use]
    pub fn block_by_root(&self, root: H256) -> Option<Arc<SignedBeaconBlock>> {
        let handle = self.index.get(&root)?;
        Some(self.nodes[*handle].block.clone_arc())
    }

    #[must_use]
    pub fn state_by_root(&self, root: H256) -> Option<Arc<BeaconState>> {
        let handle = self.index.get(&root)?;
        Some(self.nodes[*handle].state.clone_arc())
    }

    #[must_use]
    pub fn is_ancestor(&self, ancestor_root: H256, descendant_root: H256) -> bool {
        let Some(ancestor) = self.index.get(&ancestor_root) else {
            return false;
        };
        let Some(descendant) = self.index.get(&descendant_root) else {
            return false;
        };

        let mut current = *descendant;

        while current > *ancestor {
            match self.nodes[current].parent {
                Some(parent) => current = parent,
                None => return false,
            }
        }

        current == *ancestor
    }

    /// The newest ancestor of `root` (inclusive) at or before `slot`.
    #[must_use]
    pub fn ancestor_at_or_before(&self, root: H256, slot: Slot) -> Option<HeadInfo> {
        let mut current = *self.index.get(&root)?;

        loop {
            let node = &self.nodes[current];

            if node.slot <= slot {
                break Some(HeadInfo {
                    root: node.root,
                    slot: node.slot,
                });
            }

            current = node.parent?;
        }
    }

    /// The most recent block on both chains, for reorg depth reporting.
    #[must_use]
    pub fn common_ancestor(&self, first_root: H256, second_root: H256) -> Option<HeadInfo> {
        let mut first = *self.index.get(&first_root)?;
        let mut second = *self.index.get(&second_root)?;

        while first != second {
            if first > second {
                first = self.nodes[first].parent?;
            } else {
                second = self.nodes[second].parent?;
            }
        }

        Some(HeadInfo {
            root: self.nodes[first].root,
            slot: self.nodes[first].slot,
        })
    }

    /// Moves the finalized pointer to `checkpoint.root`.
    /// Returns true if finalization advanced.
    ///
    /// The new finalized block must already be in the tree and must be an
    /// ancestor of the current head.
    pub fn update_finalized(&mut self, checkpoint: Checkpoint) -> bool {
        if checkpoint.epoch <= self.finalized_checkpoint.epoch {
            return false;
        }

        let Some(handle) = self.index.get(&checkpoint.root).copied() else {
            debug!("finalized checkpoint {checkpoint:?} refers to an unknown block");
            return false;
        };

        assert!(
            self.is_ancestor(checkpoint.root, self.nodes[self.head].root),
            "finalized block must be an ancestor of the head",
        );

        self.finalized = handle;
        self.finalized_checkpoint = checkpoint;

        self.latest_votes
            .retain(|_, vote| vote.epoch >= checkpoint.epoch);

        true
    }

    /// Drops every node that is not the finalized block or a descendant of it
    /// and rebuilds the arena. Handles from before the call are invalidated.
    pub fn prune_finalized(&mut self) -> usize {
        let mut retained = vec![false; self.nodes.len()];
        retained[self.finalized] = true;

        // Topological order: parents come first.
        for handle in self.finalized + 1..self.nodes.len() {
            if let Some(parent) = self.nodes[handle].parent {
                retained[handle] = retained[parent];
            }
        }

        let pruned = retained.iter().filter(|kept| !**kept).count();

        if pruned == 0 && self.finalized == 0 {
            return 0;
        }

        let mut remapped = vec![usize::MAX; self.nodes.len()];
        let mut nodes = Vec::with_capacity(self.nodes.len() - pruned);
        let mut index = HashMap::with_capacity(self.nodes.len() - pruned);

        for (handle, node) in self.nodes.drain(..).enumerate() {
            if !retained[handle] {
                continue;
            }

            let mut node = node;
            let new_handle = nodes.len();

            node.parent = node
                .parent
                .filter(|_| handle != self.finalized)
                .map(|parent| remapped[parent]);
            node.children.clear();

            remapped[handle] = new_handle;
            index.insert(node.root, new_handle);
            nodes.push(node);
        }

        for handle in 0..nodes.len() {
            if let Some(parent) = nodes[handle].parent {
                nodes[parent].children.push(handle);
            }
        }

        self.head = remapped[self.head];
        self.finalized = remapped[self.finalized];
        self.nodes = nodes;
        self.index = index;

        pruned
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Blocks from the finalized block to the head, oldest first.
    pub fn canonical_chain(&self) -> Vec<HeadInfo> {
        let mut chain = vec![];
        let mut current = Some(self.head);

        while let Some(handle) = current {
            chain.push(HeadInfo {
                root: self.nodes[handle].root,
                slot: self.nodes[handle].slot,
            });

            if handle == self.finalized {
                break;
            }

            current = self.nodes[handle].parent;
        }

        chain.reverse();
        chain
    }
}

#[cfg(test)]
mod tests {
    use types::{combined::BeaconBlock, nonstandard::Phase};

    use super::*;

    fn anchor() -> (Arc<SignedBeaconBlock>, Arc<BeaconState>) {
        let block = Arc::new(SignedBeaconBlock::from_block(
            BeaconBlock::empty(Phase::Capella, 0, 0, H256::zero()),
            Default::default(),
        ));

        (block, Arc::new(BeaconState::default()))
    }

    fn block_with_graffiti(slot: Slot, parent_root: H256, graffiti: u8) -> Arc<SignedBeaconBlock> {
        let BeaconBlock::Capella(mut block) =
            BeaconBlock::empty(Phase::Capella, slot, 0, parent_root)
        else {
            unreachable!();
        };

        block.body.graffiti = H256::repeat_byte(graffiti);

        Arc::new(SignedBeaconBlock::from_block(
            block.into(),
            Default::default(),
        ))
    }

    fn insert_chain(
        dag: &mut ChainDag,
        parent_root: H256,
        fork_tag: u8,
        slots: &[Slot],
    ) -> Vec<H256> {
        let mut roots = vec![];
        let mut parent_root = parent_root;

        for slot in slots {
            let block = block_with_graffiti(*slot, parent_root, fork_tag ^ *slot as u8);
            let root = block.hash_tree_root();

            dag.insert(block, Arc::new(BeaconState::default()))
                .expect("parent is present");

            roots.push(root);
            parent_root = root;
        }

        roots
    }

    #[test]
    fn insert_rejects_unknown_parents_and_duplicates() {
        let (anchor_block, anchor_state) = anchor();
        let mut dag = ChainDag::new(anchor_block.clone(), anchor_state);

        let orphan = block_with_graffiti(1, H256::repeat_byte(9), 0);

        assert_eq!(
            dag.insert(orphan, Arc::new(BeaconState::default())),
            Err(DagError::MissingParent),
        );

        let child = block_with_graffiti(1, anchor_block.hash_tree_root(), 0);

        dag.insert(child.clone(), Arc::new(BeaconState::default()))
            .expect("parent is present");

        assert_eq!(
            dag.insert(child, Arc::new(BeaconState::default())),
            Err(DagError::Duplicate),
        );
    }

    #[test]
    fn head_follows_attestation_weight() {
        let (anchor_block, anchor_state) = anchor();
        let anchor_root = anchor_block.hash_tree_root();
        let mut dag = ChainDag::new(anchor_block, anchor_state);

        let fork_a = insert_chain(&mut dag, anchor_root, 0xa0, &[1, 2]);
        let fork_b = insert_chain(&mut dag, anchor_root, 0xb0, &[1]);

        dag.apply_vote(0, fork_b[0], 1, 32);
        dag.apply_vote(1, fork_a[1], 1, 16);

        assert_eq!(dag.select_head().root, fork_b[0]);

        // A heavier, newer vote moves the head to the longer fork.
        dag.apply_vote(0, fork_a[0], 2, 32);

        assert_eq!(dag.select_head().root, fork_a[1]);
    }

    #[test]
    fn equal_weights_are_broken_by_lower_root() {
        let (anchor_block, anchor_state) = anchor();
        let anchor_root = anchor_block.hash_tree_root();
        let mut dag = ChainDag::new(anchor_block, anchor_state);

        let fork_a = insert_chain(&mut dag, anchor_root, 0xa0, &[1]);
        let fork_b = insert_chain(&mut dag, anchor_root, 0xb0, &[1]);

        let expected = fork_a[0].min(fork_b[0]);

        assert_eq!(dag.select_head().root, expected);
    }

    #[test]
    fn finalization_prunes_the_losing_fork() {
        let (anchor_block, anchor_state) = anchor();
        let anchor_root = anchor_block.hash_tree_root();
        let mut dag = ChainDag::new(anchor_block, anchor_state);

        let canonical = insert_chain(&mut dag, anchor_root, 0xa0, &[31, 32, 33, 64, 65]);
        let abandoned = insert_chain(&mut dag, anchor_root, 0xb0, &[1, 2]);

        dag.apply_vote(0, canonical[4], 2, 32);
        dag.select_head();

        assert!(dag.update_finalized(Checkpoint {
            epoch: 1,
            root: canonical[1],
        }));

        let pruned = dag.prune_finalized();

        assert_eq!(pruned, 4);
        assert_eq!(dag.finalized_root(), canonical[1]);
        assert!(!dag.contains_block(anchor_root));
        assert!(!dag.contains_block(abandoned[0]));
        assert!(dag.contains_block(canonical[4]));

        // The head survives pruning and the finalized block stays its ancestor.
        assert_eq!(dag.head_info().root, canonical[4]);
        assert!(dag.is_ancestor(dag.finalized_root(), dag.head_info().root));
    }

    #[test]
    fn common_ancestor_of_diverged_forks_is_the_fork_point() {
        let (anchor_block, anchor_state) = anchor();
        let anchor_root = anchor_block.hash_tree_root();
        let mut dag = ChainDag::new(anchor_block, anchor_state);

        let trunk = insert_chain(&mut dag, anchor_root, 0x00, &[98, 99]);
        let fork_a = insert_chain(&mut dag, trunk[1], 0xa0, &[100]);
        let fork_b = insert_chain(&mut dag, trunk[1], 0xb0, &[100]);

        let ancestor = dag
            .common_ancestor(fork_a[0], fork_b[0])
            .expect("both forks are in the tree");

        assert_eq!(ancestor.root, trunk[1]);
        assert_eq!(ancestor.slot, 99);
    }
}
