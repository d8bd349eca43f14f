use serde::{Deserialize, Serialize};
use types::primitives::{Slot, H256};

/// Where a range sync direction currently stands.
///
/// For the backfiller this records the oldest block whose ancestry has been
/// verified; `parent_root` is the next root to fetch.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub slot: Slot,
    pub block_root: H256,
    pub parent_root: H256,
}

impl SyncCheckpoint {
    #[must_use]
    pub const fn is_genesis(&self) -> bool {
        self.slot == 0
    }
}
