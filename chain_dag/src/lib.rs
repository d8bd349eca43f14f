pub use crate::{
    dag::{ChainDag, DagError, HeadInfo, NodeHandle},
    storage::Storage,
    sync_pointers::SyncCheckpoint,
};

mod dag;
mod storage;
mod sync_pointers;
