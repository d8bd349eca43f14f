pub use crate::{
    node_config::{HistoryMode, NodeConfig, StorageConfig},
    runtime::run_node,
    scheduler::SlotScheduler,
    status::{NodeStatus, StatusCell},
};

mod node_config;
mod runtime;
mod scheduler;
mod status;
