use std::path::PathBuf;

use types::primitives::{Epoch, H256};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum HistoryMode {
    /// Retain every block and state.
    #[default]
    Archive,
    /// Prune blocks and blobs outside the retention windows.
    Prune,
}

impl HistoryMode {
    #[must_use]
    pub const fn is_prune(self) -> bool {
        matches!(self, Self::Prune)
    }
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub in_memory: bool,
    pub data_dir: PathBuf,
    pub database_dir: Option<PathBuf>,
    pub era_dir: Option<PathBuf>,
    pub history_mode: HistoryMode,
}

impl StorageConfig {
    #[must_use]
    pub fn database_dir(&self) -> PathBuf {
        self.database_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("db"))
    }
}

/// Node-level settings assembled by the CLI layer.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub storage: StorageConfig,
    pub validators_dir: Option<PathBuf>,
    pub secrets_dir: Option<PathBuf>,
    pub metrics_enabled: bool,
    pub subscribe_all_subnets: bool,
    pub detect_doppelgangers: bool,
    pub back_sync_enabled: bool,
    pub slashing_protection_history_limit: u64,
    pub max_events: usize,
    pub stop_at_epoch: Option<Epoch>,
    pub stop_at_synced_epoch: Option<Epoch>,
    pub weak_subjectivity_checkpoint: Option<(Epoch, H256)>,
    pub genesis_state_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                in_memory: true,
                data_dir: PathBuf::from("."),
                database_dir: None,
                era_dir: None,
                history_mode: HistoryMode::default(),
            },
            validators_dir: None,
            secrets_dir: None,
            metrics_enabled: false,
            subscribe_all_subnets: false,
            detect_doppelgangers: false,
            back_sync_enabled: false,
            slashing_protection_history_limit: 64,
            max_events: events::DEFAULT_MAX_EVENTS,
            stop_at_epoch: None,
            stop_at_synced_epoch: None,
            weak_subjectivity_checkpoint: None,
            genesis_state_file: None,
        }
    }
}
