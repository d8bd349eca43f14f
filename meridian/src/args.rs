use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::{Args, Parser, ValueEnum};
use runtime::{HistoryMode, NodeConfig, StorageConfig};
use types::{
    config::Config as ChainConfig,
    primitives::{Epoch, H256},
};

use crate::commands::MeridianCommand;

const APPLICATION_NAME: &str = "Meridian";
const APPLICATION_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Meridian Team <dev@meridian.systems>
/// Ethereum consensus layer client
#[derive(Parser)]
#[clap(display_name = APPLICATION_NAME, verbatim_doc_comment, version = APPLICATION_VERSION)]
pub struct MeridianArgs {
    #[clap(flatten)]
    chain_options: ChainOptions,

    #[clap(flatten)]
    beacon_node_options: BeaconNodeOptions,

    #[clap(flatten)]
    validator_options: ValidatorOptions,

    #[clap(subcommand)]
    command: Option<MeridianCommand>,
}

#[derive(Args)]
struct ChainOptions {
    /// Name of the network to connect to
    #[clap(long, value_enum, default_value_t = Network::Mainnet)]
    network: Network,

    /// Load genesis state from SSZ_OR_JSON_FILE instead of the network bundle
    #[clap(long, value_name = "FILE")]
    genesis_state: Option<PathBuf>,

    /// Weak subjectivity checkpoint in epoch:block_root form
    #[clap(long, value_parser = parse_checkpoint, value_name = "EPOCH:ROOT")]
    weak_subjectivity_checkpoint: Option<(Epoch, H256)>,
}

#[derive(Args)]
struct BeaconNodeOptions {
    /// Parent directory for all node data
    #[clap(long, default_value = ".")]
    data_dir: PathBuf,

    /// Override the chain database location
    #[clap(long)]
    database_dir: Option<PathBuf>,

    /// Directory for cold archive era files
    #[clap(long)]
    era_dir: Option<PathBuf>,

    /// Retention policy for historical blocks and states
    #[clap(long, value_enum, default_value_t = HistoryModeArg::Archive)]
    history_mode: HistoryModeArg,

    /// Enable the metrics endpoint
    #[clap(long)]
    metrics: bool,

    /// Subscribe to all attestation and sync committee subnets
    #[clap(long)]
    subscribe_all_subnets: bool,

    /// Download historical blocks back to genesis after checkpoint sync
    #[clap(long)]
    back_sync: bool,

    /// Number of worker threads for CPU-bound work; defaults to the CPU count
    #[clap(long)]
    num_threads: Option<usize>,

    /// Stop the node when the wall clock reaches this epoch
    #[clap(long)]
    stop_at_epoch: Option<Epoch>,

    /// Stop the node once it is synced to this epoch
    #[clap(long)]
    stop_at_synced_epoch: Option<Epoch>,
}

#[derive(Args)]
struct ValidatorOptions {
    /// Directory with validator keystores
    #[clap(long)]
    validators_dir: Option<PathBuf>,

    /// Directory with validator keystore passwords
    #[clap(long)]
    secrets_dir: Option<PathBuf>,

    /// Listen for other instances signing with our keys before activating
    #[clap(long)]
    doppelganger_detection: bool,

    /// Number of epochs of slashing protection history to keep
    #[clap(long, default_value_t = 64)]
    slashing_protection_history_limit: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Network {
    Mainnet,
    Minimal,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HistoryModeArg {
    Archive,
    Prune,
}

impl From<HistoryModeArg> for HistoryMode {
    fn from(mode: HistoryModeArg) -> Self {
        match mode {
            HistoryModeArg::Archive => Self::Archive,
            HistoryModeArg::Prune => Self::Prune,
        }
    }
}

impl MeridianArgs {
    #[must_use]
    pub fn num_threads(&self) -> Option<usize> {
        self.beacon_node_options.num_threads
    }

    pub fn run(self) -> Result<()> {
        let chain_config = Arc::new(match self.chain_options.network {
            Network::Mainnet => ChainConfig::mainnet(),
            Network::Minimal => ChainConfig::minimal(),
        });

        let node_config = self.node_config();

        match self.command {
            Some(command) => command.run(&node_config),
            None => tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(runtime::run_node(chain_config, node_config)),
        }
    }

    fn node_config(&self) -> NodeConfig {
        let BeaconNodeOptions {
            ref data_dir,
            ref database_dir,
            ref era_dir,
            history_mode,
            metrics,
            subscribe_all_subnets,
            back_sync,
            num_threads: _,
            stop_at_epoch,
            stop_at_synced_epoch,
        } = self.beacon_node_options;

        NodeConfig {
            storage: StorageConfig {
                in_memory: false,
                data_dir: data_dir.clone(),
                database_dir: database_dir.clone(),
                era_dir: era_dir.clone(),
                history_mode: history_mode.into(),
            },
            validators_dir: self.validator_options.validators_dir.clone(),
            secrets_dir: self.validator_options.secrets_dir.clone(),
            metrics_enabled: metrics,
            subscribe_all_subnets,
            detect_doppelgangers: self.validator_options.doppelganger_detection,
            back_sync_enabled: back_sync,
            slashing_protection_history_limit: self
                .validator_options
                .slashing_protection_history_limit,
            stop_at_epoch,
            stop_at_synced_epoch,
            weak_subjectivity_checkpoint: self.chain_options.weak_subjectivity_checkpoint,
            genesis_state_file: self.chain_options.genesis_state.clone(),
            ..NodeConfig::default()
        }
    }
}

fn parse_checkpoint(value: &str) -> Result<(Epoch, H256), String> {
    let (epoch, root) = value
        .split_once(':')
        .ok_or_else(|| "expected EPOCH:ROOT".to_owned())?;

    let epoch = epoch.parse().map_err(|_| "invalid epoch".to_owned())?;

    let root = root
        .strip_prefix("0x")
        .unwrap_or(root)
        .parse()
        .map_err(|_| "invalid block root".to_owned())?;

    Ok((epoch, root))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn command_line_definition_is_consistent() {
        MeridianArgs::command().debug_assert();
    }

    #[test]
    fn checkpoint_parsing_accepts_prefixed_and_bare_roots() {
        let (epoch, _root) = parse_checkpoint(
            "100:0x0000000000000000000000000000000000000000000000000000000000000001",
        )
        .expect("checkpoint is well formed");

        assert_eq!(epoch, 100);

        assert!(parse_checkpoint("100").is_err());
        assert!(parse_checkpoint("x:0x00").is_err());
    }
}
