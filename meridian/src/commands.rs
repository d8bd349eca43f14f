use std::path::PathBuf;

use anyhow::{ensure, Result};
use clap::Subcommand;
use log::info;
use runtime::NodeConfig;
use slashing_protection::SlashingProtector;
use types::primitives::H256;

const ENR_FILE: &str = "beacon_node.enr";

#[derive(Subcommand)]
pub enum MeridianCommand {
    /// Import or export slashing protection interchange files
    #[clap(subcommand)]
    SlashingDb(SlashingDbCommand),
    /// Inspect or recreate the node identity record
    #[clap(subcommand)]
    Record(RecordCommand),
}

#[derive(Subcommand)]
pub enum SlashingDbCommand {
    /// Import an EIP-3076 interchange file into the slashing protection
    /// database
    Import {
        file: PathBuf,

        #[clap(long)]
        genesis_validators_root: H256,
    },
    /// Export the slashing protection database to an EIP-3076 interchange
    /// file
    Export {
        file: PathBuf,

        #[clap(long)]
        genesis_validators_root: H256,
    },
}

#[derive(Subcommand)]
pub enum RecordCommand {
    /// Print the node identity record
    Print,
    /// Delete the stored record so a new identity is created on next start
    Create,
}

impl MeridianCommand {
    pub fn run(self, node_config: &NodeConfig) -> Result<()> {
        match self {
            Self::SlashingDb(command) => command.run(node_config),
            Self::Record(command) => command.run(node_config),
        }
    }
}

impl SlashingDbCommand {
    fn run(self, node_config: &NodeConfig) -> Result<()> {
        match self {
            Self::Import {
                file,
                genesis_validators_root,
            } => {
                let mut protector = SlashingProtector::in_memory(
                    genesis_validators_root,
                    node_config.slashing_protection_history_limit,
                );

                let imported = protector.import_interchange_file(&file)?;

                info!("imported {imported} record(s) from {}", file.display());
            }
            Self::Export {
                file,
                genesis_validators_root,
            } => {
                let protector = SlashingProtector::in_memory(
                    genesis_validators_root,
                    node_config.slashing_protection_history_limit,
                );

                protector.export_to_interchange_file(&file)?;

                info!("exported slashing protection records to {}", file.display());
            }
        }

        Ok(())
    }
}

impl RecordCommand {
    fn run(self, node_config: &NodeConfig) -> Result<()> {
        let path = node_config.storage.data_dir.join(ENR_FILE);

        match self {
            Self::Print => {
                ensure!(path.is_file(), "no record found at {}", path.display());

                println!("{}", fs_err::read_to_string(path)?.trim());
            }
            Self::Create => {
                if path.is_file() {
                    fs_err::remove_file(&path)?;
                }

                info!("a new identity record will be created on the next start");
            }
        }

        Ok(())
    }
}
