use core::future::Future;
use std::{collections::BTreeMap, sync::Arc};

use anyhow::{ensure, Context as _, Result};
use block_processor::{Controller, P2pMessage, TrivialStateTransition};
use chain_dag::Storage;
use consensus::{ActionTracker, ConsensusManager};
use database::Database;
use events::EventChannels;
use execution_engine::NullExecutionEngine;
use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    stream::StreamExt as _,
};
use log::{debug, info, warn};
use metrics::Metrics;
use p2p::{
    BlockSyncService, BlockSyncServiceChannels, GossipAction, GossipController, P2pToSync,
    SyncToApi, SyncToP2p,
};
use slashing_protection::SlashingProtector;
use std_ext::ArcExt as _;
use tokio::select;
use types::{
    beacon_state::BeaconState,
    combined::{BeaconBlock, SignedBeaconBlock},
    config::Config as ChainConfig,
    consts::MIN_EPOCHS_FOR_BLOCK_REQUESTS,
    primitives::NodeId,
};
use validator::{DoppelgangerProtection, DutyDispatcher, NullSigner, ValidatorToP2p};

use crate::{
    node_config::NodeConfig,
    scheduler::SlotScheduler,
    status::{NodeStatus, StatusCell},
};

#[cfg(unix)]
use tokio::signal::unix::SignalKind;

const ENR_FILE: &str = "beacon_node.enr";
const PID_FILE: &str = "beacon_node.pid";

/// Channel ends handed to the networking substrate. The libp2p/discv5 stack
/// lives in an external crate and drives these; [`run_null_network`] stands in
/// when the node runs without networking (interop and tests).
pub struct NetworkChannels {
    pub sync_to_p2p_rx: UnboundedReceiver<SyncToP2p>,
    pub gossip_actions_rx: UnboundedReceiver<GossipAction>,
    pub validator_to_p2p_rx: UnboundedReceiver<ValidatorToP2p>,
    pub sync_to_api_rx: UnboundedReceiver<SyncToApi>,
}

/// Runs the beacon node until a signal or a stop condition ends it.
pub async fn run_node(chain_config: Arc<ChainConfig>, node_config: NodeConfig) -> Result<()> {
    let status = Arc::new(StatusCell::default());

    let metrics = node_config
        .metrics_enabled
        .then(Metrics::new)
        .transpose()?
        .map(Arc::new);

    let anchor_state = Arc::new(load_anchor_state(&chain_config, &node_config)?);
    let anchor_block = Arc::new(genesis_block(&chain_config));
    let genesis_time = anchor_state.genesis_time;
    let genesis_validators_root = anchor_state.genesis_validators_root;

    validate_weak_subjectivity_checkpoint(&chain_config, &node_config, genesis_time)?;

    let node_id = load_or_create_node_id(&node_config)?;
    write_pid_file(&node_config)?;

    // Channels first, then the components over them. Every component gets the
    // ends it needs at construction; nothing is patched in afterwards.
    let (processor_p2p_tx, processor_p2p_rx) = mpsc::unbounded();
    let (p2p_to_sync_tx, p2p_to_sync_rx) = mpsc::unbounded();
    let (sync_to_p2p_tx, sync_to_p2p_rx) = mpsc::unbounded();
    let (sync_to_api_tx, sync_to_api_rx) = mpsc::unbounded();
    let (gossip_actions_tx, gossip_actions_rx) = mpsc::unbounded();
    let (validator_to_p2p_tx, validator_to_p2p_rx) = mpsc::unbounded();

    let event_channels = Arc::new(EventChannels::new(node_config.max_events));

    let sync_database = Arc::new(Database::in_memory());
    let storage = Arc::new(Storage::new(chain_config.clone_arc(), Database::in_memory()));

    let (controller, processor_handle) = Controller::new(
        chain_config.clone_arc(),
        anchor_block,
        anchor_state,
        storage.clone_arc(),
        TrivialStateTransition,
        NullExecutionEngine,
        event_channels.clone_arc(),
        metrics.clone(),
        processor_p2p_tx,
    )?;

    let mut action_tracker = ActionTracker::new(node_id, node_config.subscribe_all_subnets);

    // Attached validators come from the external keystore layer; a plain
    // beacon node process runs without any.
    let validators: BTreeMap<_, _> = BTreeMap::new();
    action_tracker.register_validators(validators.keys().copied());

    let consensus_manager = ConsensusManager::new(controller.clone_arc(), action_tracker);

    let gossip_controller = GossipController::new(
        chain_config.clone_arc(),
        genesis_validators_root,
        node_id,
        node_config.subscribe_all_subnets,
    );

    let slashing_protector = SlashingProtector::in_memory(
        genesis_validators_root,
        node_config.slashing_protection_history_limit,
    );

    let doppelganger = node_config
        .detect_doppelgangers
        .then(DoppelgangerProtection::default);

    let duty_dispatcher = DutyDispatcher::new(
        controller.clone_arc(),
        Arc::new(NullSigner),
        slashing_protector,
        doppelganger,
        validators,
        metrics.clone(),
        validator_to_p2p_tx,
    );

    let block_sync_service = BlockSyncService::new(
        controller.clone_arc(),
        sync_database,
        metrics.clone(),
        BlockSyncServiceChannels {
            p2p_to_sync_rx,
            sync_to_p2p_tx,
            sync_to_api_tx,
        },
        node_config.back_sync_enabled,
    )?;

    let scheduler = SlotScheduler::new(
        chain_config,
        genesis_time,
        controller.clone_arc(),
        consensus_manager,
        gossip_controller,
        duty_dispatcher,
        storage,
        status.clone_arc(),
        node_config.storage.history_mode,
        node_config.stop_at_epoch,
        metrics.clone(),
        p2p_to_sync_tx.clone(),
        gossip_actions_tx,
    );

    let network_channels = NetworkChannels {
        sync_to_p2p_rx,
        gossip_actions_rx,
        validator_to_p2p_rx,
        sync_to_api_rx,
    };

    status.set(NodeStatus::Running);
    info!("beacon node is running");

    let run_second_loop = SlotScheduler::run_second_loop(
        controller.clone_arc(),
        status.clone_arc(),
        node_config.stop_at_synced_epoch,
        metrics,
    );

    select! {
        result = spawn_fallible(scheduler.run_slot_loop()) => result,
        result = spawn_fallible(run_second_loop) => result,
        result = spawn_fallible(block_sync_service.run()) => result,
        result = spawn_fallible(forward_processor_messages(
            processor_p2p_rx,
            p2p_to_sync_tx,
        )) => result,
        result = spawn_fallible(run_null_network(network_channels)) => result,
        result = wait_for_signal(status.clone_arc()) => result,
    }?;

    status.set(NodeStatus::Stopping);
    info!("shutting down…");

    controller.stop();
    processor_handle.join()?;

    remove_pid_file(&node_config);
    status.set(NodeStatus::Stopped);

    Ok(())
}

/// Forwards mutator output to the sync service. This replaces callback
/// re-entry with a channel hop: the processor never calls into sync code.
async fn forward_processor_messages(
    mut processor_p2p_rx: UnboundedReceiver<P2pMessage>,
    p2p_to_sync_tx: UnboundedSender<P2pToSync>,
) -> Result<()> {
    while let Some(message) = processor_p2p_rx.next().await {
        let forwarded = match message {
            P2pMessage::BlockNeeded(block_root, peer_id) => {
                P2pToSync::BlockNeeded(block_root, peer_id)
            }
            P2pMessage::BlobsNeeded(identifiers, slot, peer_id) => {
                P2pToSync::BlobsNeeded(identifiers, slot, peer_id)
            }
            P2pMessage::FinalizedCheckpoint(checkpoint) => {
                P2pToSync::FinalizedCheckpoint(checkpoint)
            }
            P2pMessage::PenalizePeer(peer_id, error) => {
                debug!("peer {peer_id} sent an invalid object: {error}");
                continue;
            }
            P2pMessage::Stop => break,
        };

        forwarded.send(&p2p_to_sync_tx);
    }

    Ok(())
}

/// Drains the network-facing channels when no networking substrate is
/// attached. Requests simply go unanswered, as they would with zero peers.
pub async fn run_null_network(channels: NetworkChannels) -> Result<()> {
    let NetworkChannels {
        mut sync_to_p2p_rx,
        mut gossip_actions_rx,
        mut validator_to_p2p_rx,
        mut sync_to_api_rx,
    } = channels;

    loop {
        select! {
            message = sync_to_p2p_rx.next() => match message {
                Some(SyncToP2p::Stop) | None => break,
                Some(request) => debug!("dropping network request: {request:?}"),
            },
            action = gossip_actions_rx.next() => {
                if action.is_none() {
                    break;
                }
            }
            message = validator_to_p2p_rx.next() => {
                if matches!(message, Some(ValidatorToP2p::Stop) | None) {
                    break;
                }
            }
            message = sync_to_api_rx.next() => {
                if matches!(message, Some(SyncToApi::Stop) | None) {
                    break;
                }
            }
        }
    }

    Ok(())
}

fn load_anchor_state(chain_config: &ChainConfig, node_config: &NodeConfig) -> Result<BeaconState> {
    if let Some(file) = node_config.genesis_state_file.as_ref() {
        let bytes = fs_err::read(file)?;

        return serde_json::from_slice(&bytes).context("failed to parse genesis state");
    }

    Ok(BeaconState {
        phase: chain_config.phase_at_epoch(0),
        genesis_time: chain_config.min_genesis_time,
        ..Default::default()
    })
}

/// A checkpoint outside the block retention window cannot be validated
/// against any peer and joining from it would be unsafe.
fn validate_weak_subjectivity_checkpoint(
    chain_config: &ChainConfig,
    node_config: &NodeConfig,
    genesis_time: types::primitives::UnixSeconds,
) -> Result<()> {
    let Some((epoch, block_root)) = node_config.weak_subjectivity_checkpoint else {
        return Ok(());
    };

    let wall_epoch = clock::Tick::current(chain_config, genesis_time)?.epoch();

    ensure!(
        epoch + MIN_EPOCHS_FOR_BLOCK_REQUESTS >= wall_epoch,
        "weak subjectivity checkpoint ({epoch}, {block_root:?}) is stale \
         (wall epoch: {wall_epoch})",
    );

    Ok(())
}

fn genesis_block(chain_config: &ChainConfig) -> SignedBeaconBlock {
    SignedBeaconBlock::from_block(
        BeaconBlock::empty(chain_config.phase_at_epoch(0), 0, 0, Default::default()),
        Default::default(),
    )
}

/// The node identity record, rewritten on startup. The full signed ENR with
/// `attnets`/`syncnets` bitfields is maintained by the networking substrate;
/// this file only pins the node ID across restarts.
fn load_or_create_node_id(node_config: &NodeConfig) -> Result<NodeId> {
    let path = node_config.storage.data_dir.join(ENR_FILE);

    if let Ok(contents) = fs_err::read_to_string(&path) {
        if let Some(hex) = contents.trim().strip_prefix("enr:") {
            if let Ok(node_id) = NodeId::from_str_radix(hex, 16) {
                return Ok(node_id);
            }
        }

        warn!("ignoring malformed {ENR_FILE}");
    }

    // Cryptographic identity keys belong to the networking substrate; the ID
    // only has to be stable and unique per data directory.
    let process_entropy = std::process::id().to_le_bytes();
    let node_id = NodeId::from_big_endian(hashing::hash_bytes(&process_entropy).as_bytes());

    if node_config.storage.data_dir.is_dir() {
        fs_err::write(&path, format!("enr:{node_id:x}"))?;
    }

    Ok(node_id)
}

fn write_pid_file(node_config: &NodeConfig) -> Result<()> {
    if node_config.storage.data_dir.is_dir() {
        let path = node_config.storage.data_dir.join(PID_FILE);
        fs_err::write(path, std::process::id().to_string())?;
    }

    Ok(())
}

fn remove_pid_file(node_config: &NodeConfig) {
    let path = node_config.storage.data_dir.join(PID_FILE);

    if path.is_file() {
        fs_err::remove_file(&path).unwrap_or_else(|error| {
            warn!("failed to remove {}: {error}", path.display());
        });
    }
}

async fn wait_for_signal(status: Arc<StatusCell>) -> Result<()> {
    #[cfg(unix)]
    {
        let mut interrupt = tokio::signal::unix::signal(SignalKind::interrupt())?;
        let mut terminate = tokio::signal::unix::signal(SignalKind::terminate())?;

        select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    status.transition(NodeStatus::Running, NodeStatus::Stopping);

    Ok(())
}

// This exists mainly to flatten the nested `Result` returned by
// `tokio::spawn`.
async fn spawn_fallible<T: Send + 'static>(
    task: impl Future<Output = Result<T>> + Send + 'static,
) -> Result<T> {
    tokio::spawn(task).await?
}
