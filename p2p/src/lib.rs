pub use crate::{
    back_sync::BackSync,
    block_sync_service::{BlockSyncService, Channels as BlockSyncServiceChannels},
    gossip_controller::{target_gossip_state, GossipAction, GossipController, GossipState},
    gossip_topics::{GossipTopic, GossipTopicKind},
    messages::{P2pToSync, SyncToApi, SyncToP2p},
    misc::{AttestationSubnetActions, PeerStatus, RequestId},
    request_manager::RequestManager,
    sync_manager::{SyncBatch, SyncDirection, SyncManager, SyncTarget},
};

mod attestation_subnets;
mod back_sync;
mod block_sync_service;
mod gossip_controller;
mod gossip_topics;
mod messages;
mod misc;
mod request_manager;
mod sync_committee_subnets;
mod sync_manager;
