use core::time::Duration;
use std::sync::Arc;

use chain_dag::Storage;
use database::Database;
use events::{Event, EventChannels, Topic};
use execution_engine::NullExecutionEngine;
use futures::channel::mpsc::{self, UnboundedReceiver};
use futures::StreamExt as _;
use types::{
    beacon_state::BeaconState,
    combined::{BeaconBlock, SignedBeaconBlock},
    config::Config,
    containers::{BlobIdentifier, BlobSidecar},
    deneb,
    nonstandard::Phase,
    primitives::{KzgCommitment, PeerId, Slot, H256},
};

use crate::{
    Controller, P2pMessage, ProcessorHandle, TrivialStateTransition, VerifierError,
};

struct Harness {
    controller: Arc<Controller>,
    handle: ProcessorHandle,
    event_channels: Arc<EventChannels>,
    p2p_rx: UnboundedReceiver<P2pMessage>,
}

fn harness() -> Harness {
    let config = Arc::new(Config::all_forks_at_genesis());
    let anchor_block = Arc::new(SignedBeaconBlock::from_block(
        BeaconBlock::empty(Phase::Deneb, 0, 0, H256::zero()),
        Default::default(),
    ));
    let anchor_state = Arc::new(BeaconState {
        phase: Phase::Deneb,
        ..Default::default()
    });

    let event_channels = Arc::new(EventChannels::default());
    let (p2p_tx, p2p_rx) = mpsc::unbounded();

    let (controller, handle) = Controller::new(
        config.clone(),
        anchor_block,
        anchor_state,
        Arc::new(Storage::new(config, Database::in_memory())),
        TrivialStateTransition,
        NullExecutionEngine,
        event_channels.clone(),
        None,
        p2p_tx,
    )
    .expect("processor thread starts");

    Harness {
        controller,
        handle,
        event_channels,
        p2p_rx,
    }
}

fn deneb_block(slot: Slot, parent_root: H256, commitment_count: usize) -> Arc<SignedBeaconBlock> {
    let mut block = deneb::BeaconBlock {
        slot,
        parent_root,
        ..Default::default()
    };

    block.body.blob_kzg_commitments = vec![KzgCommitment::repeat_byte(7); commitment_count];

    Arc::new(SignedBeaconBlock::from_block(
        block.into(),
        Default::default(),
    ))
}

fn block_with_graffiti(
    slot: Slot,
    parent_root: H256,
    graffiti: u8,
) -> Arc<SignedBeaconBlock> {
    let BeaconBlock::Deneb(mut block) = BeaconBlock::empty(Phase::Deneb, slot, 0, parent_root)
    else {
        unreachable!();
    };

    block.body.graffiti = H256::repeat_byte(graffiti);

    Arc::new(SignedBeaconBlock::from_block(
        block.into(),
        Default::default(),
    ))
}

fn blob_for(block: &SignedBeaconBlock, index: u64) -> Arc<BlobSidecar> {
    Arc::new(BlobSidecar {
        index,
        blob: Arc::from(vec![0; 8].into_boxed_slice()),
        kzg_commitment: KzgCommitment::repeat_byte(7),
        kzg_proof: Default::default(),
        signed_block_header: block.signed_header(),
    })
}

async fn submit_and_await(
    controller: &Controller,
    block: Arc<SignedBeaconBlock>,
) -> Result<(), VerifierError> {
    controller
        .on_own_block_with_reply(block, None)
        .expect("queue has capacity")
        .await
        .expect("mutator replies")
}

#[tokio::test]
async fn deneb_block_waits_for_its_blobs_and_is_accepted_once_they_arrive() {
    let Harness {
        controller,
        handle,
        event_channels: _event_channels,
        mut p2p_rx,
    } = harness();

    let peer_id = PeerId(1);
    let block = deneb_block(5, controller.head().root, 3);
    let block_root = block.hash_tree_root();

    // Only blobs 1 and 2 are known when the block arrives.
    for index in [1, 2] {
        controller
            .on_blob_sidecar(blob_for(&block, index), Some(peer_id))
            .expect("queue has capacity");
    }

    let result = submit_and_await(&controller, block.clone()).await;

    assert_eq!(result, Err(VerifierError::MissingParent));
    assert_eq!(controller.head().slot, 0);

    // The processor asks the network for exactly the missing blob.
    let message = tokio::time::timeout(Duration::from_secs(5), p2p_rx.select_next_some())
        .await
        .expect("a blob request is issued");

    assert_eq!(
        message,
        P2pMessage::BlobsNeeded(
            vec![BlobIdentifier {
                block_root,
                index: 0,
            }],
            5,
            None,
        ),
    );

    // The missing blob arrives and the quarantined block is re-driven.
    controller
        .on_blob_sidecar(blob_for(&block, 0), Some(peer_id))
        .expect("queue has capacity");

    controller.update_head(5).await.expect("mutator is alive");

    assert_eq!(controller.head().root, block_root);
    assert_eq!(controller.head().slot, 5);

    controller.stop();
    handle.join().expect("processor thread exits cleanly");
}

#[tokio::test]
async fn heavier_late_block_at_the_same_slot_causes_a_reorg() {
    let Harness {
        controller,
        handle,
        event_channels,
        p2p_rx: _p2p_rx,
    } = harness();

    let mut heads = event_channels.subscribe(Topic::Head);
    let mut reorgs = event_channels.subscribe(Topic::ChainReorg);

    let parent = block_with_graffiti(99, controller.head().root, 0);
    let parent_root = parent.hash_tree_root();

    submit_and_await(&controller, parent).await.expect("parent is valid");

    let block_a = block_with_graffiti(100, parent_root, 0xaa);
    let block_b = block_with_graffiti(100, parent_root, 0xbb);
    let root_a = block_a.hash_tree_root();
    let root_b = block_b.hash_tree_root();

    submit_and_await(&controller, block_a).await.expect("block A is valid");

    assert_eq!(controller.head().root, root_a);

    // Attestations give block B more weight than block A.
    controller.on_attestation_vote(0, root_b, 3, 64_000_000_000);
    controller.on_attestation_vote(1, root_a, 3, 32_000_000_000);

    submit_and_await(&controller, block_b).await.expect("block B is valid");

    assert_eq!(controller.head().root, root_b);

    // A head change event is emitted, followed by a reorg event whose common
    // ancestor is the fork point at slot 99.
    let mut last_head = None;

    while let Ok(event) = heads.try_recv() {
        last_head = Some(event);
    }

    let Some(Event::Head(head_event)) = last_head else {
        panic!("expected a head event");
    };

    assert_eq!(head_event.block, root_b);
    assert_eq!(head_event.previous_head, root_a);

    let Ok(Event::ChainReorg(reorg_event)) = reorgs.try_recv() else {
        panic!("expected a reorg event");
    };

    assert_eq!(reorg_event.old_head_block, root_a);
    assert_eq!(reorg_event.new_head_block, root_b);
    assert_eq!(reorg_event.common_ancestor, parent_root);
    assert_eq!(reorg_event.depth, 1);
    assert_eq!(reorg_event.slot, 100);

    controller.stop();
    handle.join().expect("processor thread exits cleanly");
}

#[tokio::test]
async fn duplicate_and_orphan_submissions_are_classified() {
    let Harness {
        controller,
        handle,
        event_channels: _event_channels,
        mut p2p_rx,
    } = harness();

    let block = block_with_graffiti(1, controller.head().root, 1);

    submit_and_await(&controller, block.clone()).await.expect("block is valid");

    assert_eq!(
        submit_and_await(&controller, block).await,
        Err(VerifierError::Duplicate),
    );

    let orphan = block_with_graffiti(2, H256::repeat_byte(0xde), 2);

    assert_eq!(
        submit_and_await(&controller, orphan).await,
        Err(VerifierError::MissingParent),
    );

    // The processor asks for the missing parent.
    let message = tokio::time::timeout(Duration::from_secs(5), p2p_rx.select_next_some())
        .await
        .expect("a parent request is issued");

    assert_eq!(
        message,
        P2pMessage::BlockNeeded(H256::repeat_byte(0xde), None),
    );

    controller.stop();
    handle.join().expect("processor thread exits cleanly");
}

#[tokio::test]
async fn orphans_are_retried_once_their_parent_arrives() {
    let Harness {
        controller,
        handle,
        event_channels: _event_channels,
        p2p_rx: _p2p_rx,
    } = harness();

    let parent = block_with_graffiti(1, controller.head().root, 1);
    let child = block_with_graffiti(2, parent.hash_tree_root(), 2);
    let child_root = child.hash_tree_root();

    assert_eq!(
        submit_and_await(&controller, child).await,
        Err(VerifierError::MissingParent),
    );

    submit_and_await(&controller, parent).await.expect("parent is valid");

    controller.update_head(2).await.expect("mutator is alive");

    assert_eq!(controller.head().root, child_root);

    controller.stop();
    handle.join().expect("processor thread exits cleanly");
}
