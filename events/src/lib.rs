//! Fan-out channels feeding REST event stream subscribers.
//!
//! Every topic is a bounded [`tokio::sync::broadcast`] channel. Slow
//! subscribers never block producers: when a subscriber falls more than the
//! channel capacity behind, the oldest events are dropped for that subscriber
//! and it observes [`RecvError::Lagged`] on its next receive. Dropped events
//! are counted in the `event_bus_dropped_events` metric.
//!
//! [`RecvError::Lagged`]: tokio::sync::broadcast::error::RecvError::Lagged

use std::sync::Arc;

use log::debug;
use metrics::Metrics;
use serde::Serialize;
use strum::AsRefStr;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
    Receiver, Sender,
};
use types::{
    combined::BeaconBlockSummary,
    containers::{
        Attestation, Checkpoint, SignedBlsToExecutionChange, SignedContributionAndProof,
        SignedVoluntaryExit,
    },
    primitives::{Epoch, Slot, H256},
};

pub const DEFAULT_MAX_EVENTS: usize = 100;

#[derive(Clone, Copy, PartialEq, Eq, Debug, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Topic {
    Attestation,
    Block,
    BlsToExecutionChange,
    ChainReorg,
    ContributionAndProof,
    FinalizedCheckpoint,
    FinalityUpdate,
    Head,
    OptimisticUpdate,
    VoluntaryExit,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct BlockEvent {
    pub slot: Slot,
    pub block: H256,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct HeadEvent {
    pub slot: Slot,
    pub block: H256,
    pub previous_head: H256,
    pub epoch_transition: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ChainReorgEvent {
    pub slot: Slot,
    pub depth: u64,
    pub old_head_block: H256,
    pub new_head_block: H256,
    pub common_ancestor: H256,
    pub epoch: Epoch,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FinalizedCheckpointEvent {
    pub block: H256,
    pub epoch: Epoch,
}

#[derive(Clone, Debug)]
pub enum Event {
    Attestation(Arc<Attestation>),
    Block(BlockEvent),
    BlsToExecutionChange(Box<SignedBlsToExecutionChange>),
    ChainReorg(ChainReorgEvent),
    ContributionAndProof(Box<SignedContributionAndProof>),
    FinalizedCheckpoint(FinalizedCheckpointEvent),
    FinalityUpdate(Checkpoint),
    Head(HeadEvent),
    OptimisticUpdate(BeaconBlockSummary),
    VoluntaryExit(Box<SignedVoluntaryExit>),
}

impl Event {
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::Attestation(_) => Topic::Attestation,
            Self::Block(_) => Topic::Block,
            Self::BlsToExecutionChange(_) => Topic::BlsToExecutionChange,
            Self::ChainReorg(_) => Topic::ChainReorg,
            Self::ContributionAndProof(_) => Topic::ContributionAndProof,
            Self::FinalizedCheckpoint(_) => Topic::FinalizedCheckpoint,
            Self::FinalityUpdate(_) => Topic::FinalityUpdate,
            Self::Head(_) => Topic::Head,
            Self::OptimisticUpdate(_) => Topic::OptimisticUpdate,
            Self::VoluntaryExit(_) => Topic::VoluntaryExit,
        }
    }
}

pub struct EventChannels {
    attestations: Sender<Event>,
    blocks: Sender<Event>,
    bls_to_execution_changes: Sender<Event>,
    chain_reorgs: Sender<Event>,
    contribution_and_proofs: Sender<Event>,
    finalized_checkpoints: Sender<Event>,
    finality_updates: Sender<Event>,
    heads: Sender<Event>,
    optimistic_updates: Sender<Event>,
    voluntary_exits: Sender<Event>,
}

impl Default for EventChannels {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

impl EventChannels {
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            attestations: broadcast::channel(max_events).0,
            blocks: broadcast::channel(max_events).0,
            bls_to_execution_changes: broadcast::channel(max_events).0,
            chain_reorgs: broadcast::channel(max_events).0,
            contribution_and_proofs: broadcast::channel(max_events).0,
            finalized_checkpoints: broadcast::channel(max_events).0,
            finality_updates: broadcast::channel(max_events).0,
            heads: broadcast::channel(max_events).0,
            optimistic_updates: broadcast::channel(max_events).0,
            voluntary_exits: broadcast::channel(max_events).0,
        }
    }

    #[must_use]
    pub fn subscribe(&self, topic: Topic) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender(topic).subscribe(),
        }
    }

    pub fn publish(&self, event: Event) {
        let sender = self.sender(event.topic());

        // `send` only fails when there are no subscribers, which is not an
        // error for an event stream.
        if sender.receiver_count() > 0 {
            if let Err(error) = sender.send(event) {
                debug!("failed to publish event: {error}");
            }
        }
    }

    fn sender(&self, topic: Topic) -> &Sender<Event> {
        match topic {
            Topic::Attestation => &self.attestations,
            Topic::Block => &self.blocks,
            Topic::BlsToExecutionChange => &self.bls_to_execution_changes,
            Topic::ChainReorg => &self.chain_reorgs,
            Topic::ContributionAndProof => &self.contribution_and_proofs,
            Topic::FinalizedCheckpoint => &self.finalized_checkpoints,
            Topic::FinalityUpdate => &self.finality_updates,
            Topic::Head => &self.heads,
            Topic::OptimisticUpdate => &self.optimistic_updates,
            Topic::VoluntaryExit => &self.voluntary_exits,
        }
    }
}

pub struct EventSubscriber {
    receiver: Receiver<Event>,
}

impl EventSubscriber {
    /// Receives the next event, skipping over any gap left by lagging.
    /// The number of events lost to the gap is recorded in `metrics`.
    pub async fn recv(&mut self, metrics: Option<&Arc<Metrics>>) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => break Some(event),
                Err(RecvError::Lagged(dropped)) => {
                    debug!("event subscriber lagged; {dropped} event(s) dropped");

                    if let Some(metrics) = metrics {
                        metrics.dropped_events.inc_by(dropped);
                    }
                }
                Err(RecvError::Closed) => break None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        self.receiver.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_subscribers_lose_oldest_events_without_blocking_producers() {
        let channels = EventChannels::new(2);
        let mut subscriber = channels.subscribe(Topic::Block);

        for slot in 0..5 {
            channels.publish(Event::Block(BlockEvent {
                slot,
                block: H256::repeat_byte(slot as u8),
            }));
        }

        // The two newest events survive; the first receive reports the gap.
        assert!(matches!(
            subscriber.try_recv(),
            Err(TryRecvError::Lagged(3)),
        ));

        let Some(Event::Block(event)) = subscriber.recv(None).await else {
            panic!("expected a block event");
        };

        assert_eq!(event.slot, 3);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_no_op() {
        let channels = EventChannels::new(2);

        channels.publish(Event::FinalizedCheckpoint(FinalizedCheckpointEvent {
            block: H256::zero(),
            epoch: 1,
        }));
    }
}
