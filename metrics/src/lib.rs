//! Prometheus gauges and counters shared across services.
//!
//! Present only when the node is started with `--metrics`. Components hold an
//! `Option<Arc<Metrics>>` and skip recording when it is `None`.

use anyhow::Result;
use prometheus::{
    histogram_opts, opts, Gauge, Histogram, IntCounter, IntGauge, IntGaugeVec, Registry,
};
use types::primitives::Slot;

pub struct Metrics {
    registry: Registry,

    pub head_slot: IntGauge,
    pub finalized_epoch: IntGauge,
    pub connected_peers: IntGauge,

    /// Ratio of the actual second-loop sleep to one second. Values well above
    /// 1 indicate event loop starvation.
    pub ticks_delay: Gauge,
    /// Seconds from the start of a slot until the first duty of that slot ran.
    pub next_action_wait: Gauge,

    pub dropped_events: IntCounter,
    pub block_processing_time: Histogram,
    collection_lengths: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let head_slot = IntGauge::with_opts(opts!("head_slot", "Slot of the fork choice head"))?;
        let finalized_epoch =
            IntGauge::with_opts(opts!("finalized_epoch", "Latest finalized epoch"))?;
        let connected_peers =
            IntGauge::with_opts(opts!("connected_peers", "Number of connected peers"))?;
        let ticks_delay = Gauge::with_opts(opts!(
            "ticks_delay",
            "Ratio of second loop sleep duration to one second",
        ))?;
        let next_action_wait = Gauge::with_opts(opts!(
            "next_action_wait",
            "Seconds until the next scheduled validator action",
        ))?;
        let dropped_events = IntCounter::with_opts(opts!(
            "event_bus_dropped_events",
            "Events dropped because a subscriber lagged",
        ))?;
        let block_processing_time = Histogram::with_opts(histogram_opts!(
            "block_processing_time_seconds",
            "Time spent in state transition and fork choice per block",
        ))?;
        let collection_lengths = IntGaugeVec::new(
            opts!("collection_lengths", "Lengths of in-memory collections"),
            &["module", "collection"],
        )?;

        registry.register(Box::new(head_slot.clone()))?;
        registry.register(Box::new(finalized_epoch.clone()))?;
        registry.register(Box::new(connected_peers.clone()))?;
        registry.register(Box::new(ticks_delay.clone()))?;
        registry.register(Box::new(next_action_wait.clone()))?;
        registry.register(Box::new(dropped_events.clone()))?;
        registry.register(Box::new(block_processing_time.clone()))?;
        registry.register(Box::new(collection_lengths.clone()))?;

        Ok(Self {
            registry,
            head_slot,
            finalized_epoch,
            connected_peers,
            ticks_delay,
            next_action_wait,
            dropped_events,
            block_processing_time,
            collection_lengths,
        })
    }

    pub fn set_head_slot(&self, slot: Slot) {
        self.head_slot.set(slot as i64);
    }

    pub fn set_collection_length(&self, module: &str, collection: &str, length: usize) {
        self.collection_lengths
            .with_label_values(&[module, collection])
            .set(length as i64);
    }

    #[must_use]
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_conflicts() -> Result<()> {
        let metrics = Metrics::new()?;

        metrics.set_head_slot(123);
        metrics.set_collection_length(module_path!(), "blob_quarantine", 7);

        assert!(!metrics.gather().is_empty());

        Ok(())
    }
}
