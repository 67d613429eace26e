//! Prometheus metrics for the snapshot engine.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::types::state::NetworkState;

/// Prometheus metrics for the snapshot engine.
#[derive(Clone, Debug)]
pub struct PrometheusMetrics {
    registry: Registry,

    /// Execution layer block of the latest snapshot.
    pub snapshot_el_block: IntGauge,
    /// Beacon slot of the latest snapshot.
    pub snapshot_slot: IntGauge,
    /// Number of nodes in the latest snapshot.
    pub snapshot_node_count: IntGauge,
    /// Number of minipools in the latest snapshot.
    pub snapshot_minipool_count: IntGauge,

    /// Total number of batched call requests dispatched.
    pub fetch_batches: IntCounter,
}

impl PrometheusMetrics {
    /// Create a new metrics instance with all metrics registered.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let snapshot_el_block = gauge(
            &registry,
            "snapshot_el_block",
            "Execution layer block number of the latest network state snapshot",
        )?;
        let snapshot_slot = gauge(
            &registry,
            "snapshot_slot",
            "Beacon slot of the latest network state snapshot",
        )?;
        let snapshot_node_count = gauge(
            &registry,
            "snapshot_node_count",
            "Number of nodes in the latest network state snapshot",
        )?;
        let snapshot_minipool_count = gauge(
            &registry,
            "snapshot_minipool_count",
            "Number of minipools in the latest network state snapshot",
        )?;

        let fetch_batches = IntCounter::with_opts(Opts::new(
            "fetch_batches",
            "Number of batched contract call requests dispatched",
        ))?;
        registry.register(Box::new(fetch_batches.clone()))?;

        Ok(Self {
            registry,
            snapshot_el_block,
            snapshot_slot,
            snapshot_node_count,
            snapshot_minipool_count,
            fetch_batches,
        })
    }

    /// Update the snapshot gauges from a freshly assembled snapshot.
    pub fn record_snapshot(&self, state: &NetworkState) {
        self.snapshot_el_block
            .set(state.el_block_number.try_into().unwrap_or(i64::MAX));
        self.snapshot_slot
            .set(state.beacon_slot_number.try_into().unwrap_or(i64::MAX));
        self.snapshot_node_count
            .set(state.nodes.len().try_into().unwrap_or(i64::MAX));
        self.snapshot_minipool_count
            .set(state.minipools.len().try_into().unwrap_or(i64::MAX));
    }

    /// Render all metrics in the Prometheus text format.
    pub fn export(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| {
            prometheus::Error::Msg(format!("metrics output is not valid UTF-8: {err}"))
        })
    }
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{
        common::{Address, BeaconConfig, U256},
        node::NodeDetails,
    };

    #[test_log::test]
    fn test_record_snapshot() {
        let metrics = PrometheusMetrics::new().unwrap();
        let state = NetworkState {
            el_block_number: 1000,
            beacon_slot_number: 2000,
            beacon_config: BeaconConfig {
                genesis_time: 0,
                seconds_per_slot: 12,
                slots_per_epoch: 32,
            },
            total_effective_rpl_stake: U256::ZERO,
            nodes: vec![
                NodeDetails::new(Address::with_last_byte(1)),
                NodeDetails::new(Address::with_last_byte(2)),
            ],
            minipools: vec![],
        };
        metrics.record_snapshot(&state);
        metrics.fetch_batches.inc_by(3);

        let text = metrics.export().unwrap();
        assert!(text.contains("snapshot_el_block 1000"), "{text}");
        assert!(text.contains("snapshot_slot 2000"), "{text}");
        assert!(text.contains("snapshot_node_count 2"), "{text}");
        assert!(text.contains("snapshot_minipool_count 0"), "{text}");
        assert!(text.contains("fetch_batches 3"), "{text}");
    }
}
