use std::process::exit;

use clap::{Parser, Subcommand};
use serde::Serialize;
use staking_state::{
    Error, Result,
    input::{
        beacon::{BeaconOptions, http::HttpBeaconClient},
        execution::rpc::{ExecutionOptions, RpcExecutionClient},
    },
    metrics::PrometheusMetrics,
    state::{NetworkStateManager, StateOptions},
    types::common::Address,
};
use tracing_subscriber::EnvFilter;

/// Take point-in-time snapshots of the staking protocol state.
#[derive(Debug, Parser)]
struct Options {
    /// Execution layer client options.
    #[clap(flatten)]
    execution: ExecutionOptions,

    /// Beacon node client options.
    #[clap(flatten)]
    beacon: BeaconOptions,

    /// Snapshot assembly options.
    #[clap(flatten)]
    state: StateOptions,

    /// Print Prometheus metrics to stderr after the command completes.
    #[clap(long, env = "STAKING_STATE_PRINT_METRICS")]
    print_metrics: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Snapshot every node and minipool at the head of the chain.
    Head,

    /// Snapshot a single node and its minipools at the head of the chain.
    Node { address: Address },

    /// Snapshot every node and minipool at the latest proposed block at or before a slot.
    Slot { slot: u64 },

    /// Show the latest proposed beacon block.
    LatestBlock,

    /// Show the latest proposed beacon block in the last finalized epoch.
    FinalizedBlock,

    /// Show the deposit queue position of a minipool (1-indexed, 0 if not queued).
    QueuePosition { minipool: Address },

    /// Show the length of each deposit queue partition and the queue's capacity.
    QueueStatus,

    /// Show the minipool at a 0-indexed deposit queue position.
    QueueMinipool { position: u64 },
}

impl Options {
    async fn run(self) -> Result<()> {
        let execution = RpcExecutionClient::new(&self.execution);
        let beacon = HttpBeaconClient::new(&self.beacon)?;
        let permits = self.state.permits();
        let mut manager = NetworkStateManager::new(
            execution,
            beacon,
            self.execution.storage_address,
            self.state,
            permits,
        );
        let metrics = optional_metrics(PrometheusMetrics::new());
        if let Some(metrics) = &metrics {
            manager = manager.with_metrics(metrics.clone());
        }

        match self.command {
            Command::Head => print(&manager.head_state().await?)?,
            Command::Node { address } => print(&manager.head_state_for_node(address).await?)?,
            Command::Slot { slot } => print(&manager.state_for_slot(slot).await?)?,
            Command::LatestBlock => print(&manager.latest_beacon_block().await?)?,
            Command::FinalizedBlock => print(&manager.latest_finalized_beacon_block().await?)?,
            Command::QueuePosition { minipool } => {
                print(&manager.queue_position(minipool).await?)?
            }
            Command::QueueStatus => print(&manager.queue_status().await?)?,
            Command::QueueMinipool { position } => {
                print(&manager.minipool_at_queue_position(position).await?)?
            }
        }

        if let Some(metrics) = metrics.filter(|_| self.print_metrics) {
            match metrics.export() {
                Ok(text) => eprintln!("{text}"),
                Err(err) => tracing::warn!("failed to export metrics: {err:#}"),
            }
        }
        Ok(())
    }
}

/// The metrics to record into, or none if the registry could not be set up.
fn optional_metrics(metrics: prometheus::Result<PrometheusMetrics>) -> Option<PrometheusMetrics> {
    metrics
        .inspect_err(|err| tracing::warn!("metrics disabled: {err:#}"))
        .ok()
}

fn print(value: &impl Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|err| Error::decode_mismatch().context(format!("serializing output: {err}")))?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Options::parse();
    if let Err(err) = opt.run().await {
        eprintln!("snapshot failed: {err:#}");
        exit(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test_log::test]
    fn test_metrics_failure_disables_metrics() {
        let err = prometheus::Error::Msg("duplicate metric".into());
        assert!(optional_metrics(Err(err)).is_none());
        assert!(optional_metrics(PrometheusMetrics::new()).is_some());
    }

    #[test_log::test]
    fn test_parse_queue_status() {
        let opt = Options::try_parse_from([
            "staking-state",
            "--el-url",
            "http://localhost:8545",
            "--storage-address",
            "0x1d8f8f00cfa6758d7be78336684788fb0ee0fa46",
            "--balance-batcher-address",
            "0xb1f8e55c7f64d203c1400b9d8555d050f94adf39",
            "--beacon-url",
            "http://localhost:5052",
            "queue-status",
        ])
        .unwrap();
        assert!(matches!(opt.command, Command::QueueStatus));
        assert!(!opt.print_metrics);
    }
}
