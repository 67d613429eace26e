//! Reading the beacon chain.

use clap::Parser;
use reqwest::Url;

use crate::{
    Result,
    types::common::{BeaconBlock, BeaconConfig, BeaconHead},
};

pub mod http;
pub mod testing;

/// Configuration for a beacon node client.
#[derive(Clone, Debug, Parser)]
pub struct BeaconOptions {
    /// Base URL of a beacon node's REST API.
    #[clap(long = "beacon-url", env = "STAKING_STATE_BEACON_URL")]
    pub url: Url,

    /// Timeout for a single request to the beacon node, in seconds.
    #[clap(
        long = "beacon-timeout-secs",
        env = "STAKING_STATE_BEACON_TIMEOUT_SECS",
        default_value = "10"
    )]
    pub timeout_secs: u64,
}

impl BeaconOptions {
    /// Options to connect to the given URL, with default values for optional parameters.
    pub fn new(url: Url) -> Self {
        BeaconOptions::parse_from(["--", "--beacon-url", url.as_str()])
    }
}

/// Queries against the consensus layer.
pub trait BeaconClient: Clone + Sync {
    /// Genesis time and slot timing of the beacon chain.
    fn eth2_config(&self) -> impl Send + Future<Output = Result<BeaconConfig>>;

    /// The current head of the beacon chain.
    fn beacon_head(&self) -> impl Send + Future<Output = Result<BeaconHead>>;

    /// The block proposed at `slot`, or [`None`] if the slot was missed.
    fn beacon_block(&self, slot: u64) -> impl Send + Future<Output = Result<Option<BeaconBlock>>>;
}
