//! Beacon client backed by the standard beacon node REST API.

use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use tracing::instrument;

use super::{BeaconClient, BeaconOptions};
use crate::{
    Error, Result,
    error::{ResultExt, ensure},
    types::common::{BeaconBlock, BeaconConfig, BeaconHead},
};

/// A [`BeaconClient`] which talks to a beacon node over HTTP.
#[derive(Clone, Debug)]
pub struct HttpBeaconClient {
    client: reqwest::Client,
    url: Url,
}

impl HttpBeaconClient {
    pub fn new(opt: &BeaconOptions) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(opt.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: opt.url.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.url.join(path).context(|| {
            Error::upstream_unavailable().context(format!("invalid beacon endpoint {path}"))
        })
    }

    /// Fetch the `data` field of a beacon API response.
    ///
    /// Returns [`None`] if the beacon node responds with 404.
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = self.endpoint(path)?;
        let res = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| Error::from(err).context(format!("requesting {url}")))?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let res = res
            .error_for_status()
            .map_err(|err| Error::from(err).context(format!("requesting {url}")))?;
        let body: Envelope<T> = res
            .json()
            .await
            .map_err(|err| Error::from(err).context(format!("parsing response from {url}")))?;
        Ok(Some(body.data))
    }

    async fn get_required<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get(path).await?.ok_or_else(|| {
            Error::upstream_unavailable().context(format!("beacon endpoint {path} not found"))
        })
    }
}

impl BeaconClient for HttpBeaconClient {
    #[instrument(skip(self))]
    async fn eth2_config(&self) -> Result<BeaconConfig> {
        let (spec, genesis) = futures::try_join!(
            self.get_required::<SpecResponse>("eth/v1/config/spec"),
            self.get_required::<GenesisResponse>("eth/v1/beacon/genesis"),
        )?;
        let config = BeaconConfig {
            genesis_time: genesis.genesis_time,
            seconds_per_slot: spec.seconds_per_slot,
            slots_per_epoch: spec.slots_per_epoch,
        };
        ensure!(
            config.seconds_per_slot > 0 && config.slots_per_epoch > 0,
            Error::decode_mismatch().context(format!("degenerate beacon config {config:?}"))
        );
        Ok(config)
    }

    async fn beacon_head(&self) -> Result<BeaconHead> {
        let checkpoints: FinalityCheckpoints = self
            .get_required("eth/v1/beacon/states/head/finality_checkpoints")
            .await?;
        Ok(BeaconHead {
            finalized_epoch: checkpoints.finalized.epoch,
        })
    }

    async fn beacon_block(&self, slot: u64) -> Result<Option<BeaconBlock>> {
        let Some(block) = self
            .get::<SignedBlock>(&format!("eth/v2/beacon/blocks/{slot}"))
            .await?
        else {
            return Ok(None);
        };
        let message = block.message;
        Ok(Some(BeaconBlock {
            slot: message.slot,
            proposer_index: message.proposer_index,
            execution_block_number: message
                .body
                .execution_payload
                .map(|payload| payload.block_number),
        }))
    }
}

/// Beacon API responses wrap their payload in a `data` object.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct SpecResponse {
    #[serde(rename = "SECONDS_PER_SLOT", deserialize_with = "quoted")]
    seconds_per_slot: u64,
    #[serde(rename = "SLOTS_PER_EPOCH", deserialize_with = "quoted")]
    slots_per_epoch: u64,
}

#[derive(Debug, Deserialize)]
struct GenesisResponse {
    #[serde(deserialize_with = "quoted")]
    genesis_time: u64,
}

#[derive(Debug, Deserialize)]
struct FinalityCheckpoints {
    finalized: Checkpoint,
}

#[derive(Debug, Deserialize)]
struct Checkpoint {
    #[serde(deserialize_with = "quoted")]
    epoch: u64,
}

#[derive(Debug, Deserialize)]
struct SignedBlock {
    message: BlockMessage,
}

#[derive(Debug, Deserialize)]
struct BlockMessage {
    #[serde(deserialize_with = "quoted")]
    slot: u64,
    #[serde(deserialize_with = "quoted")]
    proposer_index: u64,
    body: BlockBody,
}

#[derive(Debug, Deserialize)]
struct BlockBody {
    #[serde(default)]
    execution_payload: Option<ExecutionPayload>,
}

#[derive(Debug, Deserialize)]
struct ExecutionPayload {
    #[serde(deserialize_with = "quoted")]
    block_number: u64,
}

/// The beacon API encodes integers as decimal strings.
fn quoted<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::task::spawn;
    use warp::{Filter, http::StatusCode as WarpStatus};

    use super::*;
    use crate::error::ErrorKind;

    fn routes() -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let spec = warp::path!("eth" / "v1" / "config" / "spec").map(|| {
            warp::reply::json(&json!({
                "data": {
                    "CONFIG_NAME": "mainnet",
                    "SECONDS_PER_SLOT": "12",
                    "SLOTS_PER_EPOCH": "32",
                }
            }))
        });
        let genesis = warp::path!("eth" / "v1" / "beacon" / "genesis").map(|| {
            warp::reply::json(&json!({
                "data": {
                    "genesis_time": "1606824023",
                    "genesis_fork_version": "0x00000000",
                }
            }))
        });
        let head = warp::path!("eth" / "v1" / "beacon" / "states" / "head" / "finality_checkpoints")
            .map(|| {
                warp::reply::json(&json!({
                    "data": {
                        "previous_justified": { "epoch": "101", "root": "0x00" },
                        "current_justified": { "epoch": "102", "root": "0x00" },
                        "finalized": { "epoch": "100", "root": "0x00" },
                    }
                }))
            });
        let blocks = warp::path!("eth" / "v2" / "beacon" / "blocks" / u64).map(|slot: u64| {
            let (body, status) = match slot {
                // A post-merge block.
                99 => (
                    json!({
                        "version": "deneb",
                        "data": { "message": {
                            "slot": "99",
                            "proposer_index": "7",
                            "body": { "execution_payload": { "block_number": "1234" } },
                        }},
                    }),
                    WarpStatus::OK,
                ),
                // A pre-merge block.
                3 => (
                    json!({
                        "version": "phase0",
                        "data": { "message": {
                            "slot": "3",
                            "proposer_index": "1",
                            "body": {},
                        }},
                    }),
                    WarpStatus::OK,
                ),
                13 => (json!({ "message": "boom" }), WarpStatus::INTERNAL_SERVER_ERROR),
                _ => (
                    json!({ "code": 404, "message": "NOT_FOUND: beacon block" }),
                    WarpStatus::NOT_FOUND,
                ),
            };
            warp::reply::with_status(warp::reply::json(&body), status)
        });
        spec.or(genesis).unify().or(head).unify().or(blocks)
    }

    async fn client() -> (HttpBeaconClient, tokio::task::JoinHandle<()>) {
        let (addr, server) = warp::serve(routes()).bind_ephemeral(([127, 0, 0, 1], 0));
        let handle = spawn(server);
        let url: Url = format!("http://{addr}/").parse().unwrap();
        let client = HttpBeaconClient::new(&BeaconOptions::new(url)).unwrap();
        (client, handle)
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_eth2_config() {
        let (client, server) = client().await;
        let config = client.eth2_config().await.unwrap();
        assert_eq!(
            config,
            BeaconConfig {
                genesis_time: 1606824023,
                seconds_per_slot: 12,
                slots_per_epoch: 32,
            }
        );
        server.abort();
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_beacon_head() {
        let (client, server) = client().await;
        assert_eq!(
            client.beacon_head().await.unwrap(),
            BeaconHead {
                finalized_epoch: 100
            }
        );
        server.abort();
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_beacon_block() {
        let (client, server) = client().await;

        assert_eq!(
            client.beacon_block(99).await.unwrap(),
            Some(BeaconBlock {
                slot: 99,
                proposer_index: 7,
                execution_block_number: Some(1234),
            })
        );
        assert_eq!(
            client.beacon_block(3).await.unwrap(),
            Some(BeaconBlock {
                slot: 3,
                proposer_index: 1,
                execution_block_number: None,
            })
        );

        // Missed slots are not an error.
        assert_eq!(client.beacon_block(100).await.unwrap(), None);

        // Other failures are.
        let err = client.beacon_block(13).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);

        server.abort();
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_unreachable() {
        // Bind a server to get a free port, then shut it down.
        let (client, server) = client().await;
        server.abort();
        server.await.ok();

        let err = client.beacon_head().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    }
}
