#![cfg(any(test, feature = "testing"))]

use std::{collections::HashMap, sync::Arc};

use async_lock::RwLock;

use super::BeaconClient;
use crate::{
    Error, Result,
    types::common::{BeaconBlock, BeaconConfig, BeaconHead},
};

/// An in-memory beacon chain.
///
/// Every slot without an explicitly added block is treated as missed. All state is shared between
/// clones.
#[derive(Clone, Debug)]
pub struct MockBeaconClient {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug)]
struct Inner {
    config: BeaconConfig,
    head: BeaconHead,
    blocks: HashMap<u64, BeaconBlock>,
    queried: Vec<u64>,
    config_requests: usize,
    offline: bool,
}

impl MockBeaconClient {
    pub fn new(config: BeaconConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                config,
                head: BeaconHead { finalized_epoch: 0 },
                blocks: HashMap::new(),
                queried: vec![],
                config_requests: 0,
                offline: false,
            })),
        }
    }

    /// Propose a block at `slot` carrying the given execution layer block.
    pub async fn add_block(&self, slot: u64, execution_block_number: u64) {
        self.inner.write().await.blocks.insert(
            slot,
            BeaconBlock {
                slot,
                proposer_index: slot % 1000,
                execution_block_number: Some(execution_block_number),
            },
        );
    }

    /// Propose a block at `slot` with no execution payload.
    pub async fn add_pre_merge_block(&self, slot: u64) {
        self.inner.write().await.blocks.insert(
            slot,
            BeaconBlock {
                slot,
                proposer_index: slot % 1000,
                execution_block_number: None,
            },
        );
    }

    pub async fn set_finalized_epoch(&self, finalized_epoch: u64) {
        self.inner.write().await.head = BeaconHead { finalized_epoch };
    }

    /// Make every subsequent request fail.
    pub async fn set_offline(&self, offline: bool) {
        self.inner.write().await.offline = offline;
    }

    /// The slots requested so far, in order.
    pub async fn queried_slots(&self) -> Vec<u64> {
        self.inner.read().await.queried.clone()
    }

    /// How many times the chain config has been requested.
    pub async fn config_requests(&self) -> usize {
        self.inner.read().await.config_requests
    }
}

impl BeaconClient for MockBeaconClient {
    async fn eth2_config(&self) -> Result<BeaconConfig> {
        let mut inner = self.inner.write().await;
        inner.config_requests += 1;
        if inner.offline {
            return Err(Error::upstream_unavailable().context("beacon node offline"));
        }
        Ok(inner.config)
    }

    async fn beacon_head(&self) -> Result<BeaconHead> {
        let inner = self.inner.read().await;
        if inner.offline {
            return Err(Error::upstream_unavailable().context("beacon node offline"));
        }
        Ok(inner.head)
    }

    async fn beacon_block(&self, slot: u64) -> Result<Option<BeaconBlock>> {
        let mut inner = self.inner.write().await;
        inner.queried.push(slot);
        if inner.offline {
            return Err(Error::upstream_unavailable().context("beacon node offline"));
        }
        Ok(inner.blocks.get(&slot).copied())
    }
}
