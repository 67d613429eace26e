//! Assembling consistent snapshots of the network state.
//!
//! Every snapshot is taken at the execution layer block carried by a single beacon block. All
//! contract reads for the snapshot, including resolving the contract registry, are made against
//! that one block, so a snapshot never mixes state from different blocks.

use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy::sol_types::SolCall;
use async_lock::OnceCell;
use clap::Parser;
use tokio::{sync::Semaphore, time::timeout};
use tracing::instrument;

use crate::{
    Error, Result,
    input::{
        beacon::BeaconClient,
        execution::{ContractRegistry, ExecutionClient, contracts::RocketNodeStaking, read},
    },
    metrics::PrometheusMetrics,
    types::{
        common::{Address, BeaconBlock, BeaconConfig, TokenAmount},
        minipool::MinipoolDetails,
        node::NodeDetails,
        state::NetworkState,
    },
};

pub mod clock;
pub mod fetch;
pub mod minipool;
pub mod node;
pub mod queue;

use fetch::BatchFetcher;
use queue::{ContractQueueSource, QueueStatus};

/// Configuration for snapshot assembly.
#[derive(Clone, Debug, Parser)]
pub struct StateOptions {
    /// Maximum number of batched requests in flight at once, across all snapshots.
    #[clap(long, env = "STAKING_STATE_CONCURRENCY", default_value = "6")]
    pub concurrency: usize,

    /// Maximum number of slots to walk back when looking for a proposed block.
    #[clap(long, env = "STAKING_STATE_MAX_SLOT_LOOKBACK", default_value = "64")]
    pub max_slot_lookback: u64,

    /// Give up on a request after this many seconds.
    #[clap(long, env = "STAKING_STATE_REQUEST_TIMEOUT_SECS", default_value = "120")]
    pub request_timeout_secs: u64,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            concurrency: 6,
            max_slot_lookback: 64,
            request_timeout_secs: 120,
        }
    }
}

impl StateOptions {
    /// A semaphore admitting `concurrency` batches at once.
    ///
    /// Share one semaphore between every manager in the process to bound the total load on the
    /// execution client.
    pub fn permits(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.concurrency.max(1)))
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Produces snapshots of the network state on request.
#[derive(Debug)]
pub struct NetworkStateManager<E, B> {
    fetcher: BatchFetcher<E>,
    beacon: B,
    storage: Address,
    beacon_config: OnceCell<BeaconConfig>,
    options: StateOptions,
    metrics: Option<PrometheusMetrics>,
}

impl<E: ExecutionClient, B: BeaconClient> NetworkStateManager<E, B> {
    /// Create a manager for the deployment whose storage contract is at `storage`.
    ///
    /// Batched reads made by this manager take permits from `permits`.
    pub fn new(
        execution: E,
        beacon: B,
        storage: Address,
        options: StateOptions,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            fetcher: BatchFetcher::new(execution, permits),
            beacon,
            storage,
            beacon_config: OnceCell::new(),
            options,
            metrics: None,
        }
    }

    /// Record snapshots and fetch activity in `metrics`.
    pub fn with_metrics(mut self, metrics: PrometheusMetrics) -> Self {
        self.fetcher = self.fetcher.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    /// The beacon chain configuration.
    ///
    /// This is fetched from the beacon node on first use and never changes afterwards.
    pub async fn beacon_config(&self) -> Result<BeaconConfig> {
        self.beacon_config
            .get_or_try_init(|| async {
                let config = self.beacon.eth2_config().await?;
                tracing::info!(?config, "loaded beacon config");
                Ok::<_, Error>(config)
            })
            .await
            .copied()
    }

    /// A snapshot of every node and minipool at the head of the chain.
    #[instrument(skip(self))]
    pub async fn head_state(&self) -> Result<NetworkState> {
        self.with_timeout("head state", async {
            let block = self.head_block().await?;
            self.state_at(block).await
        })
        .await
    }

    /// A snapshot of a single node and its minipools at the head of the chain.
    #[instrument(skip(self))]
    pub async fn head_state_for_node(&self, address: Address) -> Result<NetworkState> {
        self.with_timeout("node state", async {
            let block = self.head_block().await?;
            let (config, el_block) = self.execution_block(&block).await?;
            let contracts = self.contracts(el_block).await?;
            let ((node, minipools), total_effective_rpl_stake) = futures::try_join!(
                self.assemble_for_one(&contracts, el_block, address),
                self.total_effective_rpl_stake(&contracts, el_block),
            )?;
            tracing::info!(el_block, slot = block.slot, "assembled node state");
            Ok(NetworkState {
                el_block_number: el_block,
                beacon_slot_number: block.slot,
                beacon_config: config,
                total_effective_rpl_stake,
                nodes: vec![node],
                minipools,
            })
        })
        .await
    }

    /// A snapshot of every node and minipool at the latest proposed block at or before `slot`.
    #[instrument(skip(self))]
    pub async fn state_for_slot(&self, slot: u64) -> Result<NetworkState> {
        self.with_timeout("state for slot", async {
            let block = clock::latest_proposed_block(
                &self.beacon,
                slot,
                self.options.max_slot_lookback,
            )
            .await?;
            self.state_at(block).await
        })
        .await
    }

    /// The latest proposed beacon block at or before the head slot.
    #[instrument(skip(self))]
    pub async fn latest_beacon_block(&self) -> Result<BeaconBlock> {
        self.with_timeout("latest block", self.head_block()).await
    }

    /// The latest proposed beacon block in or before the last finalized epoch.
    #[instrument(skip(self))]
    pub async fn latest_finalized_beacon_block(&self) -> Result<BeaconBlock> {
        self.with_timeout("latest finalized block", async {
            let config = self.beacon_config().await?;
            clock::latest_finalized_block(&self.beacon, &config, self.options.max_slot_lookback)
                .await
        })
        .await
    }

    /// The 1-indexed position of `minipool` in the deposit queue at the head of the chain, or 0 if
    /// it is not queued.
    #[instrument(skip(self))]
    pub async fn queue_position(&self, minipool: Address) -> Result<u64> {
        self.with_timeout("queue position", async {
            let block = self.head_block().await?;
            let (_, el_block) = self.execution_block(&block).await?;
            let contracts = self.contracts(el_block).await?;
            let source = ContractQueueSource::new(self.fetcher.client(), &contracts, el_block);
            queue::position_of(&source, minipool).await
        })
        .await
    }

    /// Lengths and capacity of the deposit queue at the head of the chain.
    #[instrument(skip(self))]
    pub async fn queue_status(&self) -> Result<QueueStatus> {
        self.with_timeout("queue status", async {
            let block = self.head_block().await?;
            let (_, el_block) = self.execution_block(&block).await?;
            let contracts = self.contracts(el_block).await?;
            ContractQueueSource::new(self.fetcher.client(), &contracts, el_block)
                .status()
                .await
        })
        .await
    }

    /// The minipool at the 0-indexed `position` in the deposit queue at the head of the chain.
    #[instrument(skip(self))]
    pub async fn minipool_at_queue_position(&self, position: u64) -> Result<Address> {
        self.with_timeout("queue lookup", async {
            let block = self.head_block().await?;
            let (_, el_block) = self.execution_block(&block).await?;
            let contracts = self.contracts(el_block).await?;
            let source = ContractQueueSource::new(self.fetcher.client(), &contracts, el_block);
            queue::minipool_at_position(&source, position).await
        })
        .await
    }

    /// Every node and minipool at `el_block`, with derived fields computed.
    pub async fn assemble_for_all(
        &self,
        contracts: &ContractRegistry,
        el_block: u64,
    ) -> Result<(Vec<NodeDetails>, Vec<MinipoolDetails>)> {
        let (mut nodes, minipools) = futures::try_join!(
            node::all_node_details(&self.fetcher, contracts, el_block),
            minipool::all_minipool_details(&self.fetcher, contracts, el_block),
        )?;

        let mut by_node: HashMap<Address, Vec<&MinipoolDetails>> = HashMap::new();
        for mp in &minipools {
            by_node.entry(mp.node_address).or_default().push(mp);
        }
        for node in &mut nodes {
            let owned = by_node.remove(&node.node_address).unwrap_or_default();
            node.calculate_average_fee_and_distributor_shares(owned)?;
        }
        Ok((nodes, minipools))
    }

    /// A single node and its minipools at `el_block`, with derived fields computed.
    pub async fn assemble_for_one(
        &self,
        contracts: &ContractRegistry,
        el_block: u64,
        address: Address,
    ) -> Result<(NodeDetails, Vec<MinipoolDetails>)> {
        let (mut node, minipools) = futures::try_join!(
            node::node_details(self.fetcher.client(), contracts, el_block, address),
            minipool::node_minipools(&self.fetcher, contracts, el_block, address),
        )?;
        node.calculate_average_fee_and_distributor_shares(&minipools)?;
        Ok((node, minipools))
    }

    /// The latest proposed block at or before the slot of the latest execution layer block.
    async fn head_block(&self) -> Result<BeaconBlock> {
        let config = self.beacon_config().await?;
        let slot = clock::head_slot(self.fetcher.client(), &config).await?;
        clock::latest_proposed_block(&self.beacon, slot, self.options.max_slot_lookback).await
    }

    /// The execution layer block carried by `block`.
    async fn execution_block(&self, block: &BeaconBlock) -> Result<(BeaconConfig, u64)> {
        let config = self.beacon_config().await?;
        let el_block = block.execution_block_number.ok_or_else(|| {
            Error::upstream_unavailable().context(format!(
                "beacon block at slot {} has no execution payload",
                block.slot
            ))
        })?;
        Ok((config, el_block))
    }

    async fn total_effective_rpl_stake(
        &self,
        contracts: &ContractRegistry,
        el_block: u64,
    ) -> Result<TokenAmount> {
        read(
            self.fetcher.client(),
            contracts.node_staking,
            RocketNodeStaking::getTotalEffectiveRPLStakeCall::new(()),
            el_block,
        )
        .await
    }

    async fn contracts(&self, el_block: u64) -> Result<ContractRegistry> {
        ContractRegistry::load(self.fetcher.client(), self.storage, el_block).await
    }

    /// Assemble a full snapshot at the execution block carried by `block`.
    async fn state_at(&self, block: BeaconBlock) -> Result<NetworkState> {
        let (config, el_block) = self.execution_block(&block).await?;
        let contracts = self.contracts(el_block).await?;
        let ((nodes, minipools), total_effective_rpl_stake) = futures::try_join!(
            self.assemble_for_all(&contracts, el_block),
            self.total_effective_rpl_stake(&contracts, el_block),
        )?;
        tracing::info!(
            el_block,
            slot = block.slot,
            nodes = nodes.len(),
            minipools = minipools.len(),
            "assembled network state"
        );

        let state = NetworkState {
            el_block_number: el_block,
            beacon_slot_number: block.slot,
            beacon_config: config,
            total_effective_rpl_stake,
            nodes,
            minipools,
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot(&state);
        }
        Ok(state)
    }

    /// Run `fut`, failing if it does not complete within the request timeout.
    ///
    /// On timeout `fut` is dropped, cancelling any requests it still has in flight.
    async fn with_timeout<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = self.options.request_timeout();
        match timeout(limit, fut).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(op, ?limit, "request timed out");
                Err(Error::upstream_unavailable().context(format!("{op} timed out after {limit:?}")))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::ErrorKind,
        input::{
            beacon::testing::MockBeaconClient,
            execution::testing::{MockExecutionClient, MockProtocol},
        },
        state::queue::{QueueCapacity, QueuePartition},
        types::{
            common::{CALC_BASE, ElBlockHeader, U256},
            minipool::{MinipoolDeposit, MinipoolStatus},
        },
    };

    const CONFIG: BeaconConfig = BeaconConfig {
        genesis_time: 1_000_000,
        seconds_per_slot: 12,
        slots_per_epoch: 32,
    };

    const STORAGE: Address = Address::repeat_byte(0xee);

    fn eth(n: u64) -> U256 {
        U256::from(n) * U256::from(CALC_BASE)
    }

    fn node(i: u8) -> NodeDetails {
        NodeDetails {
            exists: true,
            fee_distributor_address: Address::repeat_byte(0xd0 + i),
            effective_rpl_stake: eth(if i == 2 { 1 } else { 50 }),
            minimum_rpl_stake: eth(10),
            smoothing_pool_registration_state: true,
            smoothing_pool_registration_changed: U256::from(100),
            collateralisation_ratio: eth(2),
            ..NodeDetails::new(Address::repeat_byte(i))
        }
    }

    fn minipool(i: u8, node: u8, status: MinipoolStatus, fee_percent: u64) -> MinipoolDetails {
        MinipoolDetails {
            minipool_address: Address::with_last_byte(0x80 + i),
            node_address: Address::repeat_byte(node),
            status,
            finalised: false,
            node_fee: U256::from(CALC_BASE / 100 * fee_percent),
            deposit_type: MinipoolDeposit::Variable,
        }
    }

    /// A chain where the execution head falls in slot 100, which was missed, and the latest
    /// proposed block is at slot 99 carrying execution block 555.
    async fn setup() -> (MockProtocol, MockBeaconClient) {
        let mut protocol = MockProtocol::new(STORAGE).await;
        for i in 1..=3 {
            let node = node(i);
            protocol.add_node(&node).await;
            protocol
                .client
                .set_balance(node.fee_distributor_address, eth(i as u64))
                .await;
        }
        for mp in [
            minipool(0, 1, MinipoolStatus::Staking, 10),
            minipool(1, 1, MinipoolStatus::Staking, 20),
            minipool(2, 1, MinipoolStatus::Dissolved, 50),
            minipool(3, 3, MinipoolStatus::Prelaunch, 5),
        ] {
            protocol.add_minipool(&mp).await;
        }
        protocol
            .client
            .set_latest_block(ElBlockHeader {
                number: 560,
                timestamp: CONFIG.genesis_time + 100 * 12 + 3,
            })
            .await;

        let beacon = MockBeaconClient::new(CONFIG);
        beacon.add_block(99, 555).await;
        beacon.add_block(50, 500).await;
        beacon.add_pre_merge_block(10).await;
        (protocol, beacon)
    }

    fn manager(
        protocol: &MockProtocol,
        beacon: &MockBeaconClient,
    ) -> NetworkStateManager<MockExecutionClient, MockBeaconClient> {
        let options = StateOptions::default();
        let permits = options.permits();
        NetworkStateManager::new(
            protocol.client.clone(),
            beacon.clone(),
            STORAGE,
            options,
            permits,
        )
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_head_state() {
        let (protocol, beacon) = setup().await;
        let metrics = PrometheusMetrics::new().unwrap();
        let manager = manager(&protocol, &beacon).with_metrics(metrics.clone());

        let state = manager.head_state().await.unwrap();
        assert_eq!(state.el_block_number, 555);
        assert_eq!(state.beacon_slot_number, 99);
        assert_eq!(state.beacon_config, CONFIG);
        assert_eq!(state.nodes.len(), 3);
        assert_eq!(state.minipools.len(), 4);

        // Node 1 has two staking minipools, at 10% and 20%, and 1 ETH in its distributor. With a
        // collateralisation ratio of 2, it gets 0.5 ETH, plus 15% of the remaining 0.5 ETH.
        let node1 = state.node(Address::repeat_byte(1)).unwrap();
        assert_eq!(node1.average_node_fee, U256::from(CALC_BASE / 100 * 15));
        assert_eq!(
            node1.distributor_balance_node_eth,
            U256::from(CALC_BASE / 2 + CALC_BASE / 2 * 15 / 100)
        );
        assert_eq!(
            node1.distributor_balance_node_eth + node1.distributor_balance_user_eth,
            node1.distributor_balance
        );

        // Node 2 is below the minimum stake and has no minipools.
        let node2 = state.node(Address::repeat_byte(2)).unwrap();
        assert_eq!(node2.effective_rpl_stake, U256::ZERO);
        assert_eq!(node2.average_node_fee, U256::ZERO);
        assert_eq!(node2.distributor_balance_node_eth, eth(1));
        assert_eq!(node2.distributor_balance_user_eth, eth(1));

        // Node 3's only minipool is not staking, so it earns no commission.
        let node3 = state.node(Address::repeat_byte(3)).unwrap();
        assert_eq!(node3.average_node_fee, U256::ZERO);
        assert_eq!(node3.distributor_balance_node_eth, U256::from(CALC_BASE * 3 / 2));

        let text = metrics.export().unwrap();
        assert!(text.contains("snapshot_el_block 555"), "{text}");
        assert!(text.contains("snapshot_node_count 3"), "{text}");
        assert!(metrics.fetch_batches.get() > 0);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_head_state_for_node() {
        let (protocol, beacon) = setup().await;
        protocol.set_total_effective_rpl_stake(eth(101)).await;
        let manager = manager(&protocol, &beacon);

        let full = manager.head_state().await.unwrap();
        let single = manager
            .head_state_for_node(Address::repeat_byte(1))
            .await
            .unwrap();
        assert_eq!(single.el_block_number, 555);
        assert_eq!(single.beacon_slot_number, 99);
        assert_eq!(single.total_effective_rpl_stake, eth(101));
        assert_eq!(full.total_effective_rpl_stake, eth(101));
        assert_eq!(
            single.nodes,
            vec![full.node(Address::repeat_byte(1)).unwrap().clone()]
        );
        assert_eq!(
            single.minipools,
            full.minipools_of(Address::repeat_byte(1))
                .cloned()
                .collect::<Vec<_>>()
        );
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_beacon_config_memoized() {
        let (protocol, beacon) = setup().await;
        let manager = manager(&protocol, &beacon);
        manager.latest_beacon_block().await.unwrap();
        manager.head_state().await.unwrap();
        manager.beacon_config().await.unwrap();
        assert_eq!(beacon.config_requests().await, 1);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_state_for_slot() {
        let (protocol, beacon) = setup().await;
        let manager = manager(&protocol, &beacon);

        let state = manager.state_for_slot(60).await.unwrap();
        assert_eq!(state.beacon_slot_number, 50);
        assert_eq!(state.el_block_number, 500);

        // The block at slot 10 predates the merge.
        let err = manager.state_for_slot(12).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_latest_blocks() {
        let (protocol, beacon) = setup().await;
        beacon.set_finalized_epoch(1).await;
        let manager = manager(&protocol, &beacon);

        let block = manager.latest_beacon_block().await.unwrap();
        assert_eq!(block.slot, 99);
        assert_eq!(block.execution_block_number, Some(555));

        // Epoch 1 ends at slot 63; the latest block before that is at slot 50.
        let block = manager.latest_finalized_beacon_block().await.unwrap();
        assert_eq!(block.slot, 50);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_partial_failure() {
        let (protocol, beacon) = setup().await;
        protocol
            .client
            .fail_call(
                protocol.contracts.node_staking,
                RocketNodeStaking::getNodeRPLStakeCall::new((Address::repeat_byte(2),)),
            )
            .await;
        let manager = manager(&protocol, &beacon);
        let err = manager.head_state().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PartialFetchFailure);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_beacon_unavailable() {
        let (protocol, beacon) = setup().await;
        beacon.set_offline(true).await;
        let manager = manager(&protocol, &beacon);
        let err = manager.head_state().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_timeout() {
        let (protocol, beacon) = setup().await;
        protocol
            .client
            .set_batch_delay(Duration::from_secs(30))
            .await;
        let options = StateOptions {
            request_timeout_secs: 1,
            ..Default::default()
        };
        let permits = options.permits();
        let manager =
            NetworkStateManager::new(protocol.client.clone(), beacon, STORAGE, options, permits);

        let start = Instant::now();
        let err = manager.head_state().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_queue() {
        let (mut protocol, beacon) = setup().await;
        let queued = [
            (QueuePartition::Full, Address::with_last_byte(0x90)),
            (QueuePartition::Half, Address::with_last_byte(0x91)),
        ];
        for (partition, address) in queued {
            protocol
                .add_minipool(&MinipoolDetails {
                    minipool_address: address,
                    node_address: Address::repeat_byte(3),
                    status: MinipoolStatus::Initialised,
                    deposit_type: partition.deposit_type(),
                    ..Default::default()
                })
                .await;
            protocol.enqueue(partition, address).await;
        }
        let manager = manager(&protocol, &beacon);

        // The half partition is drained first.
        assert_eq!(manager.queue_position(queued[1].1).await.unwrap(), 1);
        assert_eq!(manager.queue_position(queued[0].1).await.unwrap(), 2);
        assert_eq!(
            manager.minipool_at_queue_position(0).await.unwrap(),
            queued[1].1
        );
        let err = manager.minipool_at_queue_position(2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        let status = manager.queue_status().await.unwrap();
        assert_eq!(status.lengths.total(), 2);
        assert_eq!(status.capacity, QueueCapacity::default());
    }
}
