#![cfg(any(test, feature = "testing"))]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy::{
    primitives::I256,
    sol_types::{SolCall, SolValue},
};
use async_lock::RwLock;
use tokio::time::sleep;

use super::{
    ContractCall, ContractRegistry, ExecutionClient,
    contracts::{
        AddressQueueStorage, ContractName, ERC20, RocketMinipool, RocketMinipoolManager,
        RocketMinipoolQueue, RocketNodeDeposit, RocketNodeDistributorFactory, RocketNodeManager,
        RocketNodeStaking, RocketStorage,
    },
};
use crate::{
    Error, Result,
    state::queue::{QueueCapacity, QueuePartition},
    types::{
        common::{Address, Bytes, ElBlockHeader, TokenAmount, U256},
        minipool::MinipoolDetails,
        node::NodeDetails,
    },
};

/// An in-memory execution layer with canned responses for individual calls.
///
/// All state is shared between clones. The mock has a single state, regardless of the block number
/// requested.
#[derive(Clone, Debug, Default)]
pub struct MockExecutionClient {
    chain: Arc<RwLock<MockChain>>,
    stats: Arc<MockStats>,
}

#[derive(Debug, Default)]
struct MockChain {
    latest: Option<ElBlockHeader>,
    calls: HashMap<ContractCall, Bytes>,
    balances: HashMap<Address, TokenAmount>,
    failing: HashSet<ContractCall>,
    batch_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct MockStats {
    batch_calls: AtomicUsize,
    single_calls: AtomicUsize,
    bulk_balance_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockExecutionClient {
    pub async fn set_latest_block(&self, header: ElBlockHeader) {
        self.chain.write().await.latest = Some(header);
    }

    /// Respond to `call` on `target` with `ret`.
    pub async fn set_call<C: SolCall, V: SolValue>(&self, target: Address, call: C, ret: V) {
        let call = ContractCall::new(target, &call);
        let data = (ret,).abi_encode_params().into();
        self.chain.write().await.calls.insert(call, data);
    }

    pub async fn set_balance(&self, address: Address, balance: TokenAmount) {
        self.chain.write().await.balances.insert(address, balance);
    }

    /// Fail any request that includes `call` on `target`.
    pub async fn fail_call<C: SolCall>(&self, target: Address, call: C) {
        let call = ContractCall::new(target, &call);
        self.chain.write().await.failing.insert(call);
    }

    /// Make each batch take at least `delay`, so that concurrent batches overlap.
    pub async fn set_batch_delay(&self, delay: Duration) {
        self.chain.write().await.batch_delay = Some(delay);
    }

    /// Number of batched call requests made so far.
    pub fn batch_calls(&self) -> usize {
        self.stats.batch_calls.load(Ordering::SeqCst)
    }

    /// Number of single call requests made so far.
    pub fn single_calls(&self) -> usize {
        self.stats.single_calls.load(Ordering::SeqCst)
    }

    /// Number of bulk balance requests made so far.
    pub fn bulk_balance_calls(&self) -> usize {
        self.stats.bulk_balance_calls.load(Ordering::SeqCst)
    }

    /// The largest number of batch requests which were ever in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::SeqCst)
    }

    /// Register every protocol contract in the storage contract at `storage`.
    ///
    /// Contracts get deterministic addresses derived from their position in [`ContractName::ALL`].
    pub async fn register_contracts(&self, storage: Address) -> ContractRegistry {
        let mut registry = ContractRegistry {
            storage,
            ..Default::default()
        };
        for (i, name) in ContractName::ALL.into_iter().enumerate() {
            let address = Address::with_last_byte(0x10 + i as u8);
            self.set_call(
                storage,
                RocketStorage::getAddressCall::new((name.storage_key(),)),
                address,
            )
            .await;
            *registry.get_mut(name) = address;
        }
        registry
    }

    async fn respond(&self, call: &ContractCall) -> Result<Bytes> {
        let chain = self.chain.read().await;
        if chain.failing.contains(call) {
            return Err(Error::upstream_unavailable()
                .context(format!("simulated failure calling {}", call.target)));
        }
        chain.calls.get(call).cloned().ok_or_else(|| {
            Error::upstream_unavailable().context(format!(
                "execution reverted: no response for call to {} ({})",
                call.target, call.calldata
            ))
        })
    }
}

impl ExecutionClient for MockExecutionClient {
    async fn latest_block(&self) -> Result<ElBlockHeader> {
        self.chain
            .read()
            .await
            .latest
            .ok_or_else(|| Error::upstream_unavailable().context("no latest block"))
    }

    async fn call(&self, call: &ContractCall, _block: u64) -> Result<Bytes> {
        self.stats.single_calls.fetch_add(1, Ordering::SeqCst);
        self.respond(call).await
    }

    async fn batch_call(&self, calls: &[ContractCall], _block: u64) -> Result<Vec<Bytes>> {
        self.stats.batch_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats
            .max_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        let delay = self.chain.read().await.batch_delay;
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        let mut results = Vec::with_capacity(calls.len());
        let mut res = Ok(());
        for call in calls {
            match self.respond(call).await {
                Ok(data) => results.push(data),
                Err(err) => {
                    res = Err(err);
                    break;
                }
            }
        }

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        res.map(|()| results)
    }

    async fn balance(&self, address: Address, _block: u64) -> Result<TokenAmount> {
        self.stats.single_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .chain
            .read()
            .await
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn bulk_balances(&self, addresses: &[Address], _block: u64) -> Result<Vec<TokenAmount>> {
        self.stats.bulk_balance_calls.fetch_add(1, Ordering::SeqCst);
        let chain = self.chain.read().await;
        Ok(addresses
            .iter()
            .map(|address| chain.balances.get(address).copied().unwrap_or_default())
            .collect())
    }
}

/// A mock deployment of the protocol, with helpers to populate nodes, minipools and the deposit
/// queue.
#[derive(Clone, Debug)]
pub struct MockProtocol {
    pub client: MockExecutionClient,
    pub contracts: ContractRegistry,
    nodes: Vec<Address>,
    minipools: Vec<Address>,
    node_minipools: HashMap<Address, u64>,
    queues: HashMap<QueuePartition, Vec<Address>>,
}

impl MockProtocol {
    /// Deploy an empty protocol with its storage contract at `storage`.
    pub async fn new(storage: Address) -> Self {
        let client = MockExecutionClient::default();
        let contracts = client.register_contracts(storage).await;
        let protocol = Self {
            client,
            contracts,
            nodes: vec![],
            minipools: vec![],
            node_minipools: HashMap::new(),
            queues: HashMap::new(),
        };
        protocol.set_counts().await;
        protocol
            .set_total_effective_rpl_stake(TokenAmount::ZERO)
            .await;
        protocol.set_queue_capacity(QueueCapacity::default()).await;
        for partition in QueuePartition::DRAIN_ORDER {
            protocol.set_queue(partition).await;
        }
        protocol
    }

    pub async fn set_total_effective_rpl_stake(&self, stake: TokenAmount) {
        self.client
            .set_call(
                self.contracts.node_staking,
                RocketNodeStaking::getTotalEffectiveRPLStakeCall::new(()),
                stake,
            )
            .await;
    }

    pub async fn set_queue_capacity(&self, capacity: QueueCapacity) {
        let c = &self.contracts;
        self.client
            .set_call(
                c.minipool_queue,
                RocketMinipoolQueue::getTotalCapacityCall::new(()),
                capacity.total,
            )
            .await;
        self.client
            .set_call(
                c.minipool_queue,
                RocketMinipoolQueue::getEffectiveCapacityCall::new(()),
                capacity.effective,
            )
            .await;
        self.client
            .set_call(
                c.minipool_queue,
                RocketMinipoolQueue::getNextCapacityCall::new(()),
                capacity.next_minipool,
            )
            .await;
    }

    /// Register a node and all of its contract-visible state.
    ///
    /// The derived fields of `node` are ignored, as is its `balance_eth` and `distributor_balance`
    /// (see [`MockExecutionClient::set_balance`]). The minipool count is maintained by
    /// [`add_minipool`](Self::add_minipool).
    pub async fn add_node(&mut self, node: &NodeDetails) {
        let c = &self.contracts;
        let client = &self.client;
        let addr = node.node_address;
        let index = U256::from(self.nodes.len());
        self.nodes.push(addr);
        self.node_minipools.insert(addr, 0);

        client
            .set_call(c.node_manager, RocketNodeManager::getNodeAtCall::new((index,)), addr)
            .await;
        client
            .set_call(
                c.node_manager,
                RocketNodeManager::getNodeExistsCall::new((addr,)),
                node.exists,
            )
            .await;
        client
            .set_call(
                c.node_manager,
                RocketNodeManager::getNodeRegistrationTimeCall::new((addr,)),
                node.registration_time,
            )
            .await;
        client
            .set_call(
                c.node_manager,
                RocketNodeManager::getNodeTimezoneLocationCall::new((addr,)),
                node.timezone_location.clone(),
            )
            .await;
        client
            .set_call(
                c.node_manager,
                RocketNodeManager::getFeeDistributorInitialisedCall::new((addr,)),
                node.fee_distributor_initialised,
            )
            .await;
        client
            .set_call(
                c.node_distributor_factory,
                RocketNodeDistributorFactory::getProxyAddressCall::new((addr,)),
                node.fee_distributor_address,
            )
            .await;
        client
            .set_call(
                c.node_manager,
                RocketNodeManager::getRewardNetworkCall::new((addr,)),
                node.reward_network,
            )
            .await;
        client
            .set_call(
                c.node_staking,
                RocketNodeStaking::getNodeRPLStakeCall::new((addr,)),
                node.rpl_stake,
            )
            .await;
        client
            .set_call(
                c.node_staking,
                RocketNodeStaking::getNodeEffectiveRPLStakeCall::new((addr,)),
                node.effective_rpl_stake,
            )
            .await;
        client
            .set_call(
                c.node_staking,
                RocketNodeStaking::getNodeMinimumRPLStakeCall::new((addr,)),
                node.minimum_rpl_stake,
            )
            .await;
        client
            .set_call(
                c.node_staking,
                RocketNodeStaking::getNodeMaximumRPLStakeCall::new((addr,)),
                node.maximum_rpl_stake,
            )
            .await;
        client
            .set_call(
                c.node_staking,
                RocketNodeStaking::getNodeETHMatchedCall::new((addr,)),
                node.eth_matched,
            )
            .await;
        client
            .set_call(
                c.node_staking,
                RocketNodeStaking::getNodeETHMatchedLimitCall::new((addr,)),
                node.eth_matched_limit,
            )
            .await;
        client
            .set_call(
                c.minipool_manager,
                RocketMinipoolManager::getNodeMinipoolCountCall::new((addr,)),
                U256::ZERO,
            )
            .await;
        client
            .set_call(c.token_reth, ERC20::balanceOfCall::new((addr,)), node.balance_reth)
            .await;
        client
            .set_call(c.token_rpl, ERC20::balanceOfCall::new((addr,)), node.balance_rpl)
            .await;
        client
            .set_call(
                c.token_rpl_fixed_supply,
                ERC20::balanceOfCall::new((addr,)),
                node.balance_old_rpl,
            )
            .await;
        client
            .set_call(
                c.storage,
                RocketStorage::getNodeWithdrawalAddressCall::new((addr,)),
                node.withdrawal_address,
            )
            .await;
        client
            .set_call(
                c.storage,
                RocketStorage::getNodePendingWithdrawalAddressCall::new((addr,)),
                node.pending_withdrawal_address,
            )
            .await;
        client
            .set_call(
                c.node_manager,
                RocketNodeManager::getSmoothingPoolRegistrationStateCall::new((addr,)),
                node.smoothing_pool_registration_state,
            )
            .await;
        client
            .set_call(
                c.node_manager,
                RocketNodeManager::getSmoothingPoolRegistrationChangedCall::new((addr,)),
                node.smoothing_pool_registration_changed,
            )
            .await;
        client
            .set_call(
                c.node_deposit,
                RocketNodeDeposit::getNodeDepositCreditCall::new((addr,)),
                node.deposit_credit_balance,
            )
            .await;
        client
            .set_call(
                c.node_staking,
                RocketNodeStaking::getNodeETHCollateralisationRatioCall::new((addr,)),
                node.collateralisation_ratio,
            )
            .await;

        self.set_counts().await;
    }

    /// Register a minipool belonging to an already registered node.
    pub async fn add_minipool(&mut self, mp: &MinipoolDetails) {
        let c = &self.contracts;
        let client = &self.client;
        let addr = mp.minipool_address;
        let index = U256::from(self.minipools.len());
        self.minipools.push(addr);
        let node_count = self.node_minipools.entry(mp.node_address).or_default();
        let node_index = U256::from(*node_count);
        *node_count += 1;
        let node_count = U256::from(*node_count);

        client
            .set_call(
                c.minipool_manager,
                RocketMinipoolManager::getMinipoolAtCall::new((index,)),
                addr,
            )
            .await;
        client
            .set_call(
                c.minipool_manager,
                RocketMinipoolManager::getNodeMinipoolAtCall::new((mp.node_address, node_index)),
                addr,
            )
            .await;
        client
            .set_call(
                c.minipool_manager,
                RocketMinipoolManager::getNodeMinipoolCountCall::new((mp.node_address,)),
                node_count,
            )
            .await;
        client
            .set_call(addr, RocketMinipool::getNodeAddressCall::new(()), mp.node_address)
            .await;
        client
            .set_call(
                addr,
                RocketMinipool::getStatusCall::new(()),
                U256::from(mp.status as u8),
            )
            .await;
        client
            .set_call(addr, RocketMinipool::getFinalisedCall::new(()), mp.finalised)
            .await;
        client
            .set_call(addr, RocketMinipool::getNodeFeeCall::new(()), mp.node_fee)
            .await;
        client
            .set_call(
                addr,
                RocketMinipool::getDepositTypeCall::new(()),
                U256::from(u8::from(mp.deposit_type)),
            )
            .await;

        for partition in QueuePartition::DRAIN_ORDER {
            self.set_index(partition, addr).await;
        }
        self.set_counts().await;
    }

    /// Append a minipool to one partition of the deposit queue.
    pub async fn enqueue(&mut self, partition: QueuePartition, minipool: Address) {
        self.queues.entry(partition).or_default().push(minipool);
        self.set_queue(partition).await;
    }

    async fn set_counts(&self) {
        let c = &self.contracts;
        self.client
            .set_call(
                c.node_manager,
                RocketNodeManager::getNodeCountCall::new(()),
                U256::from(self.nodes.len()),
            )
            .await;
        self.client
            .set_call(
                c.minipool_manager,
                RocketMinipoolManager::getMinipoolCountCall::new(()),
                U256::from(self.minipools.len()),
            )
            .await;
    }

    async fn set_queue(&self, partition: QueuePartition) {
        let c = &self.contracts;
        let key = partition.storage_key();
        let queue = self.queues.get(&partition).cloned().unwrap_or_default();

        self.client
            .set_call(
                c.minipool_queue,
                RocketMinipoolQueue::getLengthCall::new((u8::from(partition.deposit_type()),)),
                U256::from(queue.len()),
            )
            .await;
        let total: usize = self.queues.values().map(Vec::len).sum();
        self.client
            .set_call(
                c.minipool_queue,
                RocketMinipoolQueue::getTotalLengthCall::new(()),
                U256::from(total),
            )
            .await;
        for (i, minipool) in queue.iter().enumerate() {
            self.client
                .set_call(
                    c.address_queue_storage,
                    AddressQueueStorage::getItemCall::new((key, U256::from(i))),
                    *minipool,
                )
                .await;
        }

        for minipool in &self.minipools {
            self.set_index(partition, *minipool).await;
        }
    }

    /// Record the index of `minipool` in `partition`: -1 where it is absent.
    async fn set_index(&self, partition: QueuePartition, minipool: Address) {
        let index = self
            .queues
            .get(&partition)
            .and_then(|queue| queue.iter().position(|queued| *queued == minipool))
            .map(|i| I256::try_from(i as i64).unwrap())
            .unwrap_or(I256::MINUS_ONE);
        self.client
            .set_call(
                self.contracts.address_queue_storage,
                AddressQueueStorage::getIndexOfCall::new((partition.storage_key(), minipool)),
                index,
            )
            .await;
    }
}
