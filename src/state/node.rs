//! Fetching node operator records.

use alloy::sol_types::SolCall;
use tracing::instrument;

use super::fetch::{ADDRESS_BATCH_SIZE, BatchFetcher, FieldSpec, NODE_BATCH_SIZE, fetch_direct};
use crate::{
    Result,
    input::execution::{
        ContractCall, ContractRegistry, ExecutionClient,
        contracts::{
            ERC20, RocketMinipoolManager, RocketNodeDeposit, RocketNodeDistributorFactory,
            RocketNodeManager, RocketNodeStaking, RocketStorage,
        },
        read,
    },
    types::{
        common::{Address, U256},
        node::NodeDetails,
    },
};

/// A field of [`NodeDetails`] read by calling `$call` on the contract at `contracts.$contract`,
/// with the node address as the only argument.
macro_rules! node_field {
    ($contract:ident, $iface:ident :: $call:ident => $field:ident) => {
        FieldSpec {
            method: stringify!($call),
            call: |contracts, node| {
                ContractCall::new(contracts.$contract, &$iface::$call::new((*node,)))
            },
            store: |details, data| {
                details.$field = $iface::$call::abi_decode_returns(data)?;
                Ok(())
            },
        }
    };
}

/// Every contract-visible field of a node record.
///
/// ETH balances are not included: those come from separate balance reads.
pub const NODE_FIELDS: &[FieldSpec<Address, NodeDetails>] = &[
    node_field!(node_manager, RocketNodeManager::getNodeExistsCall => exists),
    node_field!(node_manager, RocketNodeManager::getNodeRegistrationTimeCall => registration_time),
    node_field!(node_manager, RocketNodeManager::getNodeTimezoneLocationCall => timezone_location),
    node_field!(
        node_manager,
        RocketNodeManager::getFeeDistributorInitialisedCall => fee_distributor_initialised
    ),
    node_field!(
        node_distributor_factory,
        RocketNodeDistributorFactory::getProxyAddressCall => fee_distributor_address
    ),
    node_field!(node_manager, RocketNodeManager::getRewardNetworkCall => reward_network),
    node_field!(node_staking, RocketNodeStaking::getNodeRPLStakeCall => rpl_stake),
    node_field!(
        node_staking,
        RocketNodeStaking::getNodeEffectiveRPLStakeCall => effective_rpl_stake
    ),
    node_field!(node_staking, RocketNodeStaking::getNodeMinimumRPLStakeCall => minimum_rpl_stake),
    node_field!(node_staking, RocketNodeStaking::getNodeMaximumRPLStakeCall => maximum_rpl_stake),
    node_field!(node_staking, RocketNodeStaking::getNodeETHMatchedCall => eth_matched),
    node_field!(node_staking, RocketNodeStaking::getNodeETHMatchedLimitCall => eth_matched_limit),
    node_field!(
        minipool_manager,
        RocketMinipoolManager::getNodeMinipoolCountCall => minipool_count
    ),
    node_field!(token_reth, ERC20::balanceOfCall => balance_reth),
    node_field!(token_rpl, ERC20::balanceOfCall => balance_rpl),
    node_field!(token_rpl_fixed_supply, ERC20::balanceOfCall => balance_old_rpl),
    node_field!(storage, RocketStorage::getNodeWithdrawalAddressCall => withdrawal_address),
    node_field!(
        storage,
        RocketStorage::getNodePendingWithdrawalAddressCall => pending_withdrawal_address
    ),
    node_field!(
        node_manager,
        RocketNodeManager::getSmoothingPoolRegistrationStateCall => smoothing_pool_registration_state
    ),
    node_field!(
        node_manager,
        RocketNodeManager::getSmoothingPoolRegistrationChangedCall => smoothing_pool_registration_changed
    ),
    node_field!(node_deposit, RocketNodeDeposit::getNodeDepositCreditCall => deposit_credit_balance),
    node_field!(
        node_staking,
        RocketNodeStaking::getNodeETHCollateralisationRatioCall => collateralisation_ratio
    ),
];

const NODE_AT: FieldSpec<u64, Address> = FieldSpec {
    method: "getNodeAt",
    call: |contracts, index| {
        ContractCall::new(
            contracts.node_manager,
            &RocketNodeManager::getNodeAtCall::new((U256::from(*index),)),
        )
    },
    store: |address, data| {
        *address = RocketNodeManager::getNodeAtCall::abi_decode_returns(data)?;
        Ok(())
    },
};

/// The addresses of every registered node, in registry order.
pub async fn node_addresses<E: ExecutionClient>(
    fetcher: &BatchFetcher<E>,
    contracts: &ContractRegistry,
    block: u64,
) -> Result<Vec<Address>> {
    let count: u64 = read(
        fetcher.client(),
        contracts.node_manager,
        RocketNodeManager::getNodeCountCall::new(()),
        block,
    )
    .await?
    .saturating_to();
    let indices = (0..count).collect::<Vec<_>>();
    fetcher
        .fetch(
            &indices,
            |_| Address::ZERO,
            &[NODE_AT],
            contracts,
            block,
            ADDRESS_BATCH_SIZE,
        )
        .await
}

/// Records for every registered node, in registry order, with ETH balances filled in and the
/// effective stake corrected.
///
/// Derived fields which depend on minipools are left at zero.
#[instrument(skip(fetcher, contracts))]
pub async fn all_node_details<E: ExecutionClient>(
    fetcher: &BatchFetcher<E>,
    contracts: &ContractRegistry,
    block: u64,
) -> Result<Vec<NodeDetails>> {
    let addresses = node_addresses(fetcher, contracts, block).await?;
    tracing::debug!(nodes = addresses.len(), "fetching node details");

    let mut nodes = fetcher
        .fetch(
            &addresses,
            |address| NodeDetails::new(*address),
            NODE_FIELDS,
            contracts,
            block,
            NODE_BATCH_SIZE,
        )
        .await?;

    let distributors = nodes
        .iter()
        .map(|node| node.fee_distributor_address)
        .collect::<Vec<_>>();
    let (balances, distributor_balances) = futures::try_join!(
        fetcher.balances(&addresses, block),
        fetcher.balances(&distributors, block),
    )?;
    for ((node, balance), distributor_balance) in
        nodes.iter_mut().zip(balances).zip(distributor_balances)
    {
        node.balance_eth = balance;
        node.distributor_balance = distributor_balance;
        node.fix_effective_stake();
    }
    Ok(nodes)
}

/// The record for a single node, with its ETH balances filled in and the effective stake
/// corrected.
#[instrument(skip(client, contracts))]
pub async fn node_details<E: ExecutionClient>(
    client: &E,
    contracts: &ContractRegistry,
    block: u64,
    address: Address,
) -> Result<NodeDetails> {
    let mut node = NodeDetails::new(address);
    fetch_direct(client, &address, &mut node, NODE_FIELDS, contracts, block).await?;
    let (balance, distributor_balance) = futures::try_join!(
        client.balance(address, block),
        client.balance(node.fee_distributor_address, block),
    )?;
    node.balance_eth = balance;
    node.distributor_balance = distributor_balance;
    node.fix_effective_stake();
    Ok(node)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::input::execution::testing::MockProtocol;

    fn sample_node(i: u8) -> NodeDetails {
        let eth = |n: u64| U256::from(n) * U256::from(10u64.pow(18));
        NodeDetails {
            exists: true,
            registration_time: U256::from(1_600_000_000u64 + i as u64),
            timezone_location: format!("Zone/{i}"),
            fee_distributor_initialised: true,
            fee_distributor_address: Address::repeat_byte(0xd0 + i),
            reward_network: U256::ZERO,
            rpl_stake: eth(100 * i as u64),
            // Below the minimum for odd nodes.
            effective_rpl_stake: eth(if i % 2 == 0 { 80 } else { 5 }),
            minimum_rpl_stake: eth(10),
            maximum_rpl_stake: eth(1000),
            eth_matched: eth(24),
            eth_matched_limit: eth(48),
            balance_reth: eth(i as u64),
            balance_rpl: eth(2 * i as u64),
            balance_old_rpl: U256::ZERO,
            deposit_credit_balance: eth(1),
            withdrawal_address: Address::repeat_byte(0xa0 + i),
            pending_withdrawal_address: Address::ZERO,
            smoothing_pool_registration_state: i % 3 == 0,
            smoothing_pool_registration_changed: U256::from(1_650_000_000u64),
            collateralisation_ratio: U256::from(2) * U256::from(10u64.pow(18)),
            ..NodeDetails::new(Address::repeat_byte(i))
        }
    }

    async fn protocol(nodes: u8) -> MockProtocol {
        let mut protocol = MockProtocol::new(Address::with_last_byte(0xff)).await;
        for i in 1..=nodes {
            let node = sample_node(i);
            protocol.add_node(&node).await;
            protocol
                .client
                .set_balance(node.node_address, U256::from(i as u64 * 7))
                .await;
            protocol
                .client
                .set_balance(node.fee_distributor_address, U256::from(i as u64 * 11))
                .await;
        }
        protocol
    }

    fn expected(i: u8) -> NodeDetails {
        let mut node = sample_node(i);
        node.balance_eth = U256::from(i as u64 * 7);
        node.distributor_balance = U256::from(i as u64 * 11);
        node.fix_effective_stake();
        node
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_all_node_details() {
        let protocol = protocol(5).await;
        let fetcher = BatchFetcher::new(protocol.client.clone(), Arc::new(Semaphore::new(6)));

        let nodes = all_node_details(&fetcher, &protocol.contracts, 10)
            .await
            .unwrap();
        assert_eq!(nodes, (1..=5).map(expected).collect::<Vec<_>>());
        for node in &nodes {
            assert!(
                node.effective_rpl_stake.is_zero()
                    || node.effective_rpl_stake >= node.minimum_rpl_stake
            );
        }
        // One batch of addresses, one of details.
        assert_eq!(protocol.client.batch_calls(), 2);
        // One bulk balance read each for nodes and distributors.
        assert_eq!(protocol.client.bulk_balance_calls(), 2);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_node_details() {
        let protocol = protocol(3).await;
        let node = node_details(
            &protocol.client,
            &protocol.contracts,
            10,
            Address::repeat_byte(2),
        )
        .await
        .unwrap();
        assert_eq!(node, expected(2));
        assert_eq!(protocol.client.batch_calls(), 0);
        assert_eq!(protocol.client.bulk_balance_calls(), 0);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_no_nodes() {
        let protocol = protocol(0).await;
        let fetcher = BatchFetcher::new(protocol.client.clone(), Arc::new(Semaphore::new(6)));
        let nodes = all_node_details(&fetcher, &protocol.contracts, 10)
            .await
            .unwrap();
        assert!(nodes.is_empty());
    }
}
