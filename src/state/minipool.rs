//! Fetching minipool records.

use alloy::sol_types::SolCall;
use tracing::instrument;

use super::fetch::{ADDRESS_BATCH_SIZE, BatchFetcher, FieldSpec, MINIPOOL_BATCH_SIZE};
use crate::{
    Result,
    input::execution::{
        ContractCall, ContractRegistry, ExecutionClient,
        contracts::{RocketMinipool, RocketMinipoolManager},
        read,
    },
    types::{
        common::{Address, U256},
        minipool::{MinipoolDeposit, MinipoolDetails, MinipoolStatus},
    },
};

/// Every field of a minipool record, read from the minipool contract itself.
pub const MINIPOOL_FIELDS: &[FieldSpec<Address, MinipoolDetails>] = &[
    FieldSpec {
        method: "getNodeAddress",
        call: |_, minipool| ContractCall::new(*minipool, &RocketMinipool::getNodeAddressCall {}),
        store: |details, data| {
            details.node_address = RocketMinipool::getNodeAddressCall::abi_decode_returns(data)?;
            Ok(())
        },
    },
    FieldSpec {
        method: "getStatus",
        call: |_, minipool| ContractCall::new(*minipool, &RocketMinipool::getStatusCall {}),
        store: |details, data| {
            let status = RocketMinipool::getStatusCall::abi_decode_returns(data)?;
            details.status = MinipoolStatus::try_from(status)?;
            Ok(())
        },
    },
    FieldSpec {
        method: "getFinalised",
        call: |_, minipool| ContractCall::new(*minipool, &RocketMinipool::getFinalisedCall {}),
        store: |details, data| {
            details.finalised = RocketMinipool::getFinalisedCall::abi_decode_returns(data)?;
            Ok(())
        },
    },
    FieldSpec {
        method: "getNodeFee",
        call: |_, minipool| ContractCall::new(*minipool, &RocketMinipool::getNodeFeeCall {}),
        store: |details, data| {
            details.node_fee = RocketMinipool::getNodeFeeCall::abi_decode_returns(data)?;
            Ok(())
        },
    },
    FieldSpec {
        method: "getDepositType",
        call: |_, minipool| ContractCall::new(*minipool, &RocketMinipool::getDepositTypeCall {}),
        store: |details, data| {
            let ty = RocketMinipool::getDepositTypeCall::abi_decode_returns(data)?;
            details.deposit_type = MinipoolDeposit::try_from(ty)?;
            Ok(())
        },
    },
];

const MINIPOOL_AT: FieldSpec<u64, Address> = FieldSpec {
    method: "getMinipoolAt",
    call: |contracts, index| {
        ContractCall::new(
            contracts.minipool_manager,
            &RocketMinipoolManager::getMinipoolAtCall::new((U256::from(*index),)),
        )
    },
    store: |address, data| {
        *address = RocketMinipoolManager::getMinipoolAtCall::abi_decode_returns(data)?;
        Ok(())
    },
};

/// A minipool of one node, identified by the node and the minipool's index among the node's
/// minipools.
type NodeMinipoolKey = (Address, u64);

const NODE_MINIPOOL_AT: FieldSpec<NodeMinipoolKey, Address> = FieldSpec {
    method: "getNodeMinipoolAt",
    call: |contracts, (node, index)| {
        ContractCall::new(
            contracts.minipool_manager,
            &RocketMinipoolManager::getNodeMinipoolAtCall::new((*node, U256::from(*index))),
        )
    },
    store: |address, data| {
        *address = RocketMinipoolManager::getNodeMinipoolAtCall::abi_decode_returns(data)?;
        Ok(())
    },
};

/// The addresses of every minipool, in registry order.
pub async fn minipool_addresses<E: ExecutionClient>(
    fetcher: &BatchFetcher<E>,
    contracts: &ContractRegistry,
    block: u64,
) -> Result<Vec<Address>> {
    let count: u64 = read(
        fetcher.client(),
        contracts.minipool_manager,
        RocketMinipoolManager::getMinipoolCountCall::new(()),
        block,
    )
    .await?
    .saturating_to();
    let indices = (0..count).collect::<Vec<_>>();
    fetcher
        .fetch(
            &indices,
            |_| Address::ZERO,
            &[MINIPOOL_AT],
            contracts,
            block,
            ADDRESS_BATCH_SIZE,
        )
        .await
}

/// Records for the minipools at `addresses`, in the same order.
pub async fn minipool_details<E: ExecutionClient>(
    fetcher: &BatchFetcher<E>,
    contracts: &ContractRegistry,
    block: u64,
    addresses: &[Address],
) -> Result<Vec<MinipoolDetails>> {
    fetcher
        .fetch(
            addresses,
            |minipool_address| MinipoolDetails {
                minipool_address: *minipool_address,
                ..Default::default()
            },
            MINIPOOL_FIELDS,
            contracts,
            block,
            MINIPOOL_BATCH_SIZE,
        )
        .await
}

/// Records for every minipool, in registry order.
#[instrument(skip(fetcher, contracts))]
pub async fn all_minipool_details<E: ExecutionClient>(
    fetcher: &BatchFetcher<E>,
    contracts: &ContractRegistry,
    block: u64,
) -> Result<Vec<MinipoolDetails>> {
    let addresses = minipool_addresses(fetcher, contracts, block).await?;
    tracing::debug!(minipools = addresses.len(), "fetching minipool details");
    minipool_details(fetcher, contracts, block, &addresses).await
}

/// Records for the minipools of a single node.
#[instrument(skip(fetcher, contracts))]
pub async fn node_minipools<E: ExecutionClient>(
    fetcher: &BatchFetcher<E>,
    contracts: &ContractRegistry,
    block: u64,
    node: Address,
) -> Result<Vec<MinipoolDetails>> {
    let count: u64 = read(
        fetcher.client(),
        contracts.minipool_manager,
        RocketMinipoolManager::getNodeMinipoolCountCall::new((node,)),
        block,
    )
    .await?
    .saturating_to();
    let keys = (0..count).map(|i| (node, i)).collect::<Vec<_>>();
    let addresses = fetcher
        .fetch(
            &keys,
            |_| Address::ZERO,
            &[NODE_MINIPOOL_AT],
            contracts,
            block,
            ADDRESS_BATCH_SIZE,
        )
        .await?;
    minipool_details(fetcher, contracts, block, &addresses).await
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::{
        error::ErrorKind,
        input::execution::testing::MockProtocol,
        types::{common::CALC_BASE, node::NodeDetails},
    };

    fn minipool(i: u8, node: Address) -> MinipoolDetails {
        MinipoolDetails {
            minipool_address: Address::with_last_byte(0x80 + i),
            node_address: node,
            status: if i % 3 == 0 {
                MinipoolStatus::Dissolved
            } else {
                MinipoolStatus::Staking
            },
            finalised: i % 4 == 0,
            node_fee: U256::from(CALC_BASE / 20 * (i as u64 % 3 + 1)),
            deposit_type: MinipoolDeposit::Variable,
        }
    }

    /// Two nodes owning interleaved minipools.
    async fn protocol() -> (MockProtocol, Vec<MinipoolDetails>) {
        let mut protocol = MockProtocol::new(Address::with_last_byte(0xff)).await;
        let nodes = [Address::repeat_byte(1), Address::repeat_byte(2)];
        for node in nodes {
            protocol.add_node(&NodeDetails::new(node)).await;
        }
        let mut minipools = vec![];
        for i in 0..7 {
            let mp = minipool(i, nodes[i as usize % 2]);
            protocol.add_minipool(&mp).await;
            minipools.push(mp);
        }
        (protocol, minipools)
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_all_minipool_details() {
        let (protocol, minipools) = protocol().await;
        let fetcher = BatchFetcher::new(protocol.client.clone(), Arc::new(Semaphore::new(6)));
        let fetched = all_minipool_details(&fetcher, &protocol.contracts, 10)
            .await
            .unwrap();
        assert_eq!(fetched, minipools);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_node_minipools() {
        let (protocol, minipools) = protocol().await;
        let fetcher = BatchFetcher::new(protocol.client.clone(), Arc::new(Semaphore::new(6)));
        let fetched = node_minipools(&fetcher, &protocol.contracts, 10, Address::repeat_byte(2))
            .await
            .unwrap();
        let expected = minipools
            .into_iter()
            .filter(|mp| mp.node_address == Address::repeat_byte(2))
            .collect::<Vec<_>>();
        assert_eq!(fetched.len(), 3);
        assert_eq!(fetched, expected);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_invalid_status() {
        let (protocol, minipools) = protocol().await;
        protocol
            .client
            .set_call(
                minipools[2].minipool_address,
                RocketMinipool::getStatusCall {},
                U256::from(9),
            )
            .await;
        let fetcher = BatchFetcher::new(protocol.client.clone(), Arc::new(Semaphore::new(6)));
        let err = all_minipool_details(&fetcher, &protocol.contracts, 10)
            .await
            .unwrap_err();
        // Decoding failures inside a batch fail the batch, and with it the whole fetch.
        assert_eq!(err.kind(), ErrorKind::PartialFetchFailure);
    }
}
