//! Protocol contract interfaces and the registry of their deployed addresses.

use alloy::{
    primitives::keccak256,
    sol,
    sol_types::SolCall,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::{ContractCall, ExecutionClient};
use crate::{
    Error, Result,
    error::ensure,
    types::common::{Address, B256},
};

sol! {
    interface RocketStorage {
        function getAddress(bytes32 key) external view returns (address);
        function getNodeWithdrawalAddress(address nodeAddress) external view returns (address);
        function getNodePendingWithdrawalAddress(address nodeAddress) external view returns (address);
    }

    interface RocketNodeManager {
        function getNodeCount() external view returns (uint256);
        function getNodeAt(uint256 index) external view returns (address);
        function getNodeExists(address nodeAddress) external view returns (bool);
        function getNodeRegistrationTime(address nodeAddress) external view returns (uint256);
        function getNodeTimezoneLocation(address nodeAddress) external view returns (string);
        function getFeeDistributorInitialised(address nodeAddress) external view returns (bool);
        function getRewardNetwork(address nodeAddress) external view returns (uint256);
        function getSmoothingPoolRegistrationState(address nodeAddress) external view returns (bool);
        function getSmoothingPoolRegistrationChanged(address nodeAddress) external view returns (uint256);
    }

    interface RocketNodeDistributorFactory {
        function getProxyAddress(address nodeAddress) external view returns (address);
    }

    interface RocketNodeStaking {
        function getTotalEffectiveRPLStake() external view returns (uint256);
        function getNodeRPLStake(address nodeAddress) external view returns (uint256);
        function getNodeEffectiveRPLStake(address nodeAddress) external view returns (uint256);
        function getNodeMinimumRPLStake(address nodeAddress) external view returns (uint256);
        function getNodeMaximumRPLStake(address nodeAddress) external view returns (uint256);
        function getNodeETHMatched(address nodeAddress) external view returns (uint256);
        function getNodeETHMatchedLimit(address nodeAddress) external view returns (uint256);
        function getNodeETHCollateralisationRatio(address nodeAddress) external view returns (uint256);
    }

    interface RocketNodeDeposit {
        function getNodeDepositCredit(address nodeAddress) external view returns (uint256);
    }

    interface RocketMinipoolManager {
        function getMinipoolCount() external view returns (uint256);
        function getMinipoolAt(uint256 index) external view returns (address);
        function getNodeMinipoolCount(address nodeAddress) external view returns (uint256);
        function getNodeMinipoolAt(address nodeAddress, uint256 index) external view returns (address);
    }

    interface RocketMinipool {
        function getNodeAddress() external view returns (address);
        function getStatus() external view returns (uint8);
        function getFinalised() external view returns (bool);
        function getNodeFee() external view returns (uint256);
        function getDepositType() external view returns (uint8);
    }

    interface RocketMinipoolQueue {
        function getTotalLength() external view returns (uint256);
        function getLength(uint8 depositType) external view returns (uint256);
        function getTotalCapacity() external view returns (uint256);
        function getEffectiveCapacity() external view returns (uint256);
        function getNextCapacity() external view returns (uint256);
    }

    interface AddressQueueStorage {
        function getIndexOf(bytes32 key, address value) external view returns (int256);
        function getItem(bytes32 key, uint256 index) external view returns (address);
    }

    interface ERC20 {
        function balanceOf(address account) external view returns (uint256);
    }

    #[sol(rpc)]
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct Result {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls) external payable returns (Result[] memory returnData);
    }

    #[sol(rpc)]
    interface BalanceBatcher {
        function balances(address[] users, address[] tokens) external view returns (uint256[]);
    }
}

/// The protocol contracts read when building a snapshot, by their name in the storage contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContractName {
    NodeManager,
    NodeDistributorFactory,
    NodeStaking,
    NodeDeposit,
    MinipoolManager,
    MinipoolQueue,
    AddressQueueStorage,
    TokenReth,
    TokenRpl,
    TokenRplFixedSupply,
}

impl ContractName {
    pub const ALL: [Self; 10] = [
        Self::NodeManager,
        Self::NodeDistributorFactory,
        Self::NodeStaking,
        Self::NodeDeposit,
        Self::MinipoolManager,
        Self::MinipoolQueue,
        Self::AddressQueueStorage,
        Self::TokenReth,
        Self::TokenRpl,
        Self::TokenRplFixedSupply,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NodeManager => "rocketNodeManager",
            Self::NodeDistributorFactory => "rocketNodeDistributorFactory",
            Self::NodeStaking => "rocketNodeStaking",
            Self::NodeDeposit => "rocketNodeDeposit",
            Self::MinipoolManager => "rocketMinipoolManager",
            Self::MinipoolQueue => "rocketMinipoolQueue",
            Self::AddressQueueStorage => "addressQueueStorage",
            Self::TokenReth => "rocketTokenRETH",
            Self::TokenRpl => "rocketTokenRPL",
            Self::TokenRplFixedSupply => "rocketTokenRPLFixedSupply",
        }
    }

    /// The key under which the storage contract records this contract's address.
    pub fn storage_key(self) -> B256 {
        keccak256(format!("contract.address{}", self.as_str()))
    }
}

/// Addresses of the protocol contracts, as registered in the storage contract at one block.
///
/// The registry is resolved once per snapshot and passed explicitly to everything that needs to
/// address a contract, so all reads within a snapshot agree on which contracts they hit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ContractRegistry {
    pub storage: Address,
    pub node_manager: Address,
    pub node_distributor_factory: Address,
    pub node_staking: Address,
    pub node_deposit: Address,
    pub minipool_manager: Address,
    pub minipool_queue: Address,
    pub address_queue_storage: Address,
    pub token_reth: Address,
    pub token_rpl: Address,
    pub token_rpl_fixed_supply: Address,
}

impl ContractRegistry {
    /// Resolve every protocol contract address from the storage contract at `block`.
    #[instrument(skip(client))]
    pub async fn load(client: &impl ExecutionClient, storage: Address, block: u64) -> Result<Self> {
        let calls = ContractName::ALL
            .iter()
            .map(|name| {
                ContractCall::new(
                    storage,
                    &RocketStorage::getAddressCall::new((name.storage_key(),)),
                )
            })
            .collect::<Vec<_>>();
        let results = client
            .batch_call(&calls, block)
            .await
            .map_err(|err| err.context("loading contract addresses"))?;
        ensure!(
            results.len() == calls.len(),
            Error::decode_mismatch().context(format!(
                "expected {} contract addresses, got {}",
                calls.len(),
                results.len()
            ))
        );

        let mut registry = Self {
            storage,
            ..Default::default()
        };
        for (name, data) in ContractName::ALL.into_iter().zip(results) {
            let address = RocketStorage::getAddressCall::abi_decode_returns(&data)?;
            ensure!(
                !address.is_zero(),
                Error::decode_mismatch().context(format!(
                    "contract {} is not registered at block {block}",
                    name.as_str()
                ))
            );
            *registry.get_mut(name) = address;
        }
        tracing::debug!(?registry, "loaded contract registry");
        Ok(registry)
    }

    /// The address slot of a named contract.
    pub(super) fn get_mut(&mut self, name: ContractName) -> &mut Address {
        match name {
            ContractName::NodeManager => &mut self.node_manager,
            ContractName::NodeDistributorFactory => &mut self.node_distributor_factory,
            ContractName::NodeStaking => &mut self.node_staking,
            ContractName::NodeDeposit => &mut self.node_deposit,
            ContractName::MinipoolManager => &mut self.minipool_manager,
            ContractName::MinipoolQueue => &mut self.minipool_queue,
            ContractName::AddressQueueStorage => &mut self.address_queue_storage,
            ContractName::TokenReth => &mut self.token_reth,
            ContractName::TokenRpl => &mut self.token_rpl,
            ContractName::TokenRplFixedSupply => &mut self.token_rpl_fixed_supply,
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{error::ErrorKind, input::execution::testing::MockExecutionClient};

    #[test_log::test]
    fn test_storage_key() {
        assert_eq!(
            ContractName::NodeManager.storage_key(),
            keccak256(b"contract.addressrocketNodeManager")
        );
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_load_registry() {
        let storage = Address::with_last_byte(1);
        let client = MockExecutionClient::default();
        let expected = client.register_contracts(storage).await;

        let registry = ContractRegistry::load(&client, storage, 10).await.unwrap();
        assert_eq!(registry, expected);
        assert_eq!(client.batch_calls(), 1);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn test_load_registry_unregistered_contract() {
        let storage = Address::with_last_byte(1);
        let client = MockExecutionClient::default();
        client.register_contracts(storage).await;
        client
            .set_call(
                storage,
                RocketStorage::getAddressCall::new((ContractName::TokenRpl.storage_key(),)),
                Address::ZERO,
            )
            .await;

        let err = ContractRegistry::load(&client, storage, 10)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodeMismatch);
    }
}
