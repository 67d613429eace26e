//! Execution client backed by a JSON-RPC endpoint.

use alloy::{
    eips::BlockId,
    network::TransactionBuilder,
    providers::{Provider, RootProvider},
    rpc::{client::RpcClient, types::TransactionRequest},
};
use clap::Parser;
use reqwest::Url;

use super::{
    ContractCall, ExecutionClient,
    contracts::{BalanceBatcher, IMulticall3},
};
use crate::{
    Error, Result,
    error::ensure,
    types::common::{Address, Bytes, ElBlockHeader, TokenAmount},
};

/// The canonical Multicall3 deployment, present at the same address on most EVM chains.
pub const MULTICALL3_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

/// Configuration for an execution layer client.
#[derive(Clone, Debug, Parser)]
pub struct ExecutionOptions {
    /// JSON-RPC endpoint of an execution layer client.
    #[clap(long, env = "STAKING_STATE_EL_URL")]
    pub el_url: Url,

    /// Address of the protocol storage contract, through which every other contract is found.
    #[clap(long, env = "STAKING_STATE_STORAGE_ADDRESS")]
    pub storage_address: Address,

    /// Address of a Multicall3 contract, used to batch contract reads.
    #[clap(long, env = "STAKING_STATE_MULTICALL_ADDRESS", default_value = MULTICALL3_ADDRESS)]
    pub multicall_address: Address,

    /// Address of the balance batcher contract, used to read many ETH balances at once.
    #[clap(long, env = "STAKING_STATE_BALANCE_BATCHER_ADDRESS")]
    pub balance_batcher_address: Address,
}

/// An [`ExecutionClient`] which talks to a single JSON-RPC endpoint.
///
/// Every batch of calls is encoded into its own Multicall3 request, so concurrent batches share
/// nothing but the underlying HTTP connection pool.
#[derive(Clone, Debug)]
pub struct RpcExecutionClient {
    provider: RootProvider,
    multicall: Address,
    balance_batcher: Address,
}

impl RpcExecutionClient {
    pub fn new(opt: &ExecutionOptions) -> Self {
        let provider = RootProvider::new(RpcClient::new_http(opt.el_url.clone()));
        Self {
            provider,
            multicall: opt.multicall_address,
            balance_batcher: opt.balance_batcher_address,
        }
    }
}

impl ExecutionClient for RpcExecutionClient {
    async fn latest_block(&self) -> Result<ElBlockHeader> {
        let block = self
            .provider
            .get_block(BlockId::latest())
            .await
            .map_err(|err| {
                Error::upstream_unavailable().context(format!("failed to fetch latest block: {err}"))
            })?
            .ok_or_else(|| Error::upstream_unavailable().context("latest block not found"))?;
        Ok(ElBlockHeader {
            number: block.header.number,
            timestamp: block.header.timestamp,
        })
    }

    async fn call(&self, call: &ContractCall, block: u64) -> Result<Bytes> {
        let tx = TransactionRequest::default()
            .with_to(call.target)
            .with_input(call.calldata.clone());
        Ok(self.provider.call(tx).block(BlockId::number(block)).await?)
    }

    async fn batch_call(&self, calls: &[ContractCall], block: u64) -> Result<Vec<Bytes>> {
        let multicall = IMulticall3::new(self.multicall, &self.provider);
        let request = calls
            .iter()
            .map(|call| IMulticall3::Call3 {
                target: call.target,
                allowFailure: false,
                callData: call.calldata.clone(),
            })
            .collect();
        let results = multicall
            .aggregate3(request)
            .block(BlockId::number(block))
            .call()
            .await?;
        ensure!(
            results.len() == calls.len(),
            Error::decode_mismatch().context(format!(
                "multicall returned {} results for {} calls",
                results.len(),
                calls.len()
            ))
        );

        results
            .into_iter()
            .zip(calls)
            .map(|(res, call)| {
                ensure!(
                    res.success,
                    Error::upstream_unavailable().context(format!("call to {} reverted", call.target))
                );
                Ok(res.returnData)
            })
            .collect()
    }

    async fn balance(&self, address: Address, block: u64) -> Result<TokenAmount> {
        Ok(self
            .provider
            .get_balance(address)
            .block_id(BlockId::number(block))
            .await?)
    }

    async fn bulk_balances(&self, addresses: &[Address], block: u64) -> Result<Vec<TokenAmount>> {
        let batcher = BalanceBatcher::new(self.balance_batcher, &self.provider);
        // The zero token address means ETH.
        let balances = batcher
            .balances(addresses.to_vec(), vec![Address::ZERO])
            .block(BlockId::number(block))
            .call()
            .await?;
        ensure!(
            balances.len() == addresses.len(),
            Error::decode_mismatch().context(format!(
                "balance batcher returned {} balances for {} addresses",
                balances.len(),
                addresses.len()
            ))
        );
        Ok(balances)
    }
}
