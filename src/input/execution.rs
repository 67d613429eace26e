//! Reading contract state from the execution layer.

use alloy::sol_types::SolCall;

use crate::{
    Result,
    types::common::{Address, Bytes, ElBlockHeader, TokenAmount},
};

pub mod contracts;
pub mod rpc;
pub mod testing;

pub use contracts::ContractRegistry;

/// A single read-only contract call.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContractCall {
    pub target: Address,
    pub calldata: Bytes,
}

impl ContractCall {
    /// Encode a typed call to the contract at `target`.
    pub fn new<C: SolCall>(target: Address, call: &C) -> Self {
        Self {
            target,
            calldata: call.abi_encode().into(),
        }
    }
}

/// Read access to contract state and balances at a chosen execution layer block.
pub trait ExecutionClient: Clone + Sync {
    /// The header of the latest execution layer block.
    fn latest_block(&self) -> impl Send + Future<Output = Result<ElBlockHeader>>;

    /// Execute a single call against the state at `block`, returning the raw return data.
    fn call(&self, call: &ContractCall, block: u64)
    -> impl Send + Future<Output = Result<Bytes>>;

    /// Execute many calls in one request against the state at `block`.
    ///
    /// The returned data is in the same order as `calls`. All calls observe the same block. If any
    /// call reverts, the whole request fails.
    fn batch_call(
        &self,
        calls: &[ContractCall],
        block: u64,
    ) -> impl Send + Future<Output = Result<Vec<Bytes>>>;

    /// The ETH balance of `address` at `block`.
    fn balance(
        &self,
        address: Address,
        block: u64,
    ) -> impl Send + Future<Output = Result<TokenAmount>>;

    /// The ETH balances of many addresses at `block`, in one request.
    fn bulk_balances(
        &self,
        addresses: &[Address],
        block: u64,
    ) -> impl Send + Future<Output = Result<Vec<TokenAmount>>>;
}

/// Make a single typed call and decode its return value.
pub async fn read<E, C>(client: &E, target: Address, call: C, block: u64) -> Result<C::Return>
where
    E: ExecutionClient,
    C: SolCall,
{
    let data = client
        .call(&ContractCall::new(target, &call), block)
        .await
        .map_err(|err| err.context(format!("calling {} on {target}", C::SIGNATURE)))?;
    C::abi_decode_returns(&data)
        .map_err(|err| crate::Error::from(err).context(format!("decoding {}", C::SIGNATURE)))
}
