//! Batched, bounded-concurrency lookups against a single block.

use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::Semaphore;

use crate::{
    Error, Result,
    error::ensure,
    input::execution::{ContractCall, ContractRegistry, ExecutionClient},
    metrics::PrometheusMetrics,
    types::common::{Address, TokenAmount},
};

/// Keys per batch when fetching many fields per key.
pub const NODE_BATCH_SIZE: usize = 100;

/// Keys per batch when fetching a single cheap field per key, such as resolving a registry index
/// to an address, or reading balances.
pub const ADDRESS_BATCH_SIZE: usize = 1000;

/// Keys per batch when fetching minipool details.
pub const MINIPOOL_BATCH_SIZE: usize = 100;

/// One field to look up for each key of a fetch.
///
/// Specs are plain function pointers, so field tables can be built as constants.
pub struct FieldSpec<K, R> {
    /// Name of the contract method, for error messages.
    pub method: &'static str,

    /// Build the call reading this field for `key`.
    pub call: fn(&ContractRegistry, &K) -> ContractCall,

    /// Decode the call's return data into the destination record.
    pub store: fn(&mut R, &[u8]) -> Result<()>,
}

impl<K, R> Clone for FieldSpec<K, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, R> Copy for FieldSpec<K, R> {}

impl<K, R> std::fmt::Debug for FieldSpec<K, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FieldSpec")
            .field("method", &self.method)
            .finish()
    }
}

/// Executes field lookups for many keys in batches.
///
/// Every batch holds a permit from a shared semaphore while it is in flight, so the number of
/// concurrent requests across all fetchers sharing the semaphore is bounded.
#[derive(Clone, Debug)]
pub struct BatchFetcher<E> {
    client: E,
    permits: Arc<Semaphore>,
    metrics: Option<PrometheusMetrics>,
}

impl<E: ExecutionClient> BatchFetcher<E> {
    pub fn new(client: E, permits: Arc<Semaphore>) -> Self {
        Self {
            client,
            permits,
            metrics: None,
        }
    }

    /// Count dispatched batches in `metrics`.
    pub fn with_metrics(mut self, metrics: PrometheusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn client(&self) -> &E {
        &self.client
    }

    /// Look up `fields` for every key in `keys` at `block`.
    ///
    /// The result has one record per key, in the same order as `keys`. Each record starts out as
    /// `init(key)` and is then populated with every field.
    ///
    /// If any batch fails, the whole fetch fails with a partial fetch failure, and the other batches
    /// are cancelled.
    pub async fn fetch<K, R>(
        &self,
        keys: &[K],
        init: impl Fn(&K) -> R,
        fields: &[FieldSpec<K, R>],
        contracts: &ContractRegistry,
        block: u64,
        batch_size: usize,
    ) -> Result<Vec<R>>
    where
        K: Sync,
        R: Send,
    {
        let mut records: Vec<R> = keys.iter().map(init).collect();
        if fields.is_empty() || keys.is_empty() {
            return Ok(records);
        }

        let batch_size = batch_size.max(1);
        let batches = records
            .chunks_mut(batch_size)
            .zip(keys.chunks(batch_size))
            .enumerate()
            .map(|(i, (records, keys))| {
                self.fetch_batch(i * batch_size, keys, records, fields, contracts, block)
            });
        try_join_all(batches)
            .await
            .map_err(|err| Error::partial_fetch_failure().context(err))?;
        Ok(records)
    }

    /// Look up `fields` for the keys of one batch, writing into the records the batch owns.
    async fn fetch_batch<K, R>(
        &self,
        offset: usize,
        keys: &[K],
        records: &mut [R],
        fields: &[FieldSpec<K, R>],
        contracts: &ContractRegistry,
        block: u64,
    ) -> Result<()> {
        let _permit = self.acquire().await?;

        let calls = keys
            .iter()
            .flat_map(|key| fields.iter().map(move |field| (field.call)(contracts, key)))
            .collect::<Vec<_>>();
        tracing::debug!(offset, keys = keys.len(), calls = calls.len(), block, "dispatching batch");
        self.count_batch();
        let results = self
            .client
            .batch_call(&calls, block)
            .await
            .map_err(|err| err.context(format!("batch at offset {offset}")))?;
        ensure!(
            results.len() == calls.len(),
            Error::decode_mismatch().context(format!(
                "batch at offset {offset} returned {} results for {} calls",
                results.len(),
                calls.len()
            ))
        );

        for (record, results) in records.iter_mut().zip(results.chunks(fields.len())) {
            for (field, data) in fields.iter().zip(results) {
                (field.store)(record, data)
                    .map_err(|err| err.context(format!("decoding {}", field.method)))?;
            }
        }
        Ok(())
    }

    /// Read the ETH balances of many addresses at `block`, in bulk requests.
    ///
    /// Like [`fetch`](Self::fetch), this fails as a whole if any request fails.
    pub async fn balances(&self, addresses: &[Address], block: u64) -> Result<Vec<TokenAmount>> {
        let batches = addresses
            .chunks(ADDRESS_BATCH_SIZE)
            .enumerate()
            .map(|(i, addresses)| async move {
                let _permit = self.acquire().await?;
                tracing::debug!(
                    offset = i * ADDRESS_BATCH_SIZE,
                    addresses = addresses.len(),
                    block,
                    "dispatching balance batch"
                );
                self.count_batch();
                let balances = self.client.bulk_balances(addresses, block).await?;
                ensure!(
                    balances.len() == addresses.len(),
                    Error::decode_mismatch().context(format!(
                        "got {} balances for {} addresses",
                        balances.len(),
                        addresses.len()
                    ))
                );
                Ok(balances)
            });
        let balances = try_join_all(batches)
            .await
            .map_err(|err| Error::partial_fetch_failure().context(err))?;
        Ok(balances.into_iter().flatten().collect())
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| Error::upstream_unavailable().context("request permits closed"))
    }

    fn count_batch(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.fetch_batches.inc();
        }
    }
}

/// Look up `fields` for a single key with direct calls, bypassing batching.
pub async fn fetch_direct<E, K, R>(
    client: &E,
    key: &K,
    record: &mut R,
    fields: &[FieldSpec<K, R>],
    contracts: &ContractRegistry,
    block: u64,
) -> Result<()>
where
    E: ExecutionClient,
{
    let results = try_join_all(fields.iter().map(|field| async move {
        let call = (field.call)(contracts, key);
        client
            .call(&call, block)
            .await
            .map_err(|err| err.context(format!("calling {} on {}", field.method, call.target)))
    }))
    .await?;
    for (field, data) in fields.iter().zip(results) {
        (field.store)(record, &data)
            .map_err(|err| err.context(format!("decoding {}", field.method)))?;
    }
    Ok(())
}
