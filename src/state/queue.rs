//! Positions in the minipool deposit queue.
//!
//! The queue is made of three partitions, one per deposit type. Deposits are assigned to
//! minipools in the half partition first, then the full partition, then the empty partition, so a
//! minipool's overall position is its position within its own partition plus the lengths of every
//! partition drained before it.

use alloy::{primitives::keccak256, sol_types::SolCall};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result,
    input::execution::{
        ContractRegistry, ExecutionClient,
        contracts::{AddressQueueStorage, RocketMinipool, RocketMinipoolQueue},
        read,
    },
    types::{
        common::{Address, B256, TokenAmount, U256},
        minipool::MinipoolDeposit,
    },
};

/// One partition of the deposit queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum QueuePartition {
    Half,
    Full,
    Empty,
}

impl QueuePartition {
    /// Partitions in the order deposits are assigned to them.
    pub const DRAIN_ORDER: [Self; 3] = [Self::Half, Self::Full, Self::Empty];

    /// The partition to look for a minipool with the given deposit type in.
    ///
    /// Variable deposits are never queued, but are looked up in the empty partition like any other
    /// type that is neither half nor full, so they resolve to "not queued". A minipool without a
    /// deposit type is an error.
    pub fn of(deposit_type: MinipoolDeposit) -> Result<Self> {
        match deposit_type {
            MinipoolDeposit::Half => Ok(Self::Half),
            MinipoolDeposit::Full => Ok(Self::Full),
            MinipoolDeposit::Empty | MinipoolDeposit::Variable => Ok(Self::Empty),
            MinipoolDeposit::None => {
                Err(Error::decode_mismatch().context("minipool has no deposit type"))
            }
        }
    }

    pub fn deposit_type(self) -> MinipoolDeposit {
        match self {
            Self::Half => MinipoolDeposit::Half,
            Self::Full => MinipoolDeposit::Full,
            Self::Empty => MinipoolDeposit::Empty,
        }
    }

    /// The key of this partition in the address queue storage contract.
    pub fn storage_key(self) -> B256 {
        let name = match self {
            Self::Half => "minipools.available.half",
            Self::Full => "minipools.available.full",
            Self::Empty => "minipools.available.empty",
        };
        keccak256(name)
    }
}

/// Lengths of each queue partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueueLengths {
    pub half: u64,
    pub full: u64,
    pub empty: u64,
}

impl QueueLengths {
    pub fn get(&self, partition: QueuePartition) -> u64 {
        match partition {
            QueuePartition::Half => self.half,
            QueuePartition::Full => self.full,
            QueuePartition::Empty => self.empty,
        }
    }

    pub fn total(&self) -> u64 {
        self.half
            .saturating_add(self.full)
            .saturating_add(self.empty)
    }
}

/// Ether the deposit queue can absorb.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueueCapacity {
    /// Capacity of every queued minipool together.
    pub total: TokenAmount,

    /// Capacity counted towards node demand.
    pub effective: TokenAmount,

    /// Capacity of the minipool at the front of the queue.
    pub next_minipool: TokenAmount,
}

/// Lengths and capacity of the deposit queue at one block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueueStatus {
    pub lengths: QueueLengths,
    pub capacity: QueueCapacity,
}

/// Read access to the deposit queue.
pub trait QueueSource: Sync {
    /// The number of minipools in one partition.
    fn length(&self, partition: QueuePartition) -> impl Send + Future<Output = Result<u64>>;

    /// The number of minipools in the whole queue.
    fn total_length(&self) -> impl Send + Future<Output = Result<u64>>;

    /// The 1-indexed position of `minipool` within `partition`, or 0 if it is not in `partition`.
    fn index_of(
        &self,
        partition: QueuePartition,
        minipool: Address,
    ) -> impl Send + Future<Output = Result<u64>>;

    /// The minipool at the 0-indexed position `index` within `partition`.
    fn item_at(
        &self,
        partition: QueuePartition,
        index: u64,
    ) -> impl Send + Future<Output = Result<Address>>;

    /// The deposit type `minipool` was created with.
    fn deposit_type(&self, minipool: Address)
    -> impl Send + Future<Output = Result<MinipoolDeposit>>;
}

/// The lengths of all partitions.
pub async fn queue_lengths(source: &impl QueueSource) -> Result<QueueLengths> {
    let (half, full, empty) = futures::try_join!(
        source.length(QueuePartition::Half),
        source.length(QueuePartition::Full),
        source.length(QueuePartition::Empty),
    )?;
    Ok(QueueLengths { half, full, empty })
}

/// The 1-indexed position of `minipool` in the whole queue, or 0 if it is not queued.
pub async fn position_of(source: &impl QueueSource, minipool: Address) -> Result<u64> {
    let partition = QueuePartition::of(source.deposit_type(minipool).await?)
        .map_err(|err| err.context(format!("minipool {minipool}")))?;
    let index = source.index_of(partition, minipool).await?;
    if index == 0 {
        return Ok(0);
    }

    let ahead = QueuePartition::DRAIN_ORDER
        .into_iter()
        .take_while(|p| *p != partition)
        .map(|p| source.length(p));
    try_join_all(ahead)
        .await?
        .into_iter()
        .try_fold(index, u64::checked_add)
        .ok_or_else(|| {
            Error::decode_mismatch().context(format!("queue position of {minipool} overflows"))
        })
}

/// The minipool at the 0-indexed `position` in the whole queue.
pub async fn minipool_at_position(source: &impl QueueSource, position: u64) -> Result<Address> {
    let total = source.total_length().await?;
    if position >= total {
        return Err(Error::out_of_range().context(format!(
            "queue position {position} is beyond queue length {total}"
        )));
    }

    let lengths = queue_lengths(source).await?;
    let mut offset = position;
    for partition in QueuePartition::DRAIN_ORDER {
        let len = lengths.get(partition);
        if offset < len {
            return source.item_at(partition, offset).await;
        }
        offset -= len;
    }
    Err(Error::out_of_range().context(format!(
        "queue position {position} is beyond partition lengths {lengths:?}"
    )))
}

/// A [`QueueSource`] reading the queue contracts at a fixed block.
#[derive(Clone, Copy, Debug)]
pub struct ContractQueueSource<'a, E> {
    client: &'a E,
    contracts: &'a ContractRegistry,
    block: u64,
}

impl<'a, E: ExecutionClient> ContractQueueSource<'a, E> {
    pub fn new(client: &'a E, contracts: &'a ContractRegistry, block: u64) -> Self {
        Self {
            client,
            contracts,
            block,
        }
    }
}

impl<E: ExecutionClient> ContractQueueSource<'_, E> {
    pub async fn capacity(&self) -> Result<QueueCapacity> {
        let queue = self.contracts.minipool_queue;
        let (total, effective, next_minipool) = futures::try_join!(
            read(
                self.client,
                queue,
                RocketMinipoolQueue::getTotalCapacityCall::new(()),
                self.block
            ),
            read(
                self.client,
                queue,
                RocketMinipoolQueue::getEffectiveCapacityCall::new(()),
                self.block
            ),
            read(
                self.client,
                queue,
                RocketMinipoolQueue::getNextCapacityCall::new(()),
                self.block
            ),
        )?;
        Ok(QueueCapacity {
            total,
            effective,
            next_minipool,
        })
    }

    /// Lengths of every partition together with the queue's capacity.
    pub async fn status(&self) -> Result<QueueStatus> {
        let (lengths, capacity) = futures::try_join!(queue_lengths(self), self.capacity())?;
        Ok(QueueStatus { lengths, capacity })
    }
}

impl<E: ExecutionClient> QueueSource for ContractQueueSource<'_, E> {
    async fn length(&self, partition: QueuePartition) -> Result<u64> {
        let len = read(
            self.client,
            self.contracts.minipool_queue,
            RocketMinipoolQueue::getLengthCall::new((u8::from(partition.deposit_type()),)),
            self.block,
        )
        .await?;
        Ok(len.saturating_to())
    }

    async fn total_length(&self) -> Result<u64> {
        let len = read(
            self.client,
            self.contracts.minipool_queue,
            RocketMinipoolQueue::getTotalLengthCall::new(()),
            self.block,
        )
        .await?;
        Ok(len.saturating_to())
    }

    async fn index_of(&self, partition: QueuePartition, minipool: Address) -> Result<u64> {
        let index = read(
            self.client,
            self.contracts.address_queue_storage,
            AddressQueueStorage::getIndexOfCall::new((partition.storage_key(), minipool)),
            self.block,
        )
        .await?;
        // The storage contract reports -1 for absent items.
        if index.is_negative() {
            return Ok(0);
        }
        Ok(index.into_raw().saturating_to::<u64>().saturating_add(1))
    }

    async fn item_at(&self, partition: QueuePartition, index: u64) -> Result<Address> {
        read(
            self.client,
            self.contracts.address_queue_storage,
            AddressQueueStorage::getItemCall::new((partition.storage_key(), U256::from(index))),
            self.block,
        )
        .await
    }

    async fn deposit_type(&self, minipool: Address) -> Result<MinipoolDeposit> {
        let ty = read(
            self.client,
            minipool,
            RocketMinipool::getDepositTypeCall::new(()),
            self.block,
        )
        .await?;
        MinipoolDeposit::try_from(ty)
    }
}
