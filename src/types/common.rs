//! Primitive types.

use serde::{Deserialize, Serialize};

pub use alloy::primitives::{Address, B256, Bytes, U256};

/// A Unix timestamp in seconds since epoch.
pub type Timestamp = u64;

/// An amount of ETH or an ERC-20 token in WEI.
pub type TokenAmount = U256;

/// The fixed-point base used by protocol ratios and fees: `1e18` represents 100%.
pub const CALC_BASE: u64 = 1_000_000_000_000_000_000;

/// Protocol-constant timing parameters of the beacon chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BeaconConfig {
    /// Unix time of slot 0.
    pub genesis_time: Timestamp,

    /// Duration of one slot.
    pub seconds_per_slot: u64,

    /// Number of slots in one epoch.
    pub slots_per_epoch: u64,
}

impl BeaconConfig {
    /// The slot containing the given execution layer timestamp.
    ///
    /// Timestamps before genesis map to slot 0.
    pub fn slot_at(&self, time: Timestamp) -> u64 {
        time.saturating_sub(self.genesis_time) / self.seconds_per_slot
    }

    /// The last slot of the given epoch.
    pub fn last_slot_of_epoch(&self, epoch: u64) -> u64 {
        epoch * self.slots_per_epoch + (self.slots_per_epoch - 1)
    }
}

/// Summary of the beacon chain head.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BeaconHead {
    /// The most recent finalized epoch.
    pub finalized_epoch: u64,
}

/// A proposed beacon block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BeaconBlock {
    /// The slot this block was proposed in.
    pub slot: u64,

    /// Validator index of the proposer.
    pub proposer_index: u64,

    /// The execution layer block carried by this beacon block, if any.
    ///
    /// This is [`None`] only for blocks from before the merge.
    pub execution_block_number: Option<u64>,
}

/// Minimal information about an execution layer block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ElBlockHeader {
    /// The block number.
    pub number: u64,

    /// The timestamp of this block.
    pub timestamp: Timestamp,
}
