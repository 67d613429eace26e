//! Mapping between execution layer time and beacon slots.

use tracing::instrument;

use crate::{
    Error, Result,
    input::{beacon::BeaconClient, execution::ExecutionClient},
    types::common::{BeaconBlock, BeaconConfig},
};

/// The beacon slot containing the latest execution layer block.
pub async fn head_slot(execution: &impl ExecutionClient, config: &BeaconConfig) -> Result<u64> {
    let header = execution
        .latest_block()
        .await
        .map_err(|err| err.context("reading latest execution block"))?;
    let slot = config.slot_at(header.timestamp);
    tracing::debug!(block = header.number, timestamp = header.timestamp, slot, "head slot");
    Ok(slot)
}

/// The most recent proposed block at or before `start`.
///
/// Slots are checked one at a time, walking backwards from `start`. At most `max_lookback` slots
/// are checked, and the walk never goes past slot 0.
#[instrument(skip(beacon))]
pub async fn latest_proposed_block(
    beacon: &impl BeaconClient,
    start: u64,
    max_lookback: u64,
) -> Result<BeaconBlock> {
    if max_lookback > 0 {
        let end = start.saturating_sub(max_lookback - 1);
        for slot in (end..=start).rev() {
            match beacon.beacon_block(slot).await? {
                Some(block) => {
                    if slot != start {
                        tracing::debug!(found = slot, "found proposed block after missed slots");
                    }
                    return Ok(block);
                }
                None => tracing::debug!(slot, "slot was missed, checking previous slot"),
            }
        }
    }
    tracing::warn!(start, max_lookback, "no proposed block within lookback window");
    Err(Error::upstream_unavailable().context(format!(
        "no proposed block in {max_lookback} slots at or before slot {start}"
    )))
}

/// The most recent proposed block in or before the last finalized epoch.
pub async fn latest_finalized_block(
    beacon: &impl BeaconClient,
    config: &BeaconConfig,
    max_lookback: u64,
) -> Result<BeaconBlock> {
    let head = beacon
        .beacon_head()
        .await
        .map_err(|err| err.context("reading beacon head"))?;
    let slot = config.last_slot_of_epoch(head.finalized_epoch);
    latest_proposed_block(beacon, slot, max_lookback).await
}
