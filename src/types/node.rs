//! Node operator records and the arithmetic derived from them.

use serde::{Deserialize, Serialize};

use super::{
    common::{Address, CALC_BASE, Timestamp, TokenAmount, U256},
    minipool::MinipoolDetails,
};
use crate::{Error, Result, error::ensure};

/// Complete details for a node operator, as of a single execution layer block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeDetails {
    pub exists: bool,
    pub registration_time: U256,
    pub timezone_location: String,
    pub fee_distributor_initialised: bool,
    pub fee_distributor_address: Address,
    pub reward_network: U256,
    pub rpl_stake: TokenAmount,

    /// RPL stake that counts towards rewards.
    ///
    /// After [`fix_effective_stake`](Self::fix_effective_stake), this is either zero or at least
    /// `minimum_rpl_stake`.
    pub effective_rpl_stake: TokenAmount,
    pub minimum_rpl_stake: TokenAmount,
    pub maximum_rpl_stake: TokenAmount,
    pub eth_matched: TokenAmount,
    pub eth_matched_limit: TokenAmount,
    pub minipool_count: U256,
    pub balance_eth: TokenAmount,
    pub balance_reth: TokenAmount,
    pub balance_rpl: TokenAmount,
    pub balance_old_rpl: TokenAmount,
    pub deposit_credit_balance: TokenAmount,
    pub withdrawal_address: Address,
    pub pending_withdrawal_address: Address,
    pub smoothing_pool_registration_state: bool,

    /// Time of the last smoothing pool opt-in or opt-out, or zero if the node never opted in.
    pub smoothing_pool_registration_changed: U256,
    pub node_address: Address,

    /// Ratio of total ETH to node-supplied ETH across the node's minipools, in `1e18` fixed point.
    pub collateralisation_ratio: U256,

    /// ETH held by the node's fee distributor contract.
    pub distributor_balance: TokenAmount,

    /// Mean fee over the node's fee-eligible minipools.
    ///
    /// Zero until [`calculate_average_fee_and_distributor_shares`] has run.
    ///
    /// [`calculate_average_fee_and_distributor_shares`]: Self::calculate_average_fee_and_distributor_shares
    pub average_node_fee: U256,

    /// Portion of `distributor_balance` owed to pool stakers. Zero until the shares are computed.
    pub distributor_balance_user_eth: TokenAmount,

    /// Portion of `distributor_balance` owed to the node operator. Zero until the shares are
    /// computed.
    pub distributor_balance_node_eth: TokenAmount,
}

/// Whether a node qualifies for bonuses in an interval, and the part of the interval it qualifies
/// for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BonusEligibility {
    pub eligible: bool,
    pub start: Timestamp,
    pub end: Timestamp,
}

/// The division of a fee distributor balance between the node operator and pool stakers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DistributorShares {
    pub node: TokenAmount,
    pub user: TokenAmount,
}

impl NodeDetails {
    /// An empty record for the node at `address`, ready to be populated.
    pub fn new(node_address: Address) -> Self {
        Self {
            node_address,
            ..Default::default()
        }
    }

    /// Zero out an effective stake which is below the minimum stake.
    ///
    /// The staking contract can report a nonzero effective stake under the minimum, which must be
    /// treated as no effective stake at all.
    pub fn fix_effective_stake(&mut self) {
        if self.effective_rpl_stake < self.minimum_rpl_stake {
            self.effective_rpl_stake = U256::ZERO;
        }
    }

    /// The time of the last smoothing pool registration change.
    pub fn registration_changed_time(&self) -> Timestamp {
        self.smoothing_pool_registration_changed.saturating_to()
    }

    /// Determine whether the node is eligible for bonuses during `[start, end)`, and the window of
    /// its eligibility.
    pub fn bonus_eligibility(&self, start: Timestamp, end: Timestamp) -> BonusEligibility {
        let changed = self.registration_changed_time();

        // Nodes that never joined the smoothing pool are never eligible.
        if changed == 0 {
            return BonusEligibility::default();
        }

        if self.smoothing_pool_registration_state {
            BonusEligibility {
                eligible: changed < end,
                start: changed.max(start),
                end,
            }
        } else {
            // Opted out: eligible only for the part of the interval before the opt-out.
            BonusEligibility {
                eligible: changed < end,
                start: changed.max(start),
                end: changed.min(end),
            }
        }
    }

    /// Whether the node was in the smoothing pool at time `t`.
    pub fn was_opted_in_at(&self, t: Timestamp) -> bool {
        let changed = self.registration_changed_time();
        if self.smoothing_pool_registration_state {
            t > changed
        } else if changed == 0 {
            false
        } else {
            t < changed
        }
    }

    /// Compute the average fee of the node's minipools and split the distributor balance.
    ///
    /// `minipools` should be the minipools belonging to this node. Only staking, non-finalised
    /// minipools count towards the average fee.
    pub fn calculate_average_fee_and_distributor_shares<'a>(
        &mut self,
        minipools: impl IntoIterator<Item = &'a MinipoolDetails>,
    ) -> Result<()> {
        let mut total_fee = U256::ZERO;
        let mut eligible = 0u64;
        for mp in minipools {
            if mp.is_fee_eligible() {
                total_fee += mp.node_fee;
                eligible += 1;
            }
        }
        if eligible > 0 {
            self.average_node_fee = total_fee / U256::from(eligible);
        }

        let shares = split_distributor_balance(
            self.distributor_balance,
            self.collateralisation_ratio,
            (eligible > 0).then_some(self.average_node_fee),
        )
        .map_err(|err| err.context(format!("node {}", self.node_address)))?;
        self.distributor_balance_node_eth = shares.node;
        self.distributor_balance_user_eth = shares.user;
        Ok(())
    }
}

/// Split a distributor balance between the node and pool stakers.
///
/// The node first receives `balance / collateralisation_ratio`. If the node has fee-eligible
/// minipools, it additionally receives `average_fee` of the remaining user portion as commission,
/// and the users receive whatever is left. All divisions truncate, matching the on-chain
/// distributor, so the order of these steps must not change.
pub fn split_distributor_balance(
    balance: TokenAmount,
    collateralisation_ratio: U256,
    average_fee: Option<U256>,
) -> Result<DistributorShares> {
    if balance.is_zero() {
        return Ok(DistributorShares::default());
    }
    let base = U256::from(CALC_BASE);
    // A node can never hold more than all of its own validators' capital.
    ensure!(
        collateralisation_ratio >= base,
        Error::decode_mismatch().context(format!(
            "collateralisation ratio {collateralisation_ratio} below 1 with distributor balance \
             {balance}"
        ))
    );

    let node_balance = balance
        .checked_mul(base)
        .ok_or_else(|| Error::decode_mismatch().context(format!("balance {balance} overflows")))?
        / collateralisation_ratio;
    let user_balance = balance - node_balance;

    let Some(fee) = average_fee else {
        return Ok(DistributorShares {
            node: node_balance,
            user: user_balance,
        });
    };
    ensure!(
        fee <= base,
        Error::decode_mismatch().context(format!("average node fee {fee} above 100%"))
    );

    let commission = user_balance
        .checked_mul(fee)
        .ok_or_else(|| Error::decode_mismatch().context(format!("fee {fee} overflows")))?
        / base;
    let node = node_balance + commission;
    Ok(DistributorShares {
        node,
        user: balance - node,
    })
}
