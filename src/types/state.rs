//! The network state snapshot.

use serde::{Deserialize, Serialize};

use super::{
    common::{Address, BeaconConfig, TokenAmount},
    minipool::MinipoolDetails,
    node::NodeDetails,
};

/// The state of the staking protocol as of one execution layer block and the beacon slot that
/// carried it.
///
/// A snapshot is never updated in place. To observe newer state, request a new snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetworkState {
    /// The execution layer block all contract reads were made against.
    pub el_block_number: u64,

    /// The beacon slot whose block carried `el_block_number`.
    pub beacon_slot_number: u64,

    pub beacon_config: BeaconConfig,

    /// Effective RPL stake summed over every node in the network, read at `el_block_number`.
    ///
    /// This covers the whole network even when the snapshot was taken for a single node.
    pub total_effective_rpl_stake: TokenAmount,

    /// Node operators, in registry order.
    ///
    /// For a snapshot taken for a single node, this contains exactly that node.
    pub nodes: Vec<NodeDetails>,

    /// Minipools, in registry order, or the minipools of the single node.
    pub minipools: Vec<MinipoolDetails>,
}

impl NetworkState {
    /// Look up a node by address.
    pub fn node(&self, address: Address) -> Option<&NodeDetails> {
        self.nodes.iter().find(|node| node.node_address == address)
    }

    /// The minipools owned by the given node.
    pub fn minipools_of(&self, node: Address) -> impl Iterator<Item = &MinipoolDetails> {
        self.minipools
            .iter()
            .filter(move |mp| mp.node_address == node)
    }
}
