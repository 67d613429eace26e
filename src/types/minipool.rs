//! Types describing individual minipools.

use serde::{Deserialize, Serialize};

use super::common::{Address, U256};
use crate::{Error, Result};

/// Lifecycle status of a minipool, as stored by the minipool contract.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum MinipoolStatus {
    #[default]
    Initialised,
    Prelaunch,
    Staking,
    Withdrawable,
    Dissolved,
}

impl TryFrom<u8> for MinipoolStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Initialised,
            1 => Self::Prelaunch,
            2 => Self::Staking,
            3 => Self::Withdrawable,
            4 => Self::Dissolved,
            _ => {
                return Err(Error::decode_mismatch().context(format!("minipool status {value}")));
            }
        })
    }
}

/// The kind of deposit a minipool was created with.
///
/// This determines which partition of the deposit queue the minipool waits in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum MinipoolDeposit {
    #[default]
    None,
    Full,
    Half,
    Empty,
    Variable,
}

impl TryFrom<u8> for MinipoolDeposit {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::None,
            1 => Self::Full,
            2 => Self::Half,
            3 => Self::Empty,
            4 => Self::Variable,
            _ => {
                return Err(Error::decode_mismatch().context(format!("deposit type {value}")));
            }
        })
    }
}

impl From<MinipoolDeposit> for u8 {
    fn from(value: MinipoolDeposit) -> Self {
        match value {
            MinipoolDeposit::None => 0,
            MinipoolDeposit::Full => 1,
            MinipoolDeposit::Half => 2,
            MinipoolDeposit::Empty => 3,
            MinipoolDeposit::Variable => 4,
        }
    }
}

/// The state of a single minipool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MinipoolDetails {
    /// Address of the minipool contract.
    pub minipool_address: Address,

    /// The node operator owning this minipool.
    pub node_address: Address,

    pub status: MinipoolStatus,

    /// Whether the owner has finalised the minipool after withdrawal.
    pub finalised: bool,

    /// Commission charged by the node on the user portion of rewards, in `1e18` fixed point.
    pub node_fee: U256,

    pub deposit_type: MinipoolDeposit,
}

impl MinipoolDetails {
    /// Whether this minipool contributes to its node's average fee.
    pub fn is_fee_eligible(&self) -> bool {
        self.status == MinipoolStatus::Staking && !self.finalised
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test_log::test]
    fn test_status_decoding() {
        assert_eq!(
            MinipoolStatus::try_from(2).unwrap(),
            MinipoolStatus::Staking
        );
        assert_eq!(
            MinipoolStatus::try_from(9).unwrap_err().kind(),
            crate::error::ErrorKind::DecodeMismatch
        );
    }

    #[test_log::test]
    fn test_deposit_type_round_trip() {
        for ty in [
            MinipoolDeposit::None,
            MinipoolDeposit::Full,
            MinipoolDeposit::Half,
            MinipoolDeposit::Empty,
            MinipoolDeposit::Variable,
        ] {
            assert_eq!(MinipoolDeposit::try_from(u8::from(ty)).unwrap(), ty);
        }
    }

    #[test_log::test]
    fn test_fee_eligibility() {
        let mut mp = MinipoolDetails {
            status: MinipoolStatus::Staking,
            ..Default::default()
        };
        assert!(mp.is_fee_eligible());
        mp.finalised = true;
        assert!(!mp.is_fee_eligible());
        mp.finalised = false;
        mp.status = MinipoolStatus::Withdrawable;
        assert!(!mp.is_fee_eligible());
    }
}
