//! External data sources: the execution layer (contract calls) and the beacon chain.

pub mod beacon;
pub mod execution;
