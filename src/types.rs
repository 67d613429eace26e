//! Data types shared across the crate.

pub mod common;
pub mod minipool;
pub mod node;
pub mod state;
