pub mod error;
pub mod input;
pub mod metrics;
pub mod state;
pub mod types;

pub use error::{Error, Result};
