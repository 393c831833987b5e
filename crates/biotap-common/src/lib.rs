pub mod config;
pub mod error;
pub mod types;

pub use error::{BoxError, Error, ProbeFailure, Result};
pub use types::*;
