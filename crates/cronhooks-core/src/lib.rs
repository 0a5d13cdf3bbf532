//! `cronhooks-core` - ids, configuration and errors shared by every CronHooks crate.

pub mod config;
pub mod error;
pub mod types;

pub use error::{CoreError, Result};
pub use types::JobId;
