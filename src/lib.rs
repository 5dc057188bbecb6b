pub mod audit;
pub mod config;
pub mod error;
pub mod export;
pub mod retention;
pub mod store;
pub mod telemetry;
pub mod workflow;

pub use error::{AuditError, ChainIntegrityError, Result};
