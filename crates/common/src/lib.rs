//! xboxtest Common Library
//!
//! Shared types and infrastructure for driving emulator instances: the error
//! taxonomy, bounded connect retries, process-wide port reservation and the
//! QMP control-channel client.

pub mod error;
pub mod ports;
pub mod qmp;
pub mod retry;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use ports::{PortRegistry, PortReservation};
pub use qmp::QmpClient;
pub use retry::RetryPolicy;
pub use types::*;

/// xboxtest version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
