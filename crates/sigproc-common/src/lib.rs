//! Common types for the signal processing controller: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for SignalRecord and the reserved label namespace
pub const API_GROUP: &str = "kubernaut.ai";

/// Namespace label carrying an explicit environment assignment
pub const ENVIRONMENT_LABEL: &str = "kubernaut.ai/environment";

/// Field manager / reporting component name used for status writes and events
pub const CONTROLLER_NAME: &str = "signalprocessing-controller";

/// Maximum number of owner-chain entries recorded for a target
pub const MAX_OWNER_CHAIN_DEPTH: usize = 5;
