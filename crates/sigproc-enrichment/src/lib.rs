//! Kubernetes context enrichment for signal records
//!
//! Everything in this crate is best-effort: API failures degrade the
//! gathered context instead of surfacing as errors, and every call runs
//! under a deadline.

#![deny(missing_docs)]

pub mod client;
pub mod detection;
pub mod enricher;
pub mod owner_chain;
pub mod selector;

pub use client::{ClusterReader, KubeClusterReader, DEFAULT_CALL_TIMEOUT};
pub use detection::FeatureDetector;
pub use enricher::Enricher;
pub use owner_chain::OwnerChainBuilder;
pub use selector::selector_matches;
