//! Rule evaluation engine for signal classification policies
//!
//! Policies are YAML decision tables whose conditions and computed outputs
//! are written in a small expression language over a JSON fact document.
//! A [`RuleEngine`] holds the active compiled [`Policy`], evaluates it on
//! the blocking pool under a deadline, and swaps in new versions from an
//! override file without a restart.

#![deny(missing_docs)]

mod engine;
pub mod error;
pub mod expr;
pub mod metrics;
mod policy;
pub mod sanitize;
mod watcher;

pub use engine::{RuleEngine, DEFAULT_EVALUATION_TIMEOUT};
pub use error::{PolicyError, Result};
pub use policy::{Decision, EvaluationMode, Policy, PolicySchema, PolicySource};
pub use sanitize::SanitizeReport;
pub use watcher::RELOAD_DEBOUNCE;
