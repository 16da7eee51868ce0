//! SignalRecord reconciliation
//!
//! Drives each record through Pending → Enriching → Classifying →
//! Categorizing → Completed, persisting one phase per reconcile and
//! emitting audit events for every persisted transition.

#![deny(missing_docs)]

pub mod audit;
pub mod controller;
pub mod status;

pub use audit::{
    AuditConfig, AuditEvent, AuditOutcome, AuditStore, AuditWriter, BufferedAuditStore,
    NoopAuditStore, TracingAuditWriter,
};
pub use controller::{error_policy, reconcile, run_controller, Context, ControllerSettings};
pub use status::{write_status, KubeSignalStore, SignalStore, WriteOutcome};
