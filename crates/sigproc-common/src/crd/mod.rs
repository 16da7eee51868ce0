//! Custom Resource Definitions for signal processing
//!
//! `SignalRecord` is written by upstream ingestion; its status is owned
//! exclusively by the reconciler.

mod context;
mod signal;
mod types;

pub use context::{
    DeploymentDetails, DetectedLabels, KubernetesContext, NamespaceContext, OwnerChainEntry,
    PodDetails, ServiceDetails, StatefulSetDetails, DEGRADED_CONFIDENCE, FULL_CONFIDENCE,
    MINIMAL_CONFIDENCE, NAMESPACE_ONLY_CONFIDENCE,
};
pub use signal::{
    BusinessClassification, EnvironmentClassification, PriorityAssignment, SeverityClassification,
    SignalPhase, SignalRecord, SignalRecordSpec, SignalRecordStatus, TargetResource,
};
pub use types::{upsert_condition, Condition, ConditionStatus};
