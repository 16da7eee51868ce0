//! SignalRecord CRD types
//!
//! Defines `SignalRecord`, one observed alert/event driven through the
//! processing phases. The spec is owned by upstream ingestion and is treated
//! as read-only; the status is written one phase at a time by the reconciler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::context::KubernetesContext;
use super::types::Condition;
use crate::Error;

/// Target kinds that live outside any namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Node",
    "Namespace",
    "PersistentVolume",
    "StorageClass",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
];

// =============================================================================
// Phase
// =============================================================================

/// Processing phase of a SignalRecord
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SignalPhase {
    /// Record has been observed but not yet validated
    #[default]
    Pending,
    /// Kubernetes context is being gathered
    Enriching,
    /// Environment, severity and custom labels are being classified
    Classifying,
    /// Priority and business classification are being assigned
    Categorizing,
    /// Processing finished (possibly degraded)
    Completed,
    /// Processing stopped on a non-retryable error
    Failed,
}

impl SignalPhase {
    /// Whether the phase is terminal (no further transitions)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position in the pipeline; terminal phases rank highest
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Enriching => 1,
            Self::Classifying => 2,
            Self::Categorizing => 3,
            Self::Completed | Self::Failed => 4,
        }
    }

    /// Lowercase label value for metrics and audit records
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Enriching => "enriching",
            Self::Classifying => "classifying",
            Self::Categorizing => "categorizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SignalPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Enriching => write!(f, "Enriching"),
            Self::Classifying => write!(f, "Classifying"),
            Self::Categorizing => write!(f, "Categorizing"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Spec
// =============================================================================

/// Reference to the Kubernetes object an alert is about
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetResource {
    /// Object kind (Pod, Deployment, StatefulSet, Service, Node, ...)
    pub kind: String,
    /// Object name
    pub name: String,
    /// Object namespace; empty for cluster-scoped kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl TargetResource {
    /// Whether this kind is namespaced
    pub fn is_namespaced(&self) -> bool {
        !CLUSTER_SCOPED_KINDS.contains(&self.kind.as_str())
    }
}

impl std::fmt::Display for TargetResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// An observed alert/event awaiting enrichment and classification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubernaut.ai",
    version = "v1alpha1",
    kind = "SignalRecord",
    plural = "signalrecords",
    shortname = "sigrec",
    namespaced,
    status = "SignalRecordStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Severity","type":"string","jsonPath":".status.severity.severity"}"#,
    printcolumn = r#"{"name":"Priority","type":"string","jsonPath":".status.priorityAssignment.priority"}"#,
    printcolumn = r#"{"name":"Environment","type":"string","jsonPath":".status.environmentClassification.environment"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SignalRecordSpec {
    /// Content hash identifying the originating signal (immutable)
    pub fingerprint: String,

    /// Human-readable alert name
    pub name: String,

    /// Raw severity as reported by the source system
    pub severity: String,

    /// Signal type (e.g., "prometheus-alert", "kubernetes-event")
    pub signal_type: String,

    /// Monitoring system that emitted the signal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// The resource the signal is about
    pub target_resource: TargetResource,

    /// When upstream ingestion received the signal
    pub received_time: DateTime<Utc>,

    /// Free-form labels from the source alert
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Free-form annotations from the source alert
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl SignalRecordSpec {
    /// Validate input before any enrichment is attempted
    ///
    /// `signal` is the record name, used for error context only.
    pub fn validate(&self, signal: &str) -> Result<(), Error> {
        if self.fingerprint.trim().is_empty() {
            return Err(Error::validation_for_field(
                signal,
                "spec.fingerprint",
                "fingerprint must not be empty",
            ));
        }
        if self.severity.trim().is_empty() {
            return Err(Error::validation_for_field(
                signal,
                "spec.severity",
                "severity must not be empty",
            ));
        }
        if self.target_resource.kind.trim().is_empty() {
            return Err(Error::validation_for_field(
                signal,
                "spec.targetResource.kind",
                "target resource kind must not be empty",
            ));
        }
        if self.target_resource.name.trim().is_empty() {
            return Err(Error::validation_for_field(
                signal,
                "spec.targetResource.name",
                "target resource name must not be empty",
            ));
        }
        let has_namespace = self
            .target_resource
            .namespace
            .as_deref()
            .is_some_and(|ns| !ns.trim().is_empty());
        if self.target_resource.is_namespaced() && !has_namespace {
            return Err(Error::validation_for_field(
                signal,
                "spec.targetResource.namespace",
                format!(
                    "namespace is required for namespaced kind {}",
                    self.target_resource.kind
                ),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Classification results
// =============================================================================

/// Environment assigned to the signal's namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentClassification {
    /// Environment name (production, staging, development, unknown, ...)
    pub environment: String,
    /// Confidence in the assignment, 0.0 to 1.0
    pub confidence: f64,
    /// Where the decision came from (namespace-labels, configmap, default, fallback)
    pub source: String,
    /// When the classification was made
    pub classified_at: DateTime<Utc>,
}

/// Priority tier assigned to the signal
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriorityAssignment {
    /// Priority tier, P0 (most urgent) to P3
    pub priority: String,
    /// Confidence in the assignment, 0.0 to 1.0
    pub confidence: f64,
    /// Where the decision came from
    pub source: String,
    /// When the priority was assigned
    pub assigned_at: DateTime<Utc>,
}

/// Business ownership of the signal's workload
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BusinessClassification {
    /// Owning business unit
    pub business_unit: String,
    /// Owning team or individual
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_owner: Option<String>,
    /// Business criticality (critical, high, medium, low)
    pub criticality: String,
    /// SLA tier, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla_requirement: Option<String>,
    /// Confidence in the classification, 0.0 to 1.0
    pub confidence: f64,
    /// Where the decision came from
    pub source: String,
}

/// Severity normalized onto critical/high/medium/low
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeverityClassification {
    /// Normalized severity
    pub severity: String,
    /// Raw value from the source system
    pub original_severity: String,
    /// Where the mapping came from
    pub source: String,
}

// =============================================================================
// Status
// =============================================================================

/// Processing status, owned exclusively by the reconciler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalRecordStatus {
    /// Current processing phase
    #[serde(default)]
    pub phase: SignalPhase,

    /// Spec generation this status was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// When processing left Pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Set once, on entering Completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Gathered Kubernetes context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_context: Option<KubernetesContext>,

    /// Environment classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_classification: Option<EnvironmentClassification>,

    /// Priority assignment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_assignment: Option<PriorityAssignment>,

    /// Business classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_classification: Option<BusinessClassification>,

    /// Normalized severity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<SeverityClassification>,

    /// Version of the policy that produced each decision, keyed by policy name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub policy_versions: BTreeMap<String, String>,

    /// One condition per completed stage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Terminal failure reason; only set in Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SignalRecordStatus {
    /// Fresh status at the start of a processing pass
    pub fn pending(generation: Option<i64>) -> Self {
        Self {
            observed_generation: generation,
            ..Default::default()
        }
    }
}
