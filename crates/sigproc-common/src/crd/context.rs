//! Kubernetes context snapshot stored in SignalRecord status

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Confidence reported when the target and its namespace were resolved
pub const FULL_CONFIDENCE: f64 = 0.9;

/// Confidence reported when only namespace context could be gathered for a kind
/// that has no detail block
pub const NAMESPACE_ONLY_CONFIDENCE: f64 = 0.8;

/// Confidence reported when the target is missing but its namespace resolved
pub const DEGRADED_CONFIDENCE: f64 = 0.5;

/// Confidence reported when neither the target nor its namespace resolved
pub const MINIMAL_CONFIDENCE: f64 = 0.3;

/// Context gathered about the signal's target resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesContext {
    /// Namespace labels/annotations snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<NamespaceContext>,

    /// Present when the target is a Pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodDetails>,

    /// Present when the target is a Deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentDetails>,

    /// Present when the target is a StatefulSet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_set: Option<StatefulSetDetails>,

    /// Present when the target is a Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceDetails>,

    /// Ancestry from owner references, immediate owner first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_chain: Vec<OwnerChainEntry>,

    /// Operational features detected around the target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_labels: Option<DetectedLabels>,

    /// Labels extracted by the custom-label policy
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_labels: BTreeMap<String, Vec<String>>,

    /// Set when the context is incomplete
    #[serde(default)]
    pub degraded_mode: bool,

    /// Confidence in the gathered context, 0.0 to 1.0
    #[serde(default)]
    pub confidence: f64,
}

impl KubernetesContext {
    /// Namespace name, if the namespace resolved
    pub fn namespace_name(&self) -> Option<&str> {
        self.namespace.as_ref().map(|ns| ns.name.as_str())
    }

    /// Labels of the workload the signal is about (pod, deployment, statefulset or service)
    pub fn workload_labels(&self) -> Option<&BTreeMap<String, String>> {
        if let Some(pod) = &self.pod {
            return Some(&pod.labels);
        }
        if let Some(d) = &self.deployment {
            return Some(&d.labels);
        }
        if let Some(s) = &self.stateful_set {
            return Some(&s.labels);
        }
        self.service.as_ref().map(|s| &s.labels)
    }

    /// Labels that pods of the target carry
    ///
    /// For pods this is the pod's own labels; for Deployments and StatefulSets
    /// it is the pod template labels.
    pub fn pod_labels(&self) -> Option<&BTreeMap<String, String>> {
        if let Some(pod) = &self.pod {
            return Some(&pod.labels);
        }
        if let Some(d) = &self.deployment {
            return Some(&d.pod_template_labels);
        }
        self.stateful_set.as_ref().map(|s| &s.pod_template_labels)
    }
}

/// Namespace metadata snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceContext {
    /// Namespace name
    pub name: String,
    /// Namespace labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Namespace annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Pod detail block
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodDetails {
    /// Pod labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Pod annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Pod phase (Running, Pending, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Node the pod is scheduled on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Service account the pod runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Sum of container restart counts
    #[serde(default)]
    pub restart_count: i32,
}

/// Deployment detail block
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDetails {
    /// Deployment labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Deployment annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Labels on the pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_template_labels: BTreeMap<String, String>,
    /// Desired replicas
    #[serde(default)]
    pub replicas: i32,
    /// Available replicas
    #[serde(default)]
    pub available_replicas: i32,
    /// Ready replicas
    #[serde(default)]
    pub ready_replicas: i32,
}

/// StatefulSet detail block
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatefulSetDetails {
    /// StatefulSet labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// StatefulSet annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Labels on the pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_template_labels: BTreeMap<String, String>,
    /// Desired replicas
    #[serde(default)]
    pub replicas: i32,
    /// Ready replicas
    #[serde(default)]
    pub ready_replicas: i32,
}

/// Service detail block
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDetails {
    /// Service labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Service annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Service type (ClusterIP, NodePort, LoadBalancer, ExternalName)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    /// Cluster IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    /// Pod selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
    /// Exposed ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<i32>,
}

/// One step of the owner-reference ancestry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerChainEntry {
    /// Owner kind
    pub kind: String,
    /// Owner name
    pub name: String,
    /// Owner UID
    pub uid: String,
}

/// Operational features detected around the target
///
/// `false` with the detection listed in `failed_detections` means the
/// detection could not run; `false` without it means the feature is absent.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DetectedLabels {
    /// A PodDisruptionBudget selects the target's pods
    #[serde(rename = "hasPDB", default)]
    pub has_pdb: bool,
    /// A HorizontalPodAutoscaler scales the target or an ancestor
    #[serde(rename = "hasHPA", default)]
    pub has_hpa: bool,
    /// The namespace has at least one NetworkPolicy
    #[serde(default)]
    pub network_isolated: bool,
    /// The namespace or workload is managed by a GitOps tool
    #[serde(default)]
    pub git_ops_managed: bool,
    /// Which GitOps tool (flux, argocd)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ops_tool: Option<String>,
    /// The target is (or is owned by) a StatefulSet
    #[serde(default)]
    pub stateful: bool,
    /// The workload carries Helm release markers
    #[serde(default)]
    pub helm_managed: bool,
    /// Detections that errored (pdb, hpa, networkPolicy, gitOps)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_detections: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detected_labels_wire_names() {
        let labels = DetectedLabels {
            has_pdb: true,
            has_hpa: true,
            failed_detections: vec!["networkPolicy".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_value(&labels).unwrap();
        assert_eq!(json["hasPDB"], true);
        assert_eq!(json["hasHPA"], true);
        assert_eq!(json["gitOpsManaged"], false);
        assert_eq!(json["failedDetections"][0], "networkPolicy");
    }

    #[test]
    fn test_pod_labels_prefer_pod_template_for_workloads() {
        let mut template = BTreeMap::new();
        template.insert("app".to_string(), "web".to_string());
        let ctx = KubernetesContext {
            deployment: Some(DeploymentDetails {
                pod_template_labels: template.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(ctx.pod_labels(), Some(&template));
        assert_eq!(ctx.workload_labels(), Some(&BTreeMap::new()));
    }

    #[test]
    fn test_namespace_name() {
        let ctx = KubernetesContext {
            namespace: Some(NamespaceContext {
                name: "payments".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(ctx.namespace_name(), Some("payments"));
        assert_eq!(KubernetesContext::default().namespace_name(), None);
    }
}
