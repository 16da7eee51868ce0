//! Detection of operational features around a target
//!
//! PDB, HPA and NetworkPolicy detection query the API concurrently; GitOps,
//! Helm and stateful detection read labels and annotations already present
//! in the gathered context. A detection that cannot run is listed in
//! `failedDetections` instead of reporting `false`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sigproc_common::crd::{DetectedLabels, KubernetesContext, OwnerChainEntry, TargetResource};
use sigproc_common::metrics::record_enrichment_error;
use sigproc_common::Error;
use tracing::{debug, warn};

use crate::client::{bounded, ClusterReader, DEFAULT_CALL_TIMEOUT};
use crate::selector::selector_matches;

/// `failedDetections` entry for PodDisruptionBudget detection
pub const PDB_DETECTION: &str = "pdb";
/// `failedDetections` entry for HorizontalPodAutoscaler detection
pub const HPA_DETECTION: &str = "hpa";
/// `failedDetections` entry for NetworkPolicy detection
pub const NETWORK_POLICY_DETECTION: &str = "networkPolicy";
/// `failedDetections` entry for GitOps detection
pub const GITOPS_DETECTION: &str = "gitOps";

/// GitOps tool reported for Flux markers
pub const FLUX: &str = "flux";
/// GitOps tool reported for Argo CD markers
pub const ARGOCD: &str = "argocd";

const FLUX_MARKERS: &[&str] = &[
    "kustomize.toolkit.fluxcd.io/name",
    "kustomize.toolkit.fluxcd.io/namespace",
    "helm.toolkit.fluxcd.io/name",
    "fluxcd.io/sync-checksum",
];

const ARGOCD_MARKERS: &[&str] = &[
    "argocd.argoproj.io/instance",
    "argocd.argoproj.io/managed-by",
    "argocd.argoproj.io/tracking-id",
    "argocd.argoproj.io/sync-wave",
];

/// Kinds whose pods a PodDisruptionBudget can select
const POD_CARRYING_KINDS: &[&str] = &["Pod", "Deployment", "StatefulSet", "ReplicaSet", "DaemonSet"];

const HELM_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const HELM_RELEASE_ANNOTATION: &str = "meta.helm.sh/release-name";

/// Runs the feature detections for one target
pub struct FeatureDetector {
    reader: Arc<dyn ClusterReader>,
    call_timeout: Duration,
}

impl FeatureDetector {
    /// Create a detector with the default per-call timeout
    pub fn new(reader: Arc<dyn ClusterReader>) -> Self {
        Self {
            reader,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the per-call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Detect features of `target` using the already gathered `context`
    ///
    /// `context` supplies pod labels, owner chain and namespace metadata.
    pub async fn detect(&self, target: &TargetResource, context: &KubernetesContext) -> DetectedLabels {
        let Some(namespace) = target.namespace.as_deref() else {
            // cluster-scoped targets have none of the namespaced features
            return DetectedLabels::default();
        };

        let (pdb, hpa, network) = tokio::join!(
            self.detect_pdb(namespace, target, context.pod_labels()),
            self.detect_hpa(namespace, target, &context.owner_chain),
            self.detect_network_policy(namespace),
        );
        let git_ops = detect_git_ops(context);

        let mut detected = DetectedLabels {
            stateful: is_stateful(target, &context.owner_chain),
            helm_managed: is_helm_managed(context),
            ..Default::default()
        };

        record(&mut detected, PDB_DETECTION, pdb, |d, v| d.has_pdb = v);
        record(&mut detected, HPA_DETECTION, hpa, |d, v| d.has_hpa = v);
        record(&mut detected, NETWORK_POLICY_DETECTION, network, |d, v| d.network_isolated = v);
        match git_ops {
            Some(tool) => {
                detected.git_ops_managed = tool.is_some();
                detected.git_ops_tool = tool.map(str::to_string);
            }
            None => detected.failed_detections.push(GITOPS_DETECTION.to_string()),
        }

        debug!(
            namespace,
            target = %target,
            has_pdb = detected.has_pdb,
            has_hpa = detected.has_hpa,
            network_isolated = detected.network_isolated,
            git_ops_managed = detected.git_ops_managed,
            failed = ?detected.failed_detections,
            "feature detection complete"
        );
        detected
    }

    async fn detect_pdb(
        &self,
        namespace: &str,
        target: &TargetResource,
        pod_labels: Option<&BTreeMap<String, String>>,
    ) -> Result<bool, Error> {
        let Some(labels) = pod_labels else {
            if POD_CARRYING_KINDS.contains(&target.kind.as_str()) {
                return Err(Error::not_found(target.kind.clone(), format!("pod labels of {target}")));
            }
            // nothing a budget could select
            return Ok(false);
        };
        let pdbs = bounded(self.call_timeout, "list pdbs", self.reader.list_pdbs(namespace)).await?;
        Ok(pdbs.iter().any(|pdb| {
            pdb.spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .is_some_and(|selector| selector_matches(selector, labels))
        }))
    }

    async fn detect_hpa(
        &self,
        namespace: &str,
        target: &TargetResource,
        owner_chain: &[OwnerChainEntry],
    ) -> Result<bool, Error> {
        let hpas = bounded(self.call_timeout, "list hpas", self.reader.list_hpas(namespace)).await?;
        Ok(hpas.iter().any(|hpa| {
            hpa.spec.as_ref().is_some_and(|spec| {
                let scale = &spec.scale_target_ref;
                (scale.kind == target.kind && scale.name == target.name)
                    || owner_chain
                        .iter()
                        .any(|owner| scale.kind == owner.kind && scale.name == owner.name)
            })
        }))
    }

    async fn detect_network_policy(&self, namespace: &str) -> Result<bool, Error> {
        bounded(
            self.call_timeout,
            "list network policies",
            self.reader.has_network_policies(namespace),
        )
        .await
    }
}

fn record(
    detected: &mut DetectedLabels,
    name: &str,
    result: Result<bool, Error>,
    set: impl FnOnce(&mut DetectedLabels, bool),
) {
    match result {
        Ok(value) => set(detected, value),
        Err(e) => {
            warn!(detection = name, error = %e, "feature detection failed");
            record_enrichment_error(e.kind_label());
            detected.failed_detections.push(name.to_string());
        }
    }
}

/// GitOps tool marking the namespace or workload
///
/// `None` when namespace metadata is unavailable, `Some(None)` when no
/// marker is present.
fn detect_git_ops(context: &KubernetesContext) -> Option<Option<&'static str>> {
    let namespace = context.namespace.as_ref()?;
    let empty = BTreeMap::new();
    let workload_labels = context.workload_labels().unwrap_or(&empty);
    let workload_annotations = workload_annotations(context).unwrap_or(&empty);

    let sources = [
        &namespace.annotations,
        &namespace.labels,
        workload_annotations,
        workload_labels,
    ];
    let has_marker = |markers: &[&str]| {
        sources
            .iter()
            .any(|map| markers.iter().any(|m| map.contains_key(*m)))
    };

    Some(if has_marker(FLUX_MARKERS) {
        Some(FLUX)
    } else if has_marker(ARGOCD_MARKERS) {
        Some(ARGOCD)
    } else {
        None
    })
}

fn is_stateful(target: &TargetResource, owner_chain: &[OwnerChainEntry]) -> bool {
    target.kind == "StatefulSet" || owner_chain.iter().any(|o| o.kind == "StatefulSet")
}

fn is_helm_managed(context: &KubernetesContext) -> bool {
    let managed_by_helm = |labels: &BTreeMap<String, String>| {
        labels
            .get(HELM_MANAGED_BY_LABEL)
            .is_some_and(|v| v.eq_ignore_ascii_case("helm"))
    };
    context.workload_labels().is_some_and(managed_by_helm)
        || workload_annotations(context).is_some_and(|a| a.contains_key(HELM_RELEASE_ANNOTATION))
}

fn workload_annotations(context: &KubernetesContext) -> Option<&BTreeMap<String, String>> {
    if let Some(pod) = &context.pod {
        return Some(&pod.annotations);
    }
    if let Some(d) = &context.deployment {
        return Some(&d.annotations);
    }
    if let Some(s) = &context.stateful_set {
        return Some(&s.annotations);
    }
    context.service.as_ref().map(|s| &s.annotations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterReader;
    use k8s_openapi::api::autoscaling::v2::{
        CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    };
    use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use sigproc_common::crd::{DeploymentDetails, NamespaceContext, PodDetails};

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pdb(selector: &[(&str, &str)]) -> PodDisruptionBudget {
        PodDisruptionBudget {
            spec: Some(PodDisruptionBudgetSpec {
                selector: Some(LabelSelector {
                    match_labels: Some(map(selector)),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn hpa(kind: &str, name: &str) -> HorizontalPodAutoscaler {
        HorizontalPodAutoscaler {
            spec: Some(HorizontalPodAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".into()),
                    kind: kind.into(),
                    name: name.into(),
                },
                max_replicas: 5,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_target() -> TargetResource {
        TargetResource {
            kind: "Pod".into(),
            name: "api-7d9f-x2".into(),
            namespace: Some("payments".into()),
        }
    }

    fn pod_context(labels: &[(&str, &str)]) -> KubernetesContext {
        KubernetesContext {
            namespace: Some(NamespaceContext {
                name: "payments".into(),
                ..Default::default()
            }),
            pod: Some(PodDetails {
                labels: map(labels),
                ..Default::default()
            }),
            owner_chain: vec![
                OwnerChainEntry {
                    kind: "ReplicaSet".into(),
                    name: "api-7d9f".into(),
                    uid: "u1".into(),
                },
                OwnerChainEntry {
                    kind: "Deployment".into(),
                    name: "api".into(),
                    uid: "u2".into(),
                },
            ],
            ..Default::default()
        }
    }

    fn reader(
        pdbs: Vec<PodDisruptionBudget>,
        hpas: Vec<HorizontalPodAutoscaler>,
        network: bool,
    ) -> MockClusterReader {
        let mut mock = MockClusterReader::new();
        mock.expect_list_pdbs().returning(move |_| Ok(pdbs.clone()));
        mock.expect_list_hpas().returning(move |_| Ok(hpas.clone()));
        mock.expect_has_network_policies().returning(move |_| Ok(network));
        mock
    }

    fn forbidden() -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        }))
    }

    #[tokio::test]
    async fn story_hpa_on_deployment_detected_through_owner_chain() {
        let detector = FeatureDetector::new(Arc::new(reader(vec![], vec![hpa("Deployment", "api")], false)));
        let detected = detector.detect(&pod_target(), &pod_context(&[("app", "api")])).await;

        assert!(detected.has_hpa);
        assert!(!detected.has_pdb);
        assert!(detected.failed_detections.is_empty());
    }

    #[tokio::test]
    async fn story_hpa_for_other_workload_is_ignored() {
        let detector = FeatureDetector::new(Arc::new(reader(vec![], vec![hpa("Deployment", "web")], false)));
        let detected = detector.detect(&pod_target(), &pod_context(&[])).await;
        assert!(!detected.has_hpa);
    }

    #[tokio::test]
    async fn story_pdb_matches_pod_labels() {
        let detector = FeatureDetector::new(Arc::new(reader(
            vec![pdb(&[("app", "web")]), pdb(&[("app", "api")])],
            vec![],
            true,
        )));
        let detected = detector
            .detect(&pod_target(), &pod_context(&[("app", "api"), ("pod-template-hash", "7d9f")]))
            .await;
        assert!(detected.has_pdb);
        assert!(detected.network_isolated);
    }

    #[tokio::test]
    async fn story_pdb_matches_deployment_template_labels() {
        let target = TargetResource {
            kind: "Deployment".into(),
            name: "api".into(),
            namespace: Some("payments".into()),
        };
        let context = KubernetesContext {
            deployment: Some(DeploymentDetails {
                labels: map(&[("owner", "team-a")]),
                pod_template_labels: map(&[("app", "api")]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let detector = FeatureDetector::new(Arc::new(reader(vec![pdb(&[("app", "api")])], vec![], false)));
        assert!(detector.detect(&target, &context).await.has_pdb);
    }

    #[tokio::test]
    async fn story_failures_are_listed_not_reported_false() {
        let mut mock = MockClusterReader::new();
        mock.expect_list_pdbs().returning(|_| Err(forbidden()));
        mock.expect_list_hpas().returning(|_| Ok(vec![hpa("Deployment", "api")]));
        mock.expect_has_network_policies()
            .returning(|_| Err(Error::timeout("list network policies", Duration::from_secs(5))));

        let detected = FeatureDetector::new(Arc::new(mock))
            .detect(&pod_target(), &pod_context(&[("app", "api")]))
            .await;

        assert!(detected.has_hpa);
        assert!(!detected.has_pdb);
        assert_eq!(detected.failed_detections, vec![PDB_DETECTION, NETWORK_POLICY_DETECTION]);
    }

    #[tokio::test]
    async fn story_unresolved_pod_labels_fail_pdb_detection() {
        let mut context = pod_context(&[]);
        context.pod = None;
        let mut mock = MockClusterReader::new();
        mock.expect_list_pdbs().times(0).returning(|_| Ok(vec![pdb(&[])]));
        mock.expect_list_hpas().returning(|_| Ok(vec![]));
        mock.expect_has_network_policies().returning(|_| Ok(false));

        let detected = FeatureDetector::new(Arc::new(mock))
            .detect(&pod_target(), &context)
            .await;

        assert!(!detected.has_pdb);
        assert_eq!(detected.failed_detections, vec![PDB_DETECTION]);
    }

    #[tokio::test]
    async fn story_service_without_pod_labels_has_no_pdb() {
        let target = TargetResource {
            kind: "Service".into(),
            name: "api".into(),
            namespace: Some("payments".into()),
        };
        let mut context = pod_context(&[]);
        context.pod = None;
        let detected = FeatureDetector::new(Arc::new(reader(vec![pdb(&[])], vec![], false)))
            .detect(&target, &context)
            .await;

        assert!(!detected.has_pdb);
        assert!(detected.failed_detections.is_empty());
    }

    #[tokio::test]
    async fn story_gitops_needs_namespace_metadata() {
        let mut context = pod_context(&[]);
        context.namespace = None;
        let detected = FeatureDetector::new(Arc::new(reader(vec![], vec![], false)))
            .detect(&pod_target(), &context)
            .await;
        assert!(!detected.git_ops_managed);
        assert_eq!(detected.failed_detections, vec![GITOPS_DETECTION]);
    }

    #[test]
    fn test_gitops_markers() {
        let mut context = pod_context(&[]);
        assert_eq!(detect_git_ops(&context), Some(None));

        context.namespace.as_mut().unwrap().annotations =
            map(&[("kustomize.toolkit.fluxcd.io/name", "apps")]);
        assert_eq!(detect_git_ops(&context), Some(Some(FLUX)));

        let mut context = pod_context(&[("argocd.argoproj.io/instance", "payments")]);
        assert_eq!(detect_git_ops(&context), Some(Some(ARGOCD)));
        context.namespace = None;
        assert_eq!(detect_git_ops(&context), None);
    }

    #[test]
    fn test_stateful_and_helm_detection() {
        let mut context = pod_context(&[(HELM_MANAGED_BY_LABEL, "Helm")]);
        assert!(is_helm_managed(&context));
        assert!(!is_stateful(&pod_target(), &context.owner_chain));

        context.owner_chain = vec![OwnerChainEntry {
            kind: "StatefulSet".into(),
            name: "db".into(),
            uid: "u3".into(),
        }];
        assert!(is_stateful(&pod_target(), &context.owner_chain));
        assert!(!is_helm_managed(&pod_context(&[])));
    }
}
