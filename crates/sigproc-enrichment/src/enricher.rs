//! Best-effort Kubernetes context gathering
//!
//! The namespace and the target object are fetched concurrently, each call
//! under its own deadline. Nothing here returns an error: missing or
//! unreachable objects lower the confidence and set `degradedMode`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use sigproc_common::crd::{
    DeploymentDetails, KubernetesContext, NamespaceContext, PodDetails, ServiceDetails,
    StatefulSetDetails, TargetResource, DEGRADED_CONFIDENCE, FULL_CONFIDENCE, MINIMAL_CONFIDENCE,
    NAMESPACE_ONLY_CONFIDENCE,
};
use sigproc_common::metrics::{record_enrichment_error, EnrichmentTimer};
use sigproc_common::Error;
use tracing::{debug, warn};

use crate::client::{bounded, ClusterReader, DEFAULT_CALL_TIMEOUT};

/// Detail block fetched for the target
enum TargetDetails {
    Pod(PodDetails),
    Deployment(DeploymentDetails),
    StatefulSet(StatefulSetDetails),
    Service(ServiceDetails),
}

/// Result of looking up the target object
enum TargetLookup {
    Found(TargetDetails),
    Missing,
    /// Kind has no detail block
    Unsupported,
}

/// Gathers namespace metadata and the target's detail block
pub struct Enricher {
    reader: Arc<dyn ClusterReader>,
    call_timeout: Duration,
}

impl Enricher {
    /// Create an enricher with the default per-call timeout
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

    /// Gather context for `target`
    ///
    /// The returned context has no owner chain, detected labels or custom
    /// labels; those are filled in by later steps.
    pub async fn enrich(&self, target: &TargetResource) -> KubernetesContext {
        let timer = EnrichmentTimer::start();

        let Some(namespace) = target.namespace.as_deref() else {
            // cluster-scoped: nothing namespaced to look up
            debug!(target = %target, "cluster-scoped target, no namespace context");
            timer.finish(false);
            return KubernetesContext {
                confidence: NAMESPACE_ONLY_CONFIDENCE,
                ..Default::default()
            };
        };

        let (ns, details) = tokio::join!(
            self.fetch_namespace(namespace),
            self.fetch_target(target, namespace)
        );

        let mut context = KubernetesContext {
            namespace: ns,
            ..Default::default()
        };
        let namespace_resolved = context.namespace.is_some();

        let target_resolved = match details {
            TargetLookup::Found(details) => {
                match details {
                    TargetDetails::Pod(d) => context.pod = Some(d),
                    TargetDetails::Deployment(d) => context.deployment = Some(d),
                    TargetDetails::StatefulSet(d) => context.stateful_set = Some(d),
                    TargetDetails::Service(d) => context.service = Some(d),
                }
                Some(true)
            }
            TargetLookup::Missing => Some(false),
            TargetLookup::Unsupported => None,
        };

        let (degraded, confidence) = match (target_resolved, namespace_resolved) {
            (Some(true), true) => (false, FULL_CONFIDENCE),
            (None, true) => (false, NAMESPACE_ONLY_CONFIDENCE),
            (Some(true), false) | (Some(false), true) => (true, DEGRADED_CONFIDENCE),
            (Some(false), false) | (None, false) => (true, MINIMAL_CONFIDENCE),
        };
        context.degraded_mode = degraded;
        context.confidence = confidence;

        timer.finish(degraded);
        if degraded {
            warn!(
                target = %target,
                namespace_resolved,
                confidence,
                "kubernetes context incomplete, continuing in degraded mode"
            );
        } else {
            debug!(target = %target, confidence, "kubernetes context gathered");
        }
        context
    }

    async fn fetch_namespace(&self, name: &str) -> Option<NamespaceContext> {
        let result = bounded(self.call_timeout, "get namespace", self.reader.get_namespace(name)).await;
        resolved("Namespace", name, result).map(|ns| {
            let (labels, annotations) = labels_and_annotations(ns.metadata);
            NamespaceContext {
                name: name.to_string(),
                labels,
                annotations,
            }
        })
    }

    async fn fetch_target(&self, target: &TargetResource, namespace: &str) -> TargetLookup {
        let name = target.name.as_str();
        let timeout = self.call_timeout;
        let found = match target.kind.as_str() {
            "Pod" => resolved(
                "Pod",
                name,
                bounded(timeout, "get pod", self.reader.get_pod(namespace, name)).await,
            )
            .map(|p| TargetDetails::Pod(pod_details(p))),
            "Deployment" => resolved(
                "Deployment",
                name,
                bounded(timeout, "get deployment", self.reader.get_deployment(namespace, name)).await,
            )
            .map(|d| TargetDetails::Deployment(deployment_details(d))),
            "StatefulSet" => resolved(
                "StatefulSet",
                name,
                bounded(timeout, "get statefulset", self.reader.get_stateful_set(namespace, name)).await,
            )
            .map(|s| TargetDetails::StatefulSet(stateful_set_details(s))),
            "Service" => resolved(
                "Service",
                name,
                bounded(timeout, "get service", self.reader.get_service(namespace, name)).await,
            )
            .map(|s| TargetDetails::Service(service_details(s))),
            _ => return TargetLookup::Unsupported,
        };
        match found {
            Some(details) => TargetLookup::Found(details),
            None => TargetLookup::Missing,
        }
    }
}

/// Collapse a lookup into the object, recording why it is absent
fn resolved<T>(kind: &str, name: &str, result: Result<Option<T>, Error>) -> Option<T> {
    match result {
        Ok(Some(obj)) => Some(obj),
        Ok(None) => {
            debug!(kind, name, "object not found");
            record_enrichment_error("not_found");
            None
        }
        Err(e) => {
            warn!(kind, name, error = %e, "lookup failed");
            record_enrichment_error(e.kind_label());
            None
        }
    }
}

fn labels_and_annotations(meta: ObjectMeta) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    (meta.labels.unwrap_or_default(), meta.annotations.unwrap_or_default())
}

fn pod_details(pod: Pod) -> PodDetails {
    let (labels, annotations) = labels_and_annotations(pod.metadata);
    let spec = pod.spec.unwrap_or_default();
    let status = pod.status.unwrap_or_default();
    PodDetails {
        labels,
        annotations,
        phase: status.phase,
        node_name: spec.node_name,
        service_account_name: spec.service_account_name,
        restart_count: status
            .container_statuses
            .iter()
            .flatten()
            .map(|c| c.restart_count)
            .sum(),
    }
}

fn deployment_details(deployment: Deployment) -> DeploymentDetails {
    let (labels, annotations) = labels_and_annotations(deployment.metadata);
    let spec = deployment.spec.unwrap_or_default();
    let status = deployment.status.unwrap_or_default();
    DeploymentDetails {
        labels,
        annotations,
        pod_template_labels: spec
            .template
            .metadata
            .and_then(|m| m.labels)
            .unwrap_or_default(),
        replicas: spec.replicas.unwrap_or(1),
        available_replicas: status.available_replicas.unwrap_or(0),
        ready_replicas: status.ready_replicas.unwrap_or(0),
    }
}

fn stateful_set_details(sts: StatefulSet) -> StatefulSetDetails {
    let (labels, annotations) = labels_and_annotations(sts.metadata);
    let spec = sts.spec.unwrap_or_default();
    let status = sts.status.unwrap_or_default();
    StatefulSetDetails {
        labels,
        annotations,
        pod_template_labels: spec
            .template
            .metadata
            .and_then(|m| m.labels)
            .unwrap_or_default(),
        replicas: spec.replicas.unwrap_or(1),
        ready_replicas: status.ready_replicas.unwrap_or(0),
    }
}

fn service_details(service: Service) -> ServiceDetails {
    let (labels, annotations) = labels_and_annotations(service.metadata);
    let spec = service.spec.unwrap_or_default();
    ServiceDetails {
        labels,
        annotations,
        service_type: spec.type_,
        cluster_ip: spec.cluster_ip,
        selector: spec.selector.unwrap_or_default(),
        ports: spec.ports.iter().flatten().map(|p| p.port).collect(),
    }
}
