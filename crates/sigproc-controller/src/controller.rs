//! SignalRecord controller implementation
//!
//! Reconciles SignalRecord resources through a state machine:
//! Pending → Enriching → Classifying → Categorizing → Completed, with
//! Failed reachable from Pending on invalid input.
//!
//! Each reconcile performs the work of exactly one phase and persists the
//! result with a single status write before requeueing. Enrichment and
//! classification never fail a signal; they degrade or fall back instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::events::EventType;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use sigproc_classifier::{business, custom_labels, environment, priority, severity};
use sigproc_classifier::{signal_facts, Classifiers};
use sigproc_common::crd::{
    upsert_condition, Condition, ConditionStatus, SignalPhase, SignalRecord, SignalRecordStatus,
};
use sigproc_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use sigproc_common::metrics::{Outcome, PhaseTimer};
use sigproc_common::{Error, CONTROLLER_NAME};
use sigproc_enrichment::{
    ClusterReader, Enricher, FeatureDetector, KubeClusterReader, OwnerChainBuilder,
    DEFAULT_CALL_TIMEOUT,
};

use crate::audit::{event_types, AuditEvent, AuditOutcome, AuditStore};
use crate::status::{write_status, KubeSignalStore, SignalStore, WriteOutcome};

/// Watcher timeout (seconds), kept below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Requeue delay after a retryable reconcile error
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Condition types, one per completed stage
pub mod conditions {
    /// Kubernetes context was gathered
    pub const ENRICHMENT_COMPLETE: &str = "EnrichmentComplete";
    /// Environment, severity and custom labels were classified
    pub const CLASSIFICATION_COMPLETE: &str = "ClassificationComplete";
    /// Priority and business classification were assigned
    pub const CATEGORIZATION_COMPLETE: &str = "CategorizationComplete";
    /// Processing reached a terminal phase
    pub const PROCESSING_COMPLETE: &str = "ProcessingComplete";
}

/// Tunables for the reconciler
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Deadline for each Kubernetes read during enrichment
    pub call_timeout: Duration,
    /// Delay before the next phase is processed
    pub requeue_after: Duration,
    /// Maximum number of records reconciled concurrently
    pub concurrency: u16,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            requeue_after: Duration::from_millis(500),
            concurrency: 8,
        }
    }
}

/// Shared context for the SignalRecord controller
pub struct Context {
    /// SignalRecord reads and status writes
    pub store: Arc<dyn SignalStore>,
    /// Policy-backed classifiers
    pub classifiers: Classifiers,
    /// Namespace and target lookup
    pub enricher: Enricher,
    /// Owner-reference traversal
    pub owner_chain: OwnerChainBuilder,
    /// PDB/HPA/NetworkPolicy/GitOps detection
    pub detector: FeatureDetector,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Audit sink
    pub audit: Arc<dyn AuditStore>,
    /// Reconciler tunables
    pub settings: ControllerSettings,
}

impl Context {
    /// Assemble a context from its collaborators
    pub fn new(
        store: Arc<dyn SignalStore>,
        reader: Arc<dyn ClusterReader>,
        classifiers: Classifiers,
        events: Arc<dyn EventPublisher>,
        audit: Arc<dyn AuditStore>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            classifiers,
            enricher: Enricher::new(reader.clone()).with_call_timeout(settings.call_timeout),
            owner_chain: OwnerChainBuilder::new(reader.clone())
                .with_call_timeout(settings.call_timeout),
            detector: FeatureDetector::new(reader).with_call_timeout(settings.call_timeout),
            events,
            audit,
            settings,
        }
    }

    /// Context wired to the API server
    pub fn from_client(
        client: Client,
        classifiers: Classifiers,
        audit: Arc<dyn AuditStore>,
        settings: ControllerSettings,
    ) -> Self {
        Self::new(
            Arc::new(KubeSignalStore::new(client.clone())),
            Arc::new(KubeClusterReader::new(client.clone())),
            classifiers,
            Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            audit,
            settings,
        )
    }
}

/// Kubernetes Event emitted after a successful write
struct PendingEvent {
    type_: EventType,
    reason: &'static str,
    action: &'static str,
    note: String,
}

/// Result of processing one phase, applied only once the status is written
struct Transition {
    status: SignalRecordStatus,
    outcome: Outcome,
    audit: Vec<AuditEvent>,
    event: Option<PendingEvent>,
}

impl Transition {
    fn new(status: SignalRecordStatus, outcome: Outcome) -> Self {
        Self {
            status,
            outcome,
            audit: Vec::new(),
            event: None,
        }
    }

    fn audit(mut self, event: AuditEvent) -> Self {
        self.audit.push(event);
        self
    }

    fn event(mut self, type_: EventType, reason: &'static str, action: &'static str, note: String) -> Self {
        self.event = Some(PendingEvent {
            type_,
            reason,
            action,
            note,
        });
        self
    }
}

/// Reconcile a SignalRecord
#[instrument(skip(record, ctx), fields(signal = %record.name_any()))]
pub async fn reconcile(record: Arc<SignalRecord>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = record.name_any();
    let generation = record.metadata.generation;
    let status = record.status.clone().unwrap_or_default();

    // Failed is terminal even across spec changes
    if status.phase == SignalPhase::Failed {
        return Ok(Action::await_change());
    }

    if starts_fresh_pass(&status, generation) {
        info!(
            signal = %name,
            observed = ?status.observed_generation,
            generation = ?generation,
            "spec changed, restarting processing"
        );
        let fresh = SignalRecordStatus::pending(generation);
        return apply(&record, &ctx, Transition::new(fresh, Outcome::Success)).await;
    }

    if status.phase == SignalPhase::Completed {
        return Ok(Action::await_change());
    }

    let phase = status.phase;
    let timer = PhaseTimer::start(phase.as_str());
    let transition = match phase {
        SignalPhase::Pending => process_pending(&record, status, generation),
        SignalPhase::Enriching => process_enriching(&record, &ctx, status).await,
        SignalPhase::Classifying => process_classifying(&record, &ctx, status).await,
        SignalPhase::Categorizing => process_categorizing(&record, &ctx, status).await,
        SignalPhase::Completed | SignalPhase::Failed => return Ok(Action::await_change()),
    };

    let outcome = transition.outcome;
    match apply(&record, &ctx, transition).await {
        Ok(action) => {
            timer.finish(outcome);
            Ok(action)
        }
        Err(e) => {
            timer.finish(Outcome::Failure);
            Err(e)
        }
    }
}

/// Whether a spec change requires discarding the current pass
fn starts_fresh_pass(status: &SignalRecordStatus, generation: Option<i64>) -> bool {
    match (status.observed_generation, generation) {
        (Some(observed), Some(current)) => current > observed,
        _ => false,
    }
}

/// Persist a transition, then emit its side effects
async fn apply(record: &SignalRecord, ctx: &Context, transition: Transition) -> Result<Action, Error> {
    let name = record.name_any();
    let terminal = transition.status.phase.is_terminal();

    match write_status(ctx.store.as_ref(), record, &transition.status).await {
        Ok(WriteOutcome::Written) => {
            info!(signal = %name, phase = %transition.status.phase, "phase transition persisted");
            for event in transition.audit {
                ctx.audit.store(event);
            }
            if let Some(event) = transition.event {
                ctx.events
                    .publish(
                        &record.object_ref(&()),
                        event.type_,
                        event.reason,
                        event.action,
                        Some(event.note),
                    )
                    .await;
            }
        }
        Ok(WriteOutcome::Superseded) => {
            debug!(signal = %name, "record already advanced, skipping side effects");
        }
        Err(e @ Error::Conflict { .. }) => return fail_after_conflict(record, ctx, e).await,
        Err(e) => return Err(e),
    }

    if terminal {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(ctx.settings.requeue_after))
    }
}

/// Try to park a record whose status writes keep conflicting in Failed
async fn fail_after_conflict(record: &SignalRecord, ctx: &Context, cause: Error) -> Result<Action, Error> {
    let name = record.name_any();
    error!(signal = %name, error = %cause, "status conflicts exhausted, marking signal failed");

    let mut status = record.status.clone().unwrap_or_default();
    let message = cause.to_string();
    fail(&mut status, "StatusConflict", &message);

    match write_status(ctx.store.as_ref(), record, &status).await {
        Ok(WriteOutcome::Written) => {
            ctx.audit.store(
                AuditEvent::for_record(record, event_types::ERROR_OCCURRED, "persist", AuditOutcome::Failure)
                    .with_data(json!({ "error": message })),
            );
            Ok(Action::await_change())
        }
        Ok(WriteOutcome::Superseded) => Ok(Action::await_change()),
        Err(e) => {
            warn!(signal = %name, error = %e, "could not mark signal failed, requeueing");
            Err(cause)
        }
    }
}

fn fail(status: &mut SignalRecordStatus, reason: &str, message: &str) {
    status.phase = SignalPhase::Failed;
    status.error = Some(message.to_string());
    status.completion_time = None;
    upsert_condition(
        &mut status.conditions,
        Condition::new(conditions::PROCESSING_COMPLETE, ConditionStatus::False, reason, message),
    );
}

fn process_pending(record: &SignalRecord, mut status: SignalRecordStatus, generation: Option<i64>) -> Transition {
    let name = record.name_any();
    status.observed_generation = generation;

    if let Err(e) = record.spec.validate(&name) {
        warn!(signal = %name, error = %e, "invalid signal, failing without retry");
        let message = e.to_string();
        fail(&mut status, "ValidationFailed", &message);
        return Transition::new(status, Outcome::Failure)
            .audit(
                AuditEvent::for_record(record, event_types::ERROR_OCCURRED, "validate", AuditOutcome::Failure)
                    .with_data(json!({ "error": message })),
            )
            .event(EventType::Warning, reasons::SIGNAL_PROCESSING_FAILED, actions::VALIDATE, message);
    }

    status.phase = SignalPhase::Enriching;
    status.start_time.get_or_insert_with(Utc::now);
    Transition::new(status, Outcome::Success).audit(phase_event(record, SignalPhase::Pending, SignalPhase::Enriching))
}

async fn process_enriching(record: &SignalRecord, ctx: &Context, mut status: SignalRecordStatus) -> Transition {
    let started = std::time::Instant::now();
    let target = &record.spec.target_resource;

    let (mut context, chain) = tokio::join!(ctx.enricher.enrich(target), ctx.owner_chain.build(target));
    context.owner_chain = chain;
    context.detected_labels = Some(ctx.detector.detect(target, &context).await);

    let degraded = context.degraded_mode;
    let failed_detections = context
        .detected_labels
        .as_ref()
        .map(|d| d.failed_detections.clone())
        .unwrap_or_default();
    let summary = json!({
        "degradedMode": degraded,
        "confidence": context.confidence,
        "ownerChainLength": context.owner_chain.len(),
        "failedDetections": failed_detections,
    });
    let (reason, message) = if degraded {
        ("EnrichmentDegraded", format!("partial context, confidence {:.1}", context.confidence))
    } else {
        ("Enriched", format!("context gathered, confidence {:.1}", context.confidence))
    };

    upsert_condition(
        &mut status.conditions,
        Condition::new(conditions::ENRICHMENT_COMPLETE, ConditionStatus::True, reason, &message),
    );
    status.kubernetes_context = Some(context);
    status.phase = SignalPhase::Classifying;

    let (outcome, audit_outcome) = if degraded {
        (Outcome::Degraded, AuditOutcome::Partial)
    } else {
        (Outcome::Success, AuditOutcome::Success)
    };
    let transition = Transition::new(status, outcome).audit(
        AuditEvent::for_record(record, event_types::ENRICHMENT_COMPLETED, "enrich", audit_outcome)
            .with_data(summary)
            .with_duration(started.elapsed()),
    );
    if degraded {
        transition.event(EventType::Warning, reasons::ENRICHMENT_DEGRADED, actions::ENRICH, message)
    } else {
        transition
    }
}

async fn process_classifying(record: &SignalRecord, ctx: &Context, mut status: SignalRecordStatus) -> Transition {
    let facts = signal_facts(&record.spec, status.kubernetes_context.as_ref());
    let classifiers = &ctx.classifiers;

    let (env, sev, labels) = tokio::join!(
        classifiers.environment.classify(&facts),
        classifiers.severity.classify(&facts),
        classifiers.custom_labels.extract(&facts),
    );

    let fell_back = env.policy_version.is_none() || sev.policy_version.is_none();
    record_version(&mut status, environment::POLICY_NAME, env.policy_version);
    record_version(&mut status, severity::POLICY_NAME, sev.policy_version);
    record_version(&mut status, custom_labels::POLICY_NAME, labels.policy_version);

    let summary = json!({
        "environment": env.value.environment,
        "environmentSource": env.value.source,
        "severity": sev.value.severity,
        "originalSeverity": sev.value.original_severity,
        "customLabelKeys": labels.value.keys().collect::<Vec<_>>(),
    });

    status.environment_classification = Some(env.value);
    status.severity = Some(sev.value);
    status
        .kubernetes_context
        .get_or_insert_with(Default::default)
        .custom_labels = labels.value;

    upsert_condition(
        &mut status.conditions,
        Condition::new(
            conditions::CLASSIFICATION_COMPLETE,
            ConditionStatus::True,
            if fell_back { "ClassifiedWithFallback" } else { "Classified" },
            "environment, severity and custom labels classified",
        ),
    );
    status.phase = SignalPhase::Categorizing;

    let outcome = if fell_back { Outcome::Degraded } else { Outcome::Success };
    Transition::new(status, outcome).audit(
        AuditEvent::for_record(record, event_types::CLASSIFICATION_DECISION, "classify", AuditOutcome::Success)
            .with_data(summary),
    )
}

async fn process_categorizing(record: &SignalRecord, ctx: &Context, mut status: SignalRecordStatus) -> Transition {
    let facts = signal_facts(&record.spec, status.kubernetes_context.as_ref());
    let environment = status
        .environment_classification
        .as_ref()
        .map(|e| e.environment.clone())
        .unwrap_or_else(|| environment::UNKNOWN_ENVIRONMENT.to_string());
    let severity = status
        .severity
        .as_ref()
        .map(|s| s.severity.clone())
        .unwrap_or_else(|| severity::CONSERVATIVE_SEVERITY.to_string());

    let classifiers = &ctx.classifiers;
    let (prio, biz) = tokio::join!(
        classifiers.priority.assign(&facts, &severity, &environment),
        classifiers.business.classify(&facts),
    );

    let fell_back = prio.policy_version.is_none() || biz.policy_version.is_none();
    record_version(&mut status, priority::POLICY_NAME, prio.policy_version);
    record_version(&mut status, business::POLICY_NAME, biz.policy_version);

    let note = format!(
        "priority {} for {} signal in {} environment",
        prio.value.priority, severity, environment
    );
    let summary = json!({
        "priority": prio.value.priority,
        "environment": environment,
        "severity": severity,
        "businessUnit": biz.value.business_unit,
        "criticality": biz.value.criticality,
        "degradedMode": status.kubernetes_context.as_ref().is_some_and(|c| c.degraded_mode),
    });

    status.priority_assignment = Some(prio.value);
    status.business_classification = Some(biz.value);
    upsert_condition(
        &mut status.conditions,
        Condition::new(
            conditions::CATEGORIZATION_COMPLETE,
            ConditionStatus::True,
            if fell_back { "CategorizedWithFallback" } else { "Categorized" },
            "priority and business classification assigned",
        ),
    );
    upsert_condition(
        &mut status.conditions,
        Condition::new(conditions::PROCESSING_COMPLETE, ConditionStatus::True, "Processed", &note),
    );
    status.phase = SignalPhase::Completed;
    status.completion_time.get_or_insert_with(Utc::now);

    let mut processed = AuditEvent::for_record(record, event_types::SIGNAL_PROCESSED, "complete", AuditOutcome::Success)
        .with_data(summary);
    if let Some(elapsed) = status.start_time.and_then(|start| (Utc::now() - start).to_std().ok()) {
        processed = processed.with_duration(elapsed);
    }

    let outcome = if fell_back { Outcome::Degraded } else { Outcome::Success };
    Transition::new(status, outcome)
        .audit(processed)
        .event(EventType::Normal, reasons::SIGNAL_PROCESSED, actions::COMPLETE, note)
}

fn record_version(status: &mut SignalRecordStatus, policy: &str, version: Option<String>) {
    if let Some(version) = version {
        status.policy_versions.insert(policy.to_string(), version);
    }
}

fn phase_event(record: &SignalRecord, from: SignalPhase, to: SignalPhase) -> AuditEvent {
    AuditEvent::for_record(record, event_types::PHASE_TRANSITION, "transition", AuditOutcome::Success)
        .with_data(json!({ "from": from.to_string(), "to": to.to_string() }))
}

/// Error policy for SignalRecord reconciliation
pub fn error_policy(record: Arc<SignalRecord>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        signal = %record.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::await_change()
    }
}

/// Run the SignalRecord controller until a shutdown signal arrives
pub async fn run_controller(client: Client, ctx: Arc<Context>) {
    let records: Api<SignalRecord> = Api::all(client);
    let concurrency = ctx.settings.concurrency;
    info!(concurrency, "starting SignalRecord controller");

    Controller::new(records, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            match result {
                Ok(action) => debug!(?action, "SignalRecord reconciliation completed"),
                Err(e) => error!(error = ?e, "SignalRecord reconciliation error"),
            }
            std::future::ready(())
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    use async_trait::async_trait;
    use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
    use k8s_openapi::api::autoscaling::v2::{
        CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    };
    use k8s_openapi::api::core::v1::{Namespace, ObjectReference, Pod, Service};
    use k8s_openapi::api::policy::v1::PodDisruptionBudget;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use parking_lot::Mutex;
    use rstest::rstest;
    use sigproc_common::crd::{SignalRecordSpec, TargetResource};

    use crate::status::MockSignalStore;

    // =========================================================================
    // Fakes
    // =========================================================================

    /// In-memory SignalRecord store enforcing resourceVersion preconditions
    struct FakeStore {
        record: Mutex<SignalRecord>,
        writes: Mutex<usize>,
    }

    impl FakeStore {
        fn new(record: SignalRecord) -> Arc<Self> {
            Arc::new(Self {
                record: Mutex::new(record),
                writes: Mutex::new(0),
            })
        }

        fn current(&self) -> SignalRecord {
            self.record.lock().clone()
        }

        fn writes(&self) -> usize {
            *self.writes.lock()
        }

        fn bump_generation(&self) {
            let mut record = self.record.lock();
            let generation = record.metadata.generation.unwrap_or(1);
            record.metadata.generation = Some(generation + 1);
        }
    }

    #[async_trait]
    impl SignalStore for FakeStore {
        async fn get(&self, _namespace: &str, _name: &str) -> Result<Option<SignalRecord>, Error> {
            Ok(Some(self.current()))
        }

        async fn patch_status(
            &self,
            _namespace: &str,
            _name: &str,
            resource_version: Option<String>,
            status: &SignalRecordStatus,
        ) -> Result<(), Error> {
            let mut record = self.record.lock();
            if resource_version.is_some() && resource_version != record.metadata.resource_version {
                return Err(conflict());
            }
            let next: u64 = record
                .metadata
                .resource_version
                .as_deref()
                .and_then(|rv| rv.parse().ok())
                .unwrap_or(0)
                + 1;
            record.metadata.resource_version = Some(next.to_string());
            record.status = Some(status.clone());
            *self.writes.lock() += 1;
            Ok(())
        }
    }

    /// Cluster contents served to the enrichment layer
    #[derive(Default)]
    struct FakeCluster {
        namespace_labels: Option<BTreeMap<String, String>>,
        pods: HashMap<String, Pod>,
        metadata: HashMap<String, ObjectMeta>,
        hpas: Vec<HorizontalPodAutoscaler>,
    }

    #[async_trait]
    impl ClusterReader for FakeCluster {
        async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
            Ok(self.namespace_labels.as_ref().map(|labels| Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                ..Default::default()
            }))
        }

        async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
            Ok(self.pods.get(name).cloned())
        }

        async fn get_deployment(&self, _namespace: &str, _name: &str) -> Result<Option<Deployment>, Error> {
            Ok(None)
        }

        async fn get_stateful_set(&self, _namespace: &str, _name: &str) -> Result<Option<StatefulSet>, Error> {
            Ok(None)
        }

        async fn get_service(&self, _namespace: &str, _name: &str) -> Result<Option<Service>, Error> {
            Ok(None)
        }

        async fn get_metadata(&self, kind: &str, _namespace: &str, name: &str) -> Result<Option<ObjectMeta>, Error> {
            if kind == "Pod" {
                return Ok(self.pods.get(name).map(|p| p.metadata.clone()));
            }
            Ok(self.metadata.get(name).cloned())
        }

        async fn list_pdbs(&self, _namespace: &str) -> Result<Vec<PodDisruptionBudget>, Error> {
            Ok(Vec::new())
        }

        async fn list_hpas(&self, _namespace: &str) -> Result<Vec<HorizontalPodAutoscaler>, Error> {
            Ok(self.hpas.clone())
        }

        async fn has_network_policies(&self, _namespace: &str) -> Result<bool, Error> {
            Err(Error::timeout("list network policies", Duration::from_secs(5)))
        }
    }

    #[derive(Default)]
    struct RecordingAudit {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl AuditStore for RecordingAudit {
        fn store(&self, event: AuditEvent) {
            self.events.lock().push(event);
        }
    }

    impl RecordingAudit {
        fn types(&self) -> Vec<String> {
            self.events.lock().iter().map(|e| e.event_type.clone()).collect()
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        reasons: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingEvents {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.reasons.lock().push(reason.to_string());
        }
    }

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn conflict() -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        }))
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn owned_by(name: &str, kind: &str, owner: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            uid: Some(format!("uid-{name}")),
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".into(),
                kind: kind.into(),
                name: owner.into(),
                uid: format!("uid-{owner}"),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn signal(severity: &str) -> SignalRecord {
        let mut record = SignalRecord::new(
            "high-memory-api",
            SignalRecordSpec {
                fingerprint: "4f9a1c".into(),
                name: "HighMemoryUsage".into(),
                severity: severity.into(),
                signal_type: "prometheus-alert".into(),
                source: Some("prometheus".into()),
                target_resource: TargetResource {
                    kind: "Pod".into(),
                    name: "api-7d9f-x2".into(),
                    namespace: Some("payments".into()),
                },
                received_time: Utc::now(),
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
            },
        );
        record.metadata.namespace = Some("payments".into());
        record.metadata.generation = Some(1);
        record.metadata.resource_version = Some("1".into());
        record
    }

    /// Production namespace with a Pod → ReplicaSet → Deployment chain and
    /// an HPA on the Deployment
    fn production_cluster() -> FakeCluster {
        let mut pod = Pod {
            metadata: owned_by("api-7d9f-x2", "ReplicaSet", "api-7d9f"),
            ..Default::default()
        };
        pod.metadata.labels = Some(map(&[("app", "api"), ("team", "payments-core")]));

        let mut metadata = HashMap::new();
        metadata.insert("api-7d9f".to_string(), owned_by("api-7d9f", "Deployment", "api"));
        metadata.insert(
            "api".to_string(),
            ObjectMeta {
                name: Some("api".into()),
                uid: Some("uid-api".into()),
                ..Default::default()
            },
        );

        FakeCluster {
            namespace_labels: Some(map(&[("kubernaut.ai/environment", "production")])),
            pods: HashMap::from([("api-7d9f-x2".to_string(), pod)]),
            metadata,
            hpas: vec![HorizontalPodAutoscaler {
                spec: Some(HorizontalPodAutoscalerSpec {
                    scale_target_ref: CrossVersionObjectReference {
                        api_version: Some("apps/v1".into()),
                        kind: "Deployment".into(),
                        name: "api".into(),
                    },
                    max_replicas: 10,
                    ..Default::default()
                }),
                ..Default::default()
            }],
        }
    }

    struct Harness {
        ctx: Arc<Context>,
        store: Arc<FakeStore>,
        audit: Arc<RecordingAudit>,
        events: Arc<RecordingEvents>,
    }

    fn harness(record: SignalRecord, cluster: FakeCluster) -> Harness {
        let store = FakeStore::new(record);
        let audit = Arc::new(RecordingAudit::default());
        let events = Arc::new(RecordingEvents::default());
        let ctx = Arc::new(Context::new(
            store.clone(),
            Arc::new(cluster),
            Classifiers::builtin().unwrap(),
            events.clone(),
            audit.clone(),
            ControllerSettings::default(),
        ));
        Harness {
            ctx,
            store,
            audit,
            events,
        }
    }

    /// Reconcile until the controller stops requeueing
    async fn drive(h: &Harness) -> SignalRecord {
        for _ in 0..10 {
            let action = reconcile(Arc::new(h.store.current()), h.ctx.clone())
                .await
                .unwrap();
            if action == Action::await_change() {
                return h.store.current();
            }
        }
        panic!("reconciliation did not terminate");
    }

    // =========================================================================
    // Stories
    // =========================================================================

    #[tokio::test]
    async fn story_pod_signal_walks_every_phase_to_completed() {
        let h = harness(signal("critical"), production_cluster());
        let record = drive(&h).await;
        let status = record.status.unwrap();

        assert_eq!(status.phase, SignalPhase::Completed);
        assert!(status.completion_time.is_some());
        assert!(status.start_time.is_some());
        assert!(status.error.is_none());
        assert_eq!(status.observed_generation, Some(1));

        let context = status.kubernetes_context.unwrap();
        assert!(!context.degraded_mode);
        let chain: Vec<_> = context.owner_chain.iter().map(|o| o.kind.as_str()).collect();
        assert_eq!(chain, vec!["ReplicaSet", "Deployment"]);
        let detected = context.detected_labels.unwrap();
        assert!(detected.has_hpa);
        assert_eq!(detected.failed_detections, vec!["networkPolicy"]);
        assert_eq!(
            context.custom_labels.get("team").cloned(),
            Some(vec!["payments-core".to_string()])
        );

        assert_eq!(status.environment_classification.unwrap().environment, "production");
        assert_eq!(status.severity.unwrap().severity, "critical");
        assert_eq!(status.priority_assignment.unwrap().priority, "P0");
        for policy in ["environment", "severity", "custom_labels", "priority", "business"] {
            assert!(status.policy_versions.contains_key(policy), "missing version for {policy}");
        }

        let condition_types: Vec<_> = status.conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(
            condition_types,
            vec![
                conditions::ENRICHMENT_COMPLETE,
                conditions::CLASSIFICATION_COMPLETE,
                conditions::CATEGORIZATION_COMPLETE,
                conditions::PROCESSING_COMPLETE,
            ]
        );

        // one write per transition
        assert_eq!(h.store.writes(), 4);
        assert_eq!(*h.events.reasons.lock(), vec![reasons::SIGNAL_PROCESSED]);
        assert_eq!(
            h.audit.types(),
            vec![
                event_types::PHASE_TRANSITION,
                event_types::ENRICHMENT_COMPLETED,
                event_types::CLASSIFICATION_DECISION,
                event_types::SIGNAL_PROCESSED,
            ]
        );
    }

    #[tokio::test]
    async fn story_missing_pod_completes_in_degraded_mode() {
        let cluster = FakeCluster {
            namespace_labels: Some(BTreeMap::new()),
            ..Default::default()
        };
        let h = harness(signal("critical"), cluster);
        let status = drive(&h).await.status.unwrap();

        assert_eq!(status.phase, SignalPhase::Completed);
        let context = status.kubernetes_context.unwrap();
        assert!(context.degraded_mode);
        assert!(context.confidence <= 0.5);
        assert_eq!(status.environment_classification.unwrap().environment, "unknown");
        // critical with an unknown environment stays below production tiers
        assert_eq!(status.priority_assignment.unwrap().priority, "P3");
        assert!(h.events.reasons.lock().contains(&reasons::ENRICHMENT_DEGRADED.to_string()));
    }

    #[tokio::test]
    async fn story_invalid_signal_fails_terminally() {
        let mut record = signal("critical");
        record.spec.fingerprint = String::new();
        let h = harness(record, production_cluster());

        let status = drive(&h).await.status.unwrap();
        assert_eq!(status.phase, SignalPhase::Failed);
        assert!(status.error.as_deref().unwrap().contains("fingerprint"));
        assert!(status.completion_time.is_none());
        assert_eq!(h.store.writes(), 1);
        assert_eq!(*h.events.reasons.lock(), vec![reasons::SIGNAL_PROCESSING_FAILED]);

        // Failed is never retried, even after a spec change
        h.store.bump_generation();
        let action = reconcile(Arc::new(h.store.current()), h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(h.store.writes(), 1);
    }

    #[tokio::test]
    async fn story_spec_change_restarts_completed_signal() {
        let h = harness(signal("warning"), production_cluster());
        let first = drive(&h).await.status.unwrap();
        assert_eq!(first.priority_assignment.unwrap().priority, "P2");

        h.store.bump_generation();
        let action = reconcile(Arc::new(h.store.current()), h.ctx.clone()).await.unwrap();
        assert_ne!(action, Action::await_change());

        let reset = h.store.current().status.unwrap();
        assert_eq!(reset.phase, SignalPhase::Pending);
        assert_eq!(reset.observed_generation, Some(2));
        assert!(reset.completion_time.is_none());
        assert!(reset.priority_assignment.is_none());

        let second = drive(&h).await.status.unwrap();
        assert_eq!(second.phase, SignalPhase::Completed);
        assert_eq!(second.observed_generation, Some(2));
    }

    #[tokio::test]
    async fn story_completed_signal_is_left_alone() {
        let h = harness(signal("critical"), production_cluster());
        drive(&h).await;
        let writes = h.store.writes();

        let action = reconcile(Arc::new(h.store.current()), h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(h.store.writes(), writes);
    }

    #[tokio::test]
    async fn story_stale_reconcile_does_not_rewrite_advanced_record() {
        let h = harness(signal("critical"), production_cluster());
        let stale = h.store.current();

        // another worker already moved the record to Enriching
        reconcile(Arc::new(stale.clone()), h.ctx.clone()).await.unwrap();
        let writes = h.store.writes();

        let action = reconcile(Arc::new(stale), h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.settings.requeue_after));
        assert_eq!(h.store.writes(), writes);
        assert_eq!(h.store.current().status.unwrap().phase, SignalPhase::Enriching);
    }

    #[tokio::test]
    async fn story_conflict_exhaustion_marks_signal_failed() {
        let mut store = MockSignalStore::new();
        store
            .expect_patch_status()
            .withf(|_, _, _, status| status.phase == SignalPhase::Enriching)
            .returning(|_, _, _, _| Err(conflict()));
        store
            .expect_get()
            .returning(|_, _| Ok(Some(signal("critical"))));
        store
            .expect_patch_status()
            .withf(|_, _, _, status| status.phase == SignalPhase::Failed)
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let audit = Arc::new(RecordingAudit::default());
        let ctx = Arc::new(Context::new(
            Arc::new(store),
            Arc::new(production_cluster()),
            Classifiers::builtin().unwrap(),
            Arc::new(RecordingEvents::default()),
            audit.clone(),
            ControllerSettings::default(),
        ));

        let action = reconcile(Arc::new(signal("critical")), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(audit.types(), vec![event_types::ERROR_OCCURRED]);
    }

    #[rstest]
    #[case::timeout(Error::timeout("patch status", Duration::from_secs(5)), Action::requeue(ERROR_REQUEUE))]
    #[case::conflict(Error::conflict("high-memory-api", 5), Action::requeue(ERROR_REQUEUE))]
    #[case::not_found(Error::not_found("SignalRecord", "payments/x"), Action::await_change())]
    #[case::validation(Error::validation("bad spec"), Action::await_change())]
    fn test_error_policy_requeues_only_retryable_errors(#[case] error: Error, #[case] expected: Action) {
        let h = harness(signal("critical"), FakeCluster::default());
        assert_eq!(error_policy(Arc::new(signal("critical")), &error, h.ctx), expected);
    }

    #[test]
    fn test_fresh_pass_only_on_newer_generation() {
        let status = SignalRecordStatus {
            phase: SignalPhase::Completed,
            observed_generation: Some(3),
            ..Default::default()
        };
        assert!(starts_fresh_pass(&status, Some(4)));
        assert!(!starts_fresh_pass(&status, Some(3)));
        assert!(!starts_fresh_pass(&SignalRecordStatus::default(), Some(1)));
    }
}
