//! Kubernetes Event recording for the SignalRecord controller.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so the reconciler
//! can emit Events visible via `kubectl describe signalrecord`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource
    ///
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (see [`reasons`])
    /// * `action` - What was done (see [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reason strings (REASON column of `kubectl get events`).
pub mod reasons {
    /// Signal reached Completed
    pub const SIGNAL_PROCESSED: &str = "SignalProcessed";
    /// Signal reached Failed
    pub const SIGNAL_PROCESSING_FAILED: &str = "SignalProcessingFailed";
    /// Kubernetes context could only be gathered partially
    pub const ENRICHMENT_DEGRADED: &str = "EnrichmentDegraded";
}

/// Event action strings (ACTION column of `kubectl get events`).
pub mod actions {
    /// Enrichment of Kubernetes context
    pub const ENRICH: &str = "Enrich";
    /// Final phase transition
    pub const COMPLETE: &str = "Complete";
    /// Input validation
    pub const VALIDATE: &str = "Validate";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::SIGNAL_PROCESSED, "SignalProcessed");
        assert_eq!(reasons::ENRICHMENT_DEGRADED, "EnrichmentDegraded");
        assert_eq!(actions::COMPLETE, "Complete");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::SIGNAL_PROCESSING_FAILED,
                actions::VALIDATE,
                Some("fingerprint must not be empty".to_string()),
            )
            .await;
    }
}
