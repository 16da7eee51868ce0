//! Audit trail for signal processing
//!
//! Audit emission never blocks or fails a reconcile. Events go through a
//! bounded channel with `try_send`; when the buffer is full the event is
//! dropped, logged and counted. A background task drains the channel in
//! batches into an [`AuditWriter`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use sigproc_common::crd::SignalRecord;
use sigproc_common::metrics::record_audit_dropped;
use sigproc_common::{Error, CONTROLLER_NAME};

/// Category shared by every event this controller emits
pub const EVENT_CATEGORY: &str = "signalprocessing";

/// Audit event types
pub mod event_types {
    /// A phase transition was persisted
    pub const PHASE_TRANSITION: &str = "signalprocessing.phase.transition";
    /// Kubernetes context was gathered
    pub const ENRICHMENT_COMPLETED: &str = "signalprocessing.enrichment.completed";
    /// Classification decisions were made
    pub const CLASSIFICATION_DECISION: &str = "signalprocessing.classification.decision";
    /// The signal reached Completed
    pub const SIGNAL_PROCESSED: &str = "signalprocessing.signal.processed";
    /// Processing failed
    pub const ERROR_OCCURRED: &str = "signalprocessing.error.occurred";
}

/// Outcome recorded on an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// The action succeeded
    Success,
    /// The action completed with partial data
    Partial,
    /// The action failed
    Failure,
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unique event id
    pub event_id: Uuid,
    /// When the event was emitted
    pub event_timestamp: DateTime<Utc>,
    /// Event type (see [`event_types`])
    pub event_type: String,
    /// Event category
    pub event_category: String,
    /// What was done (enrich, classify, ...)
    pub event_action: String,
    /// Outcome of the action
    pub event_outcome: AuditOutcome,
    /// Correlates every event of one signal (the signal fingerprint)
    pub correlation_id: String,
    /// Kind of actor
    pub actor_type: String,
    /// Actor identity
    pub actor_id: String,
    /// Namespace of the SignalRecord
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_namespace: Option<String>,
    /// Name of the SignalRecord
    pub resource_name: String,
    /// Event payload
    #[serde(default)]
    pub event_data: Value,
    /// Duration of the audited step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl AuditEvent {
    /// New event about `record`, emitted by this controller
    pub fn for_record(
        record: &SignalRecord,
        event_type: &str,
        action: &str,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_timestamp: Utc::now(),
            event_type: event_type.to_string(),
            event_category: EVENT_CATEGORY.to_string(),
            event_action: action.to_string(),
            event_outcome: outcome,
            correlation_id: record.spec.fingerprint.clone(),
            actor_type: "service".to_string(),
            actor_id: CONTROLLER_NAME.to_string(),
            resource_namespace: record.metadata.namespace.clone(),
            resource_name: record.metadata.name.clone().unwrap_or_default(),
            event_data: Value::Null,
            duration_ms: None,
        }
    }

    /// Attach a payload
    pub fn with_data(mut self, data: Value) -> Self {
        self.event_data = data;
        self
    }

    /// Attach a duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Fire-and-forget audit sink used by the reconciler
pub trait AuditStore: Send + Sync {
    /// Queue an event; never blocks
    fn store(&self, event: AuditEvent);
}

/// Persistence seam behind [`BufferedAuditStore`]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuditWriter: Send + Sync {
    /// Persist one batch
    async fn write_batch(&self, events: Vec<AuditEvent>) -> Result<(), Error>;
}

/// Writer emitting each event as a structured log record
pub struct TracingAuditWriter;

#[async_trait]
impl AuditWriter for TracingAuditWriter {
    async fn write_batch(&self, events: Vec<AuditEvent>) -> Result<(), Error> {
        for event in events {
            let data = serde_json::to_string(&event.event_data)
                .map_err(|e| Error::serialization(e.to_string()))?;
            info!(
                target: "audit",
                event_id = %event.event_id,
                event_type = %event.event_type,
                event_category = %event.event_category,
                event_action = %event.event_action,
                event_outcome = ?event.event_outcome,
                correlation_id = %event.correlation_id,
                actor_id = %event.actor_id,
                resource_namespace = event.resource_namespace.as_deref().unwrap_or_default(),
                resource_name = %event.resource_name,
                duration_ms = event.duration_ms,
                event_data = %data,
                "audit event"
            );
        }
        Ok(())
    }
}

/// Buffering settings for [`BufferedAuditStore`]
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Channel capacity; events beyond it are dropped
    pub buffer_size: usize,
    /// Largest batch handed to the writer
    pub batch_size: usize,
    /// Maximum time an event waits before its batch is flushed
    pub flush_interval: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            batch_size: 64,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// [`AuditStore`] backed by a bounded channel and a batching task
pub struct BufferedAuditStore {
    tx: mpsc::Sender<AuditEvent>,
}

impl BufferedAuditStore {
    /// Start the batching task
    ///
    /// The task flushes whatever is buffered and exits once `cancel` fires.
    pub fn spawn(
        writer: Arc<dyn AuditWriter>,
        config: AuditConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let handle = tokio::spawn(drain_loop(rx, writer, config, cancel));
        (Self { tx }, handle)
    }
}

impl AuditStore for BufferedAuditStore {
    fn store(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let (reason, event) = match e {
                mpsc::error::TrySendError::Full(event) => ("buffer_full", event),
                mpsc::error::TrySendError::Closed(event) => ("closed", event),
            };
            warn!(
                reason,
                event_type = %event.event_type,
                correlation_id = %event.correlation_id,
                "dropping audit event"
            );
            record_audit_dropped(reason);
        }
    }
}

/// Store that discards every event
pub struct NoopAuditStore;

impl AuditStore for NoopAuditStore {
    fn store(&self, _event: AuditEvent) {}
}

async fn drain_loop(
    mut rx: mpsc::Receiver<AuditEvent>,
    writer: Arc<dyn AuditWriter>,
    config: AuditConfig,
    cancel: CancellationToken,
) {
    let batch_size = config.batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        flush(writer.as_ref(), &mut batch).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => flush(writer.as_ref(), &mut batch).await,
        }
    }

    rx.close();
    while let Some(event) = rx.recv().await {
        batch.push(event);
        if batch.len() >= batch_size {
            flush(writer.as_ref(), &mut batch).await;
        }
    }
    flush(writer.as_ref(), &mut batch).await;
    debug!("audit drain loop stopped");
}

async fn flush(writer: &dyn AuditWriter, batch: &mut Vec<AuditEvent>) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    let count = events.len();
    if let Err(e) = writer.write_batch(events).await {
        warn!(error = %e, count, "audit batch write failed, events dropped");
        for _ in 0..count {
            record_audit_dropped("write_failed");
        }
    }
}
