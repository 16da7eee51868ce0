//! Operator settings from flags and `SIGPROC_*` environment variables

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use sigproc_classifier::ClassifierConfig;
use sigproc_controller::{AuditConfig, ControllerSettings};

/// Runtime settings for the controller
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Environment policy file overriding the built-in policy
    #[arg(long, env = "SIGPROC_ENVIRONMENT_POLICY")]
    pub environment_policy: Option<PathBuf>,

    /// Priority policy file overriding the built-in policy
    #[arg(long, env = "SIGPROC_PRIORITY_POLICY")]
    pub priority_policy: Option<PathBuf>,

    /// Business policy file overriding the built-in policy
    #[arg(long, env = "SIGPROC_BUSINESS_POLICY")]
    pub business_policy: Option<PathBuf>,

    /// Severity policy file overriding the built-in policy
    #[arg(long, env = "SIGPROC_SEVERITY_POLICY")]
    pub severity_policy: Option<PathBuf>,

    /// Custom label policy file overriding the built-in policy
    #[arg(long, env = "SIGPROC_CUSTOM_LABELS_POLICY")]
    pub custom_labels_policy: Option<PathBuf>,

    /// Watch policy files and swap in valid edits without a restart
    #[arg(
        long,
        env = "SIGPROC_HOT_RELOAD",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub hot_reload: bool,

    /// Maximum number of SignalRecords reconciled concurrently
    #[arg(long, env = "SIGPROC_CONCURRENCY", default_value_t = 8)]
    pub concurrency: u16,

    /// Deadline for a single policy evaluation, in milliseconds
    #[arg(long, env = "SIGPROC_EVALUATION_TIMEOUT_MS", default_value_t = 5_000)]
    pub evaluation_timeout_ms: u64,

    /// Deadline for a single Kubernetes read during enrichment, in milliseconds
    #[arg(long, env = "SIGPROC_CALL_TIMEOUT_MS", default_value_t = 5_000)]
    pub call_timeout_ms: u64,

    /// Delay between phases of the same record, in milliseconds
    #[arg(long, env = "SIGPROC_REQUEUE_MS", default_value_t = 500)]
    pub requeue_ms: u64,

    /// Audit events buffered before new ones are dropped
    #[arg(long, env = "SIGPROC_AUDIT_BUFFER_SIZE", default_value_t = 1024)]
    pub audit_buffer_size: usize,

    /// Largest audit batch written at once
    #[arg(long, env = "SIGPROC_AUDIT_BATCH_SIZE", default_value_t = 64)]
    pub audit_batch_size: usize,

    /// Maximum time an audit event waits for its batch, in milliseconds
    #[arg(long, env = "SIGPROC_AUDIT_FLUSH_MS", default_value_t = 1_000)]
    pub audit_flush_ms: u64,

    /// Emit human-readable logs instead of JSON
    #[arg(long, env = "SIGPROC_PLAIN_LOGS")]
    pub plain_logs: bool,
}

impl Settings {
    /// Policy locations and evaluation deadline for the classifiers
    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            environment_policy: self.environment_policy.clone(),
            priority_policy: self.priority_policy.clone(),
            business_policy: self.business_policy.clone(),
            severity_policy: self.severity_policy.clone(),
            custom_labels_policy: self.custom_labels_policy.clone(),
            evaluation_timeout: Some(Duration::from_millis(self.evaluation_timeout_ms)),
        }
    }

    /// Reconciler tunables
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            requeue_after: Duration::from_millis(self.requeue_ms),
            concurrency: self.concurrency.max(1),
        }
    }

    /// Audit buffering
    pub fn audit_config(&self) -> AuditConfig {
        AuditConfig {
            buffer_size: self.audit_buffer_size,
            batch_size: self.audit_batch_size,
            flush_interval: Duration::from_millis(self.audit_flush_ms.max(1)),
        }
    }
}
