//! Policy-backed classifiers for signal processing
//!
//! Each classifier wraps a [`RuleEngine`] seeded with a compiled-in policy
//! (`policies/*.yaml`) and optionally overridden from a file. Classifiers
//! never return errors: a failed evaluation yields a zero-confidence
//! fallback with source `fallback` and a warning log.

#![deny(missing_docs)]

pub mod business;
pub mod custom_labels;
pub mod environment;
pub mod facts;
pub mod priority;
pub mod severity;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sigproc_policy::{PolicyError, PolicySchema, RuleEngine, DEFAULT_EVALUATION_TIMEOUT};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use business::BusinessClassifier;
pub use custom_labels::CustomLabelExtractor;
pub use environment::EnvironmentClassifier;
pub use facts::signal_facts;
pub use priority::PriorityEngine;
pub use severity::SeverityClassifier;

/// Source recorded on classifications produced without a policy decision
pub const FALLBACK_SOURCE: &str = "fallback";

/// A classification and the version of the policy that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Classified<T> {
    /// The classification
    pub value: T,
    /// Policy version, `None` when the fallback was used
    pub policy_version: Option<String>,
}

impl<T> Classified<T> {
    pub(crate) fn from_policy(value: T, version: String) -> Self {
        Self {
            value,
            policy_version: Some(version),
        }
    }

    pub(crate) fn fallback(value: T) -> Self {
        Self {
            value,
            policy_version: None,
        }
    }
}

/// Per-classifier engine settings
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Operator policy file overriding the built-in policy
    pub policy_path: Option<PathBuf>,
    /// Evaluation deadline
    pub timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            policy_path: None,
            timeout: DEFAULT_EVALUATION_TIMEOUT,
        }
    }
}

/// Compile the built-in policy and apply the override file if present
///
/// Only an invalid built-in policy is an error; a missing or invalid
/// override file is logged and the built-in policy stays active.
pub(crate) fn build_engine(
    name: &str,
    schema: PolicySchema,
    builtin: &str,
    options: &EngineOptions,
) -> Result<Arc<RuleEngine>, PolicyError> {
    let mut engine = RuleEngine::new(name, schema, builtin)?.with_timeout(options.timeout);
    if let Some(path) = &options.policy_path {
        engine = engine.with_policy_path(path);
        if let Err(e) = engine.load_from_file() {
            warn!(policy = %name, error = %e, "override policy rejected at startup, using built-in policy");
        }
    }
    Ok(Arc::new(engine))
}

/// Policy file locations for every classifier
#[derive(Debug, Clone, Default)]
pub struct ClassifierConfig {
    /// Environment policy override
    pub environment_policy: Option<PathBuf>,
    /// Priority policy override
    pub priority_policy: Option<PathBuf>,
    /// Business policy override
    pub business_policy: Option<PathBuf>,
    /// Severity policy override
    pub severity_policy: Option<PathBuf>,
    /// Custom label policy override
    pub custom_labels_policy: Option<PathBuf>,
    /// Evaluation deadline shared by all engines; `None` uses the default
    pub evaluation_timeout: Option<Duration>,
}

impl ClassifierConfig {
    fn options(&self, path: &Option<PathBuf>) -> EngineOptions {
        EngineOptions {
            policy_path: path.clone(),
            timeout: self.evaluation_timeout.unwrap_or(DEFAULT_EVALUATION_TIMEOUT),
        }
    }
}

/// All classifiers used by the reconciler
#[derive(Debug, Clone)]
pub struct Classifiers {
    /// Environment classifier
    pub environment: EnvironmentClassifier,
    /// Priority engine
    pub priority: PriorityEngine,
    /// Business classifier
    pub business: BusinessClassifier,
    /// Severity classifier
    pub severity: SeverityClassifier,
    /// Custom label extractor
    pub custom_labels: CustomLabelExtractor,
}

impl Classifiers {
    /// Classifiers running only the built-in policies
    pub fn builtin() -> Result<Self, PolicyError> {
        Self::from_config(&ClassifierConfig::default())
    }

    /// Classifiers with the configured override files
    pub fn from_config(config: &ClassifierConfig) -> Result<Self, PolicyError> {
        Ok(Self {
            environment: EnvironmentClassifier::new(&config.options(&config.environment_policy))?,
            priority: PriorityEngine::new(&config.options(&config.priority_policy))?,
            business: BusinessClassifier::new(&config.options(&config.business_policy))?,
            severity: SeverityClassifier::new(&config.options(&config.severity_policy))?,
            custom_labels: CustomLabelExtractor::new(&config.options(&config.custom_labels_policy))?,
        })
    }

    /// Every engine, in a stable order
    pub fn engines(&self) -> [&Arc<RuleEngine>; 5] {
        [
            self.environment.engine(),
            self.priority.engine(),
            self.business.engine(),
            self.severity.engine(),
            self.custom_labels.engine(),
        ]
    }

    /// Start hot reload for every engine that has an override file
    ///
    /// Engines whose watch cannot be set up keep serving their current
    /// policy; the failure is logged.
    pub fn start_hot_reload(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.engines()
            .into_iter()
            .filter(|engine| engine.policy_path().is_some())
            .filter_map(|engine| match engine.start_hot_reload(cancel.child_token()) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(policy = %engine.name(), error = %e, "policy hot reload disabled");
                    None
                }
            })
            .collect()
    }

    /// Log the active policy of every engine
    pub fn log_active_policies(&self) {
        for engine in self.engines() {
            let policy = engine.active_policy();
            info!(
                policy = %engine.name(),
                name = %policy.name(),
                version = %policy.version(),
                source = %policy.source(),
                "classification policy active"
            );
        }
    }
}
