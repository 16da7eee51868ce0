//! Rule engine: the active policy snapshot plus bounded evaluation
//!
//! Each classifier owns one [`RuleEngine`]. Readers clone an `Arc<Policy>`
//! out of the lock and evaluate without holding it, so a reload never
//! blocks or tears an in-flight evaluation. A rejected reload keeps the
//! previous policy active.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{PolicyError, Result};
use crate::metrics::{record_evaluation, record_reload};
use crate::policy::{Decision, Policy, PolicySchema, PolicySource};

/// Default deadline for a single evaluation
pub const DEFAULT_EVALUATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Hot-swappable policy with timed evaluation
#[derive(Debug)]
pub struct RuleEngine {
    name: String,
    schema: PolicySchema,
    active: RwLock<Arc<Policy>>,
    policy_path: Option<PathBuf>,
    timeout: Duration,
}

/// Sets the flag when dropped, stopping the blocking evaluation if the
/// awaiting future goes away (deadline or caller cancellation)
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl RuleEngine {
    /// Create an engine whose initial policy is the built-in `builtin` text
    pub fn new(name: impl Into<String>, schema: PolicySchema, builtin: &str) -> Result<Self> {
        let name = name.into();
        let policy = Policy::compile(&name, builtin, PolicySource::BuiltIn, &schema)?;
        Ok(Self {
            name,
            schema,
            active: RwLock::new(Arc::new(policy)),
            policy_path: None,
            timeout: DEFAULT_EVALUATION_TIMEOUT,
        })
    }

    /// Load overrides from `path` (see [`Self::load_from_file`])
    pub fn with_policy_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy_path = Some(path.into());
        self
    }

    /// Override the evaluation deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Engine name, used in logs, metrics and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Override file, if configured
    pub fn policy_path(&self) -> Option<&Path> {
        self.policy_path.as_deref()
    }

    /// Snapshot of the active policy
    pub fn active_policy(&self) -> Arc<Policy> {
        Arc::clone(&self.active.read())
    }

    /// Version of the active policy
    pub fn policy_version(&self) -> String {
        self.active.read().version().to_string()
    }

    /// Compile `content` and make it active
    ///
    /// On error the previous policy stays active.
    pub fn load_policy(&self, content: &str) -> Result<Arc<Policy>> {
        self.install(content, PolicySource::Inline)
    }

    /// Reload from the configured policy file
    ///
    /// Returns `Ok(true)` when a new policy was activated. A missing file,
    /// no configured path, or unchanged content leaves the active policy in
    /// place and returns `Ok(false)`.
    pub fn load_from_file(&self) -> Result<bool> {
        let Some(path) = &self.policy_path else {
            return Ok(false);
        };

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(policy = %self.name, path = %path.display(), "policy file not present, keeping active policy");
                return Ok(false);
            }
            Err(source) => {
                record_reload(&self.name, "io");
                return Err(PolicyError::Io {
                    path: path.clone(),
                    source,
                });
            }
        };

        let unchanged = {
            let active = self.active.read();
            matches!(active.source(), PolicySource::File(p) if p == path)
                && active.version() == Policy::version_for(&content)
        };
        if unchanged {
            debug!(policy = %self.name, "policy file unchanged");
            return Ok(false);
        }

        self.install(&content, PolicySource::File(path.clone()))
            .map(|_| true)
    }

    fn install(&self, content: &str, source: PolicySource) -> Result<Arc<Policy>> {
        let policy = match Policy::compile(&self.name, content, source, &self.schema) {
            Ok(policy) => Arc::new(policy),
            Err(e) => {
                record_reload(&self.name, "rejected");
                warn!(
                    policy = %self.name,
                    error = %e,
                    active_version = %self.policy_version(),
                    "rejected policy, keeping previous version"
                );
                return Err(e);
            }
        };

        let previous = std::mem::replace(&mut *self.active.write(), Arc::clone(&policy));
        record_reload(&self.name, "success");
        info!(
            policy = %self.name,
            source = %policy.source(),
            version = %policy.version(),
            previous_version = %previous.version(),
            rules = policy.rule_count(),
            "activated policy"
        );
        Ok(policy)
    }

    /// Evaluate the active policy with the configured deadline
    pub async fn evaluate(&self, facts: Value) -> Result<Decision> {
        self.evaluate_with_timeout(facts, self.timeout).await
    }

    /// Evaluate the active policy with an explicit deadline
    pub async fn evaluate_with_timeout(&self, facts: Value, timeout: Duration) -> Result<Decision> {
        let policy = self.active_policy();
        let started = Instant::now();

        let result = self
            .run_bounded(timeout, move |cancel| policy.evaluate_with_cancel(&facts, cancel))
            .await;

        let label = match &result {
            Ok(d) if d.defaulted => "default",
            Ok(_) => "success",
            Err(e) => e.kind_label(),
        };
        record_evaluation(&self.name, label, started.elapsed().as_secs_f64());

        if let Ok(decision) = &result {
            if !decision.sanitized.is_clean() {
                debug!(policy = %self.name, report = ?decision.sanitized, "policy output sanitized");
            }
        }
        result
    }

    /// Run `f` on the blocking pool, cancelling it once `timeout` elapses
    async fn run_bounded<F, T>(&self, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce(&AtomicBool) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let flag = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(Arc::clone(&flag));
        let task = tokio::task::spawn_blocking(move || f(&flag));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) if join.is_panic() => Err(PolicyError::evaluation(
                &self.name,
                "policy evaluation panicked",
            )),
            Ok(Err(join)) => Err(PolicyError::evaluation(&self.name, join.to_string())),
            Err(_) => {
                warn!(policy = %self.name, timeout_ms = timeout.as_millis() as u64, "policy evaluation timed out");
                Err(PolicyError::timeout(&self.name, timeout))
            }
        }
    }
}
