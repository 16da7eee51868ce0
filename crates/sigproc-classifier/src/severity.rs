//! Severity normalization onto critical/high/medium/low

use std::sync::Arc;

use serde_json::Value;
use sigproc_common::crd::SeverityClassification;
use sigproc_policy::{PolicyError, PolicySchema, RuleEngine};
use tracing::{debug, warn};

use crate::{build_engine, Classified, EngineOptions, FALLBACK_SOURCE};

/// Engine name and `policyVersions` key
pub const POLICY_NAME: &str = "severity";

/// Normalized severity levels
pub const SEVERITIES: &[&str] = &["critical", "high", "medium", "low"];

/// Severity assumed for anything that cannot be mapped
pub const CONSERVATIVE_SEVERITY: &str = "critical";

const BUILTIN_POLICY: &str = include_str!("../policies/severity.yaml");

/// Maps vendor severities (`sev1`, `P2`, `warning`, ...) to the normalized scale
#[derive(Debug, Clone)]
pub struct SeverityClassifier {
    engine: Arc<RuleEngine>,
}

impl SeverityClassifier {
    /// Classifier running the built-in policy
    pub fn builtin() -> Result<Self, PolicyError> {
        Self::new(&EngineOptions::default())
    }

    /// Classifier with an optional override file
    pub fn new(options: &EngineOptions) -> Result<Self, PolicyError> {
        Ok(Self {
            engine: build_engine(POLICY_NAME, schema(), BUILTIN_POLICY, options)?,
        })
    }

    /// The underlying rule engine
    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    /// Normalize `signal.severity` from `facts`; never fails
    pub async fn classify(&self, facts: &Value) -> Classified<SeverityClassification> {
        let original = facts
            .pointer("/signal/severity")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let decision = match self.engine.evaluate(facts.clone()).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(policy = POLICY_NAME, error = %e, severity = %original, "severity classification failed, using conservative default");
                return Classified::fallback(fallback(original));
            }
        };

        let normalized = decision.get_str("severity").map(str::to_lowercase);
        let Some(severity) = normalized.filter(|s| SEVERITIES.contains(&s.as_str())) else {
            warn!(policy = POLICY_NAME, severity = %original, "policy produced an invalid severity, using conservative default");
            return Classified::fallback(fallback(original));
        };

        debug!(original = %original, normalized = %severity, "normalized severity");
        Classified::from_policy(
            SeverityClassification {
                severity,
                original_severity: original,
                source: decision.get_str("source").unwrap_or("policy").to_string(),
            },
            decision.policy_version,
        )
    }
}

fn schema() -> PolicySchema {
    PolicySchema::new()
        .require("severity")
        .allow("severity", SEVERITIES)
}

/// Conservative classification used when the policy fails
pub fn fallback(original: String) -> SeverityClassification {
    SeverityClassification {
        severity: CONSERVATIVE_SEVERITY.to_string(),
        original_severity: original,
        source: FALLBACK_SOURCE.to_string(),
    }
}
