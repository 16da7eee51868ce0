//! Priority assignment from normalized severity and environment

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sigproc_common::crd::PriorityAssignment;
use sigproc_policy::{PolicyError, PolicySchema, RuleEngine};
use tracing::{debug, warn};

use crate::facts::with_root;
use crate::{build_engine, Classified, EngineOptions, FALLBACK_SOURCE};

/// Engine name and `policyVersions` key
pub const POLICY_NAME: &str = "priority";

/// Valid priority tiers, most urgent first
pub const PRIORITIES: &[&str] = &["P0", "P1", "P2", "P3"];

/// Tier used when the policy fails
pub const FALLBACK_PRIORITY: &str = "P2";

const BUILTIN_POLICY: &str = include_str!("../policies/priority.yaml");

/// Assigns a P0..P3 priority
///
/// The built-in policy sums a severity score and an environment score;
/// see `policies/priority.yaml`.
#[derive(Debug, Clone)]
pub struct PriorityEngine {
    engine: Arc<RuleEngine>,
}

impl PriorityEngine {
    /// Engine running the built-in policy
    pub fn builtin() -> Result<Self, PolicyError> {
        Self::new(&EngineOptions::default())
    }

    /// Engine with an optional override file
    pub fn new(options: &EngineOptions) -> Result<Self, PolicyError> {
        Ok(Self {
            engine: build_engine(POLICY_NAME, schema(), BUILTIN_POLICY, options)?,
        })
    }

    /// The underlying rule engine
    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    /// Assign a priority; never fails
    ///
    /// `severity` is the normalized severity, `environment` the classified
    /// environment. Both are exposed to the policy, overriding the raw
    /// severity in `signal.severity`.
    pub async fn assign(&self, facts: &Value, severity: &str, environment: &str) -> Classified<PriorityAssignment> {
        let mut facts = with_root(facts.clone(), "environment", Value::String(environment.to_string()));
        if let Some(signal) = facts.get_mut("signal").and_then(Value::as_object_mut) {
            signal.insert("severity".into(), Value::String(severity.to_string()));
        }

        let decision = match self.engine.evaluate(facts).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(policy = POLICY_NAME, error = %e, "priority assignment failed, using fallback");
                return Classified::fallback(fallback());
            }
        };

        let Some(priority) = decision.get_str("priority").filter(|p| PRIORITIES.contains(p)) else {
            warn!(
                policy = POLICY_NAME,
                priority = ?decision.outputs.get("priority"),
                "policy produced an invalid priority, using fallback"
            );
            return Classified::fallback(fallback());
        };

        debug!(%priority, %severity, %environment, rules = ?decision.matched_rules, "assigned priority");
        Classified::from_policy(
            PriorityAssignment {
                priority: priority.to_string(),
                confidence: decision.get_f64("confidence").unwrap_or(0.0).clamp(0.0, 1.0),
                source: decision.get_str("source").unwrap_or("policy").to_string(),
                assigned_at: Utc::now(),
            },
            decision.policy_version,
        )
    }
}

fn schema() -> PolicySchema {
    PolicySchema::new()
        .require("priority")
        .allow("priority", PRIORITIES)
}

/// Zero-confidence assignment used when the policy fails
pub fn fallback() -> PriorityAssignment {
    PriorityAssignment {
        priority: FALLBACK_PRIORITY.to_string(),
        confidence: 0.0,
        source: FALLBACK_SOURCE.to_string(),
        assigned_at: Utc::now(),
    }
}
