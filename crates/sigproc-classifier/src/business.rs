//! Business classification: owning unit, criticality and SLA

use std::sync::Arc;

use serde_json::Value;
use sigproc_common::crd::BusinessClassification;
use sigproc_policy::{Decision, PolicyError, PolicySchema, RuleEngine};
use tracing::{debug, warn};

use crate::{build_engine, Classified, EngineOptions, FALLBACK_SOURCE};

/// Engine name and `policyVersions` key
pub const POLICY_NAME: &str = "business";

/// Valid criticality levels
pub const CRITICALITIES: &[&str] = &["critical", "high", "medium", "low"];

/// Criticality assumed when none is known
pub const DEFAULT_CRITICALITY: &str = "medium";

/// Business unit reported when none is known
pub const UNKNOWN_BUSINESS_UNIT: &str = "unknown";

const BUILTIN_POLICY: &str = include_str!("../policies/business.yaml");

/// Classifies the business context of a signal's namespace
#[derive(Debug, Clone)]
pub struct BusinessClassifier {
    engine: Arc<RuleEngine>,
}

impl BusinessClassifier {
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

    /// Classify; never fails
    pub async fn classify(&self, facts: &Value) -> Classified<BusinessClassification> {
        match self.engine.evaluate(facts.clone()).await {
            Ok(decision) => {
                let classification = from_decision(&decision);
                debug!(
                    business_unit = %classification.business_unit,
                    criticality = %classification.criticality,
                    source = %classification.source,
                    "classified business context"
                );
                Classified::from_policy(classification, decision.policy_version)
            }
            Err(e) => {
                warn!(policy = POLICY_NAME, error = %e, "business classification failed, using fallback");
                Classified::fallback(fallback())
            }
        }
    }
}

fn from_decision(decision: &Decision) -> BusinessClassification {
    let text = |key: &str| {
        decision
            .get_str(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let criticality = match text("criticality").map(|c| c.to_lowercase()) {
        Some(c) if CRITICALITIES.contains(&c.as_str()) => c,
        other => {
            if let Some(invalid) = other {
                warn!(policy = POLICY_NAME, criticality = %invalid, "invalid criticality, using default");
            }
            DEFAULT_CRITICALITY.to_string()
        }
    };

    BusinessClassification {
        business_unit: text("business_unit").unwrap_or_else(|| UNKNOWN_BUSINESS_UNIT.to_string()),
        service_owner: text("service_owner"),
        criticality,
        sla_requirement: text("sla_requirement"),
        confidence: decision.get_f64("confidence").unwrap_or(0.0).clamp(0.0, 1.0),
        source: text("source").unwrap_or_else(|| "policy".to_string()),
    }
}

fn schema() -> PolicySchema {
    PolicySchema::new()
        .require("business_unit")
        .allow("criticality", CRITICALITIES)
}

/// Zero-confidence classification used when the policy fails
pub fn fallback() -> BusinessClassification {
    BusinessClassification {
        business_unit: UNKNOWN_BUSINESS_UNIT.to_string(),
        service_owner: None,
        criticality: DEFAULT_CRITICALITY.to_string(),
        sla_requirement: None,
        confidence: 0.0,
        source: FALLBACK_SOURCE.to_string(),
    }
}
