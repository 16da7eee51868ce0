//! Custom label extraction into `customLabels`

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use sigproc_policy::sanitize::MAX_VALUE_LEN;
use sigproc_policy::{EvaluationMode, PolicyError, PolicySchema, RuleEngine};
use tracing::{debug, warn};

use crate::{build_engine, Classified, EngineOptions};

/// Engine name and `policyVersions` key
pub const POLICY_NAME: &str = "custom_labels";

const BUILTIN_POLICY: &str = include_str!("../policies/custom_labels.yaml");

/// Runs the collect-mode custom label policy
///
/// Key and value bounds plus reserved-prefix stripping are applied by the
/// engine; this type coerces values into lists of strings.
#[derive(Debug, Clone)]
pub struct CustomLabelExtractor {
    engine: Arc<RuleEngine>,
}

impl CustomLabelExtractor {
    /// Extractor running the built-in policy
    pub fn builtin() -> Result<Self, PolicyError> {
        Self::new(&EngineOptions::default())
    }

    /// Extractor with an optional override file
    pub fn new(options: &EngineOptions) -> Result<Self, PolicyError> {
        Ok(Self {
            engine: build_engine(POLICY_NAME, schema(), BUILTIN_POLICY, options)?,
        })
    }

    /// The underlying rule engine
    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    /// Extract labels; failures yield an empty map
    pub async fn extract(&self, facts: &Value) -> Classified<BTreeMap<String, Vec<String>>> {
        match self.engine.evaluate(facts.clone()).await {
            Ok(decision) => {
                let labels: BTreeMap<_, _> = decision
                    .outputs
                    .iter()
                    .filter_map(|(key, value)| {
                        let values = coerce_values(value);
                        (!values.is_empty()).then(|| (key.clone(), values))
                    })
                    .collect();
                debug!(keys = labels.len(), rules = ?decision.matched_rules, "extracted custom labels");
                Classified::from_policy(labels, decision.policy_version)
            }
            Err(PolicyError::NoMatch { .. }) => {
                Classified::from_policy(BTreeMap::new(), self.engine.policy_version())
            }
            Err(e) => {
                warn!(policy = POLICY_NAME, error = %e, "custom label extraction failed");
                Classified::fallback(BTreeMap::new())
            }
        }
    }
}

fn schema() -> PolicySchema {
    PolicySchema::new().mode(EvaluationMode::Collect)
}

/// Flatten a decision value into label values
///
/// Strings pass through, numbers and booleans are stringified, lists are
/// flattened one level; nulls, maps and duplicates are dropped.
fn coerce_values(value: &Value) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |v: &Value| {
        let s = match v {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return,
        };
        let s: String = s.chars().take(MAX_VALUE_LEN).collect();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    };
    match value {
        Value::Array(items) => items.iter().for_each(&mut push),
        other => push(other),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::fixtures::{context, spec, with_pod_labels};
    use crate::facts::signal_facts;
    use serde_json::json;
    use sigproc_policy::sanitize::{is_reserved_key, MAX_KEYS, MAX_KEY_LEN};

    #[tokio::test]
    async fn story_builtin_policy_collects_from_all_sources() {
        let ctx = with_pod_labels(
            context("payments", &[("team", "checkout")]),
            &[("app.kubernetes.io/name", "api"), ("team", "platform"), ("tier", "backend")],
        );
        let mut spec = spec("payments", "critical");
        spec.labels.insert("component".into(), "database".into());

        let extractor = CustomLabelExtractor::builtin().unwrap();
        let labels = extractor.extract(&signal_facts(&spec, Some(&ctx))).await.value;

        assert_eq!(labels["team"], vec!["checkout", "platform"]);
        assert_eq!(labels["app"], vec!["api"]);
        assert_eq!(labels["tier"], vec!["backend"]);
        assert_eq!(labels["component"], vec!["database"]);
    }

    #[tokio::test]
    async fn story_nothing_matches_yields_empty_map() {
        let extractor = CustomLabelExtractor::builtin().unwrap();
        let result = extractor
            .extract(&signal_facts(&spec("payments", "critical"), None))
            .await;
        assert!(result.value.is_empty());
        assert!(result.policy_version.is_some());
    }

    #[tokio::test]
    async fn story_hostile_policy_output_is_bounded() {
        // one rule emitting 20 keys with over-long names and values, plus reserved keys
        let mut then = String::new();
        for i in 0..20 {
            then.push_str(&format!(
                "      {}{i:02}: '=[\"{}\"]'\n",
                "k".repeat(80),
                "v".repeat(150)
            ));
        }
        then.push_str("      kubernaut.ai/override: '=[\"x\"]'\n");
        then.push_str("      system: '=[\"x\"]'\n");
        let policy = format!(
            "name: hostile\nmode: collect\nrules:\n  - name: flood\n    when: \"true\"\n    then:\n{then}"
        );

        let extractor = CustomLabelExtractor::builtin().unwrap();
        extractor.engine().load_policy(&policy).unwrap();
        let labels = extractor.extract(&json!({})).await.value;

        assert!(labels.len() <= MAX_KEYS);
        assert!(!labels.is_empty());
        for (key, values) in &labels {
            assert!(key.chars().count() <= MAX_KEY_LEN, "{key}");
            assert!(!is_reserved_key(key));
            assert!(values.iter().all(|v| v.chars().count() <= MAX_VALUE_LEN));
        }
    }

    #[tokio::test]
    async fn story_unset_labels_leave_room_for_later_ones() {
        // five rules reading absent facts come first, then ten real labels
        let mut then = String::new();
        for i in 0..5 {
            then.push_str(&format!("      unset{i}: '=[workload.labels[\"absent{i}\"]]'\n"));
        }
        for i in 0..10 {
            then.push_str(&format!("      label{i}: '=[\"value{i}\"]'\n"));
        }
        let policy = format!(
            "name: sparse\nmode: collect\nrules:\n  - name: all\n    when: \"true\"\n    then:\n{then}"
        );

        let extractor = CustomLabelExtractor::builtin().unwrap();
        extractor.engine().load_policy(&policy).unwrap();
        let labels = extractor.extract(&json!({"workload": {"labels": {}}})).await.value;

        assert_eq!(labels.len(), 10);
        assert_eq!(labels["label9"], vec!["value9"]);
        assert!(labels.keys().all(|k| k.starts_with("label")));
    }

    #[test]
    fn test_value_coercion() {
        assert_eq!(coerce_values(&json!("a")), vec!["a"]);
        assert_eq!(coerce_values(&json!(["a", 1, true, null, "a"])), vec!["a", "1", "true"]);
        assert!(coerce_values(&json!(null)).is_empty());
        assert!(coerce_values(&json!({"nested": "map"})).is_empty());
    }

    #[test]
    fn test_first_mode_policy_is_rejected() {
        let extractor = CustomLabelExtractor::builtin().unwrap();
        assert!(extractor
            .engine()
            .load_policy("name: x\ndefault: { team: '=[\"a\"]' }\n")
            .is_err());
    }
}
