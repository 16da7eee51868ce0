//! Environment classification (production, staging, development, ...)

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sigproc_common::crd::EnvironmentClassification;
use sigproc_policy::{PolicyError, PolicySchema, RuleEngine};
use tracing::{debug, warn};

use crate::{build_engine, Classified, EngineOptions, FALLBACK_SOURCE};

/// Engine name and `policyVersions` key
pub const POLICY_NAME: &str = "environment";

/// Environment reported when nothing could be determined
pub const UNKNOWN_ENVIRONMENT: &str = "unknown";

const BUILTIN_POLICY: &str = include_str!("../policies/environment.yaml");

/// Classifies the environment a signal's namespace belongs to
///
/// Precedence is expressed by the policy: the built-in one honors the
/// `kubernaut.ai/environment` namespace label; operators add namespace-name
/// rules in the override file.
#[derive(Debug, Clone)]
pub struct EnvironmentClassifier {
    engine: Arc<RuleEngine>,
}

impl EnvironmentClassifier {
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
    pub async fn classify(&self, facts: &Value) -> Classified<EnvironmentClassification> {
        match self.engine.evaluate(facts.clone()).await {
            Ok(decision) => {
                let environment = decision
                    .get_str("environment")
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(str::to_lowercase);
                match environment {
                    Some(environment) => {
                        let classification = EnvironmentClassification {
                            environment,
                            confidence: decision.get_f64("confidence").unwrap_or(0.0).clamp(0.0, 1.0),
                            source: decision.get_str("source").unwrap_or("policy").to_string(),
                            classified_at: Utc::now(),
                        };
                        debug!(
                            environment = %classification.environment,
                            source = %classification.source,
                            rules = ?decision.matched_rules,
                            "classified environment"
                        );
                        Classified::from_policy(classification, decision.policy_version)
                    }
                    None => {
                        warn!(policy = POLICY_NAME, "policy produced no environment, using fallback");
                        Classified::fallback(fallback())
                    }
                }
            }
            Err(e) => {
                warn!(policy = POLICY_NAME, error = %e, "environment classification failed, using fallback");
                Classified::fallback(fallback())
            }
        }
    }
}

fn schema() -> PolicySchema {
    PolicySchema::new().require("environment")
}

/// Zero-confidence classification used when the policy fails
pub fn fallback() -> EnvironmentClassification {
    EnvironmentClassification {
        environment: UNKNOWN_ENVIRONMENT.to_string(),
        confidence: 0.0,
        source: FALLBACK_SOURCE.to_string(),
        classified_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::fixtures::{context, spec};
    use crate::facts::signal_facts;
    use sigproc_common::ENVIRONMENT_LABEL;

    const CONFIGMAP_POLICY: &str = r#"
name: environment-configmap
let:
  env_label: 'namespace.labels["kubernaut.ai/environment"]'
rules:
  - name: namespace-label
    when: has(env_label)
    then: { environment: =lower(env_label), confidence: 0.95, source: namespace-labels }
  - name: prod-prefix
    when: startswith(namespace.name, "prod")
    then: { environment: production, confidence: 0.8, source: configmap }
  - name: staging-prefix
    when: startswith(namespace.name, "staging")
    then: { environment: staging, confidence: 0.8, source: configmap }
default: { environment: unknown, confidence: 0.0, source: default }
"#;

    fn facts(namespace: &str, labels: &[(&str, &str)]) -> Value {
        signal_facts(&spec(namespace, "critical"), Some(&context(namespace, labels)))
    }

    fn configmap_classifier() -> EnvironmentClassifier {
        let classifier = EnvironmentClassifier::builtin().unwrap();
        classifier.engine().load_policy(CONFIGMAP_POLICY).unwrap();
        classifier
    }

    #[tokio::test]
    async fn story_namespace_label_is_used() {
        let classifier = EnvironmentClassifier::builtin().unwrap();
        let result = classifier
            .classify(&facts("payments", &[(ENVIRONMENT_LABEL, "Production")]))
            .await;

        assert_eq!(result.value.environment, "production");
        assert_eq!(result.value.source, "namespace-labels");
        assert!(result.value.confidence >= 0.95);
        assert!(result.policy_version.is_some());
    }

    #[tokio::test]
    async fn story_name_prefix_rule_from_configmap() {
        let result = configmap_classifier()
            .classify(&facts("prod-configmap-test", &[]))
            .await;
        assert_eq!(result.value.environment, "production");
        assert_eq!(result.value.source, "configmap");
        assert_eq!(result.value.confidence, 0.8);
    }

    #[tokio::test]
    async fn story_label_wins_over_contradicting_prefix() {
        let result = configmap_classifier()
            .classify(&facts("prod-but-staging", &[(ENVIRONMENT_LABEL, "staging")]))
            .await;
        assert_eq!(result.value.environment, "staging");
        assert_eq!(result.value.source, "namespace-labels");
    }

    #[tokio::test]
    async fn story_unlabelled_namespace_defaults_to_unknown() {
        let classifier = EnvironmentClassifier::builtin().unwrap();
        let result = classifier.classify(&facts("team-a", &[])).await;
        assert_eq!(result.value.environment, "unknown");
        assert_eq!(result.value.confidence, 0.0);
        assert_eq!(result.value.source, "default");
    }

    #[tokio::test]
    async fn story_evaluation_failure_falls_back() {
        let classifier = EnvironmentClassifier::builtin().unwrap();
        classifier
            .engine()
            .load_policy(
                "name: broken\nrules:\n  - { name: r, when: namespace.name, then: { environment: x } }\n",
            )
            .unwrap();

        let result = classifier.classify(&facts("payments", &[])).await;
        assert_eq!(result.value.environment, "unknown");
        assert_eq!(result.value.source, FALLBACK_SOURCE);
        assert!(result.policy_version.is_none());
    }

    #[tokio::test]
    async fn test_override_file_loaded_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("environment.yaml");
        std::fs::write(&path, CONFIGMAP_POLICY).unwrap();

        let classifier = EnvironmentClassifier::new(&EngineOptions {
            policy_path: Some(path),
            ..Default::default()
        })
        .unwrap();
        let result = classifier.classify(&facts("staging-eu", &[])).await;
        assert_eq!(result.value.environment, "staging");
    }
}
