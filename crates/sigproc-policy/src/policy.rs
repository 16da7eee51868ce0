//! Policy documents: parsing, compilation and evaluation
//!
//! A policy is a YAML decision table. Rules are tried top to bottom; in
//! `first` mode the first matching rule decides, in `collect` mode every
//! matching rule contributes. The optional `default` applies only when no
//! rule matched.
//!
//! Output values that are YAML strings starting with `=` are expressions;
//! every other value is a literal.
//!
//! ```yaml
//! name: environment
//! mode: first
//! let:
//!   env_label: 'namespace.labels["kubernaut.ai/environment"]'
//! rules:
//!   - name: namespace-label
//!     when: has(env_label)
//!     then:
//!       environment: =lower(env_label)
//!       confidence: 0.95
//!       source: namespace-labels
//! default:
//!   environment: unknown
//!   confidence: 0.0
//!   source: default
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{PolicyError, Result};
use crate::expr::{parse, Evaluator, Expr, ExprError, Scope, DEFAULT_STEP_BUDGET};
use crate::sanitize::{sanitize_output, SanitizeReport};

/// Prefix marking an output string as an expression
const EXPRESSION_PREFIX: char = '=';

/// Length of the hex version string derived from the policy text
const VERSION_LEN: usize = 12;

// =============================================================================
// Document model
// =============================================================================

/// How matching rules combine into a decision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    /// The first matching rule decides
    #[default]
    First,
    /// All matching rules contribute; list values are merged, the first
    /// scalar value for a key wins
    Collect,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDocument {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    mode: EvaluationMode,
    #[serde(default, rename = "let")]
    bindings: IndexMap<String, String>,
    #[serde(default)]
    rules: Vec<RuleDocument>,
    #[serde(default)]
    default: Option<IndexMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDocument {
    name: String,
    when: String,
    then: IndexMap<String, Value>,
}

/// Where a compiled policy came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    /// Compiled into the binary
    BuiltIn,
    /// Loaded from a file
    File(PathBuf),
    /// Supplied directly through [`crate::RuleEngine::load_policy`]
    Inline,
}

impl std::fmt::Display for PolicySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuiltIn => write!(f, "built-in"),
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::Inline => write!(f, "inline"),
        }
    }
}

// =============================================================================
// Schema
// =============================================================================

/// Per-classifier expectations checked when a policy is compiled
#[derive(Debug, Clone, Default)]
pub struct PolicySchema {
    required: Vec<String>,
    allowed: BTreeMap<String, Vec<String>>,
    allowed_modes: Option<Vec<EvaluationMode>>,
}

impl PolicySchema {
    /// Schema with no requirements
    pub fn new() -> Self {
        Self::default()
    }

    /// Every rule and the default must produce `key` (first mode only)
    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required.push(key.into());
        self
    }

    /// Literal values for `key` must be one of `values`
    pub fn allow(mut self, key: impl Into<String>, values: &[&str]) -> Self {
        self.allowed
            .insert(key.into(), values.iter().map(|v| v.to_string()).collect());
        self
    }

    /// Restrict the evaluation mode
    pub fn mode(mut self, mode: EvaluationMode) -> Self {
        self.allowed_modes.get_or_insert_with(Vec::new).push(mode);
        self
    }

    /// Values permitted for `key`, if restricted
    pub fn allowed_values(&self, key: &str) -> Option<&[String]> {
        self.allowed.get(key).map(Vec::as_slice)
    }

    fn check_outputs(&self, policy: &str, owner: &str, outputs: &[(String, Expr)], mode: EvaluationMode) -> Result<()> {
        if mode == EvaluationMode::First {
            for key in &self.required {
                if !outputs.iter().any(|(k, _)| k == key) {
                    return Err(PolicyError::validation(
                        policy,
                        format!("{owner} does not produce required output '{key}'"),
                    ));
                }
            }
        }
        for (key, expr) in outputs {
            let (Some(allowed), Expr::Literal(Value::String(literal))) = (self.allowed.get(key), expr)
            else {
                continue;
            };
            if !allowed.contains(literal) {
                return Err(PolicyError::validation(
                    policy,
                    format!(
                        "{owner} sets '{key}' to '{literal}', expected one of {}",
                        allowed.join(", ")
                    ),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Compiled policy
// =============================================================================

#[derive(Debug)]
struct CompiledRule {
    name: String,
    when: Expr,
    outputs: Vec<(String, Expr)>,
}

/// A validated, immutable policy ready for evaluation
#[derive(Debug)]
pub struct Policy {
    name: String,
    description: Option<String>,
    mode: EvaluationMode,
    version: String,
    source: PolicySource,
    bindings: Vec<(String, Expr)>,
    rules: Vec<CompiledRule>,
    default: Option<Vec<(String, Expr)>>,
    step_budget: u64,
}

/// Result of evaluating a policy
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Sanitized outputs in evaluation order
    pub outputs: IndexMap<String, Value>,
    /// Names of the rules that matched, in order
    pub matched_rules: Vec<String>,
    /// True when the default branch produced the outputs
    pub defaulted: bool,
    /// Version of the policy that produced the decision
    pub policy_version: String,
    /// What output validation removed or shortened
    pub sanitized: SanitizeReport,
}

impl Decision {
    /// String output, if present and a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.outputs.get(key).and_then(Value::as_str)
    }

    /// Numeric output, if present and a number
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.outputs.get(key).and_then(Value::as_f64)
    }
}

impl Policy {
    /// Compile and validate a policy document
    ///
    /// `engine` names the owning engine in error messages.
    pub fn compile(engine: &str, text: &str, source: PolicySource, schema: &PolicySchema) -> Result<Self> {
        let doc: PolicyDocument =
            serde_yaml::from_str(text).map_err(|e| PolicyError::parse(engine, e.to_string()))?;

        if doc.name.trim().is_empty() {
            return Err(PolicyError::validation(engine, "policy name must not be empty"));
        }
        if doc.rules.is_empty() && doc.default.is_none() {
            return Err(PolicyError::validation(
                engine,
                "policy must define at least one rule or a default",
            ));
        }
        if let Some(modes) = &schema.allowed_modes {
            if !modes.contains(&doc.mode) {
                return Err(PolicyError::validation(
                    engine,
                    format!("evaluation mode {:?} is not supported here", doc.mode),
                ));
            }
        }

        let bindings = compile_bindings(engine, &doc.bindings)?;

        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(doc.rules.len());
        for rule in doc.rules {
            if rule.name.trim().is_empty() {
                return Err(PolicyError::validation(engine, "rule name must not be empty"));
            }
            if !seen.insert(rule.name.clone()) {
                return Err(PolicyError::validation(
                    engine,
                    format!("duplicate rule name '{}'", rule.name),
                ));
            }
            let when = parse(&rule.when)
                .map_err(|e| PolicyError::parse(engine, format!("rule '{}' when: {e}", rule.name)))?;
            let owner = format!("rule '{}'", rule.name);
            let outputs = compile_outputs(engine, &owner, rule.then)?;
            schema.check_outputs(engine, &owner, &outputs, doc.mode)?;
            rules.push(CompiledRule {
                name: rule.name,
                when,
                outputs,
            });
        }

        let default = match doc.default {
            Some(map) => {
                let outputs = compile_outputs(engine, "default", map)?;
                schema.check_outputs(engine, "default", &outputs, doc.mode)?;
                Some(outputs)
            }
            None => None,
        };

        Ok(Self {
            name: doc.name,
            description: doc.description,
            mode: doc.mode,
            version: version_of(text),
            source,
            bindings,
            rules,
            default,
            step_budget: DEFAULT_STEP_BUDGET,
        })
    }

    /// Policy name from the document
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Policy description from the document
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Evaluation mode
    pub fn mode(&self) -> EvaluationMode {
        self.mode
    }

    /// Content hash of the source text
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Version a policy compiled from `text` would carry
    pub fn version_for(text: &str) -> String {
        version_of(text)
    }

    /// Where the policy was loaded from
    pub fn source(&self) -> &PolicySource {
        &self.source
    }

    /// Number of rules
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate against `facts`
    pub fn evaluate(&self, facts: &Value) -> Result<Decision> {
        self.evaluate_with_cancel(facts, &AtomicBool::new(false))
    }

    /// Evaluate against `facts`, stopping early once `cancel` is set
    pub fn evaluate_with_cancel(&self, facts: &Value, cancel: &AtomicBool) -> Result<Decision> {
        let mut evaluator = Evaluator::new(self.step_budget).with_cancel(cancel);
        let fail = |what: &str, e: ExprError| PolicyError::evaluation(&self.name, format!("{what}: {e}"));

        let mut scope_values: IndexMap<String, Value> = IndexMap::new();
        for (name, expr) in &self.bindings {
            let value = evaluator
                .eval(expr, &Scope::new(facts, &scope_values))
                .map_err(|e| fail(&format!("let '{name}'"), e))?;
            scope_values.insert(name.clone(), value);
        }
        let scope = Scope::new(facts, &scope_values);

        let mut outputs: IndexMap<String, Value> = IndexMap::new();
        let mut matched_rules = Vec::new();

        for rule in &self.rules {
            let owner = format!("rule '{}'", rule.name);
            if !evaluator
                .eval_condition(&rule.when, &scope)
                .map_err(|e| fail(&owner, e))?
            {
                continue;
            }
            matched_rules.push(rule.name.clone());
            for (key, expr) in &rule.outputs {
                let value = evaluator
                    .eval(expr, &scope)
                    .map_err(|e| fail(&format!("{owner} output '{key}'"), e))?;
                merge_output(&mut outputs, key, value);
            }
            if self.mode == EvaluationMode::First {
                break;
            }
        }

        let defaulted = matched_rules.is_empty();
        if defaulted {
            let Some(default) = &self.default else {
                return Err(PolicyError::no_match(&self.name));
            };
            for (key, expr) in default {
                let value = evaluator
                    .eval(expr, &scope)
                    .map_err(|e| fail(&format!("default output '{key}'"), e))?;
                outputs.insert(key.clone(), value);
            }
        }

        let (outputs, sanitized) = sanitize_output(outputs);
        Ok(Decision {
            outputs,
            matched_rules,
            defaulted,
            policy_version: self.version.clone(),
            sanitized,
        })
    }
}

fn merge_output(outputs: &mut IndexMap<String, Value>, key: &str, value: Value) {
    match (outputs.get_mut(key), value) {
        (None, value) => {
            outputs.insert(key.to_string(), value);
        }
        (Some(Value::Array(existing)), Value::Array(items)) => {
            for item in items {
                if !existing.contains(&item) {
                    existing.push(item);
                }
            }
        }
        (Some(_), _) => {}
    }
}

fn compile_bindings(engine: &str, bindings: &IndexMap<String, String>) -> Result<Vec<(String, Expr)>> {
    let names: Vec<&str> = bindings.keys().map(String::as_str).collect();
    let mut compiled = Vec::with_capacity(bindings.len());

    for (index, (name, src)) in bindings.iter().enumerate() {
        if !is_identifier(name) {
            return Err(PolicyError::validation(
                engine,
                format!("let name '{name}' is not a valid identifier"),
            ));
        }
        let expr = parse(src).map_err(|e| PolicyError::parse(engine, format!("let '{name}': {e}")))?;
        if let Some(later) = expr
            .identifiers()
            .into_iter()
            .find(|id| names[index..].contains(id))
        {
            return Err(PolicyError::validation(
                engine,
                format!("let '{name}' refers to '{later}', which is not defined before it"),
            ));
        }
        compiled.push((name.clone(), expr));
    }
    Ok(compiled)
}

fn compile_outputs(engine: &str, owner: &str, map: IndexMap<String, Value>) -> Result<Vec<(String, Expr)>> {
    if map.is_empty() {
        return Err(PolicyError::validation(engine, format!("{owner} has no outputs")));
    }
    map.into_iter()
        .map(|(key, value)| {
            if key.trim().is_empty() {
                return Err(PolicyError::validation(engine, format!("{owner} has an empty output key")));
            }
            let expr = match value {
                Value::String(s) if s.starts_with(EXPRESSION_PREFIX) => {
                    parse(&s[EXPRESSION_PREFIX.len_utf8()..]).map_err(|e| {
                        PolicyError::parse(engine, format!("{owner} output '{key}': {e}"))
                    })?
                }
                literal => Expr::Literal(literal),
            };
            Ok((key, expr))
        })
        .collect()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !matches!(name, "true" | "false" | "null" | "in")
}

fn version_of(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..VERSION_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ENVIRONMENT: &str = r#"
name: environment
let:
  env_label: 'namespace.labels["kubernaut.ai/environment"]'
rules:
  - name: namespace-label
    when: has(env_label)
    then:
      environment: =lower(env_label)
      confidence: 0.95
      source: namespace-labels
  - name: prod-prefix
    when: startswith(namespace.name, "prod")
    then:
      environment: production
      confidence: 0.8
      source: configmap
default:
  environment: unknown
  confidence: 0.0
  source: default
"#;

    fn compile(text: &str) -> Result<Policy> {
        Policy::compile("test", text, PolicySource::Inline, &PolicySchema::new())
    }

    fn facts(name: &str, labels: Value) -> Value {
        json!({ "namespace": { "name": name, "labels": labels } })
    }

    #[test]
    fn test_first_match_wins_in_document_order() {
        let policy = compile(ENVIRONMENT).unwrap();
        let decision = policy
            .evaluate(&facts("prod-but-staging", json!({"kubernaut.ai/environment": "Staging"})))
            .unwrap();

        assert_eq!(decision.get_str("environment"), Some("staging"));
        assert_eq!(decision.get_str("source"), Some("namespace-labels"));
        assert_eq!(decision.matched_rules, vec!["namespace-label"]);
        assert!(!decision.defaulted);
    }

    #[test]
    fn test_prefix_rule_applies_without_label() {
        let policy = compile(ENVIRONMENT).unwrap();
        let decision = policy.evaluate(&facts("prod-configmap-test", json!({}))).unwrap();
        assert_eq!(decision.get_str("environment"), Some("production"));
        assert_eq!(decision.get_str("source"), Some("configmap"));
        assert_eq!(decision.get_f64("confidence"), Some(0.8));
    }

    #[test]
    fn test_default_applies_when_nothing_matches() {
        let policy = compile(ENVIRONMENT).unwrap();
        let decision = policy.evaluate(&facts("team-a", json!({}))).unwrap();
        assert!(decision.defaulted);
        assert_eq!(decision.get_str("environment"), Some("unknown"));
        assert_eq!(decision.get_f64("confidence"), Some(0.0));
    }

    #[test]
    fn test_no_match_without_default_is_an_error() {
        let policy = compile(
            r#"
name: strict
rules:
  - name: never
    when: "false"
    then: { x: 1 }
"#,
        )
        .unwrap();
        assert!(matches!(
            policy.evaluate(&json!({})),
            Err(PolicyError::NoMatch { .. })
        ));
    }

    #[test]
    fn test_collect_mode_merges_lists_and_keeps_first_scalar() {
        let policy = compile(
            r#"
name: labels
mode: collect
rules:
  - name: team
    when: has(namespace.labels["team"])
    then:
      team: '=[namespace.labels["team"]]'
      owner: first
  - name: tier
    when: "true"
    then:
      team: '=["platform", namespace.labels["team"]]'
      owner: second
      tier: '=["gold"]'
"#,
        )
        .unwrap();
        let decision = policy
            .evaluate(&facts("payments", json!({"team": "checkout"})))
            .unwrap();

        assert_eq!(decision.outputs["team"], json!(["checkout", "platform"]));
        assert_eq!(decision.get_str("owner"), Some("first"));
        assert_eq!(decision.outputs["tier"], json!(["gold"]));
        assert_eq!(decision.matched_rules, vec!["team", "tier"]);
    }

    #[test]
    fn test_decision_outputs_are_sanitized() {
        let policy = compile(
            r#"
name: labels
mode: collect
rules:
  - name: everything
    when: "true"
    then:
      kubernaut.ai/override: '=["x"]'
      team: '=["checkout"]'
"#,
        )
        .unwrap();
        let decision = policy.evaluate(&json!({})).unwrap();
        assert!(!decision.outputs.contains_key("kubernaut.ai/override"));
        assert_eq!(decision.sanitized.reserved, vec!["kubernaut.ai/override"]);
    }

    #[test]
    fn test_version_is_stable_content_hash() {
        let a = compile(ENVIRONMENT).unwrap();
        let b = compile(ENVIRONMENT).unwrap();
        let c = compile(&ENVIRONMENT.replace("0.95", "0.96")).unwrap();
        assert_eq!(a.version(), b.version());
        assert_ne!(a.version(), c.version());
        assert_eq!(a.version().len(), VERSION_LEN);
    }

    #[test]
    fn test_evaluation_type_error_names_the_rule() {
        let policy = compile(
            r#"
name: broken
rules:
  - name: bad-condition
    when: namespace.name
    then: { x: 1 }
"#,
        )
        .unwrap();
        let err = policy.evaluate(&facts("ns", json!({}))).unwrap_err();
        assert!(err.to_string().contains("bad-condition"));
        assert!(matches!(err, PolicyError::Evaluation { .. }));
    }

    #[test]
    fn test_let_bindings_see_earlier_bindings() {
        let policy = compile(
            r#"
name: scores
let:
  a: "2"
  b: a * 3
rules:
  - name: total
    when: b == 6
    then: { total: =a + b }
"#,
        )
        .unwrap();
        assert_eq!(policy.evaluate(&json!({})).unwrap().outputs["total"], json!(8));
    }

    mod validation {
        use super::*;

        #[test]
        fn test_invalid_yaml_is_a_parse_error() {
            assert!(matches!(compile("name: [unclosed"), Err(PolicyError::Parse { .. })));
        }

        #[test]
        fn test_invalid_condition_is_a_parse_error() {
            let err = compile(
                r#"
name: x
rules:
  - name: r
    when: "has(a"
    then: { k: v }
"#,
            )
            .unwrap_err();
            assert!(matches!(err, PolicyError::Parse { .. }));
            assert!(err.to_string().contains("rule 'r'"));
        }

        #[test]
        fn test_unknown_fields_are_rejected() {
            assert!(compile("name: x\nrulez: []\ndefault: { k: v }\n").is_err());
        }

        #[test]
        fn test_empty_policy_is_rejected() {
            assert!(matches!(compile("name: x\n"), Err(PolicyError::Validation { .. })));
        }

        #[test]
        fn test_duplicate_rule_names_are_rejected() {
            let err = compile(
                r#"
name: x
rules:
  - { name: r, when: "true", then: { k: v } }
  - { name: r, when: "false", then: { k: v } }
"#,
            )
            .unwrap_err();
            assert!(err.to_string().contains("duplicate rule name 'r'"));
        }

        #[test]
        fn test_forward_let_reference_is_rejected() {
            let err = compile(
                r#"
name: x
let:
  a: b + 1
  b: "1"
default: { k: =a }
"#,
            )
            .unwrap_err();
            assert!(err.to_string().contains("refers to 'b'"));
        }

        #[test]
        fn test_self_referencing_let_is_rejected() {
            assert!(compile("name: x\nlet:\n  a: a + 1\ndefault: { k: =a }\n").is_err());
        }

        #[test]
        fn test_schema_requires_outputs_in_first_mode() {
            let schema = PolicySchema::new().require("priority");
            let err = Policy::compile(
                "priority",
                "name: p\nrules:\n  - { name: r, when: \"true\", then: { other: 1 } }\ndefault: { priority: P2 }\n",
                PolicySource::Inline,
                &schema,
            )
            .unwrap_err();
            assert!(err.to_string().contains("required output 'priority'"));
        }

        #[test]
        fn test_schema_rejects_disallowed_literal() {
            let schema = PolicySchema::new().allow("priority", &["P0", "P1", "P2", "P3"]);
            let err = Policy::compile(
                "priority",
                "name: p\ndefault: { priority: P9 }\n",
                PolicySource::Inline,
                &schema,
            )
            .unwrap_err();
            assert!(err.to_string().contains("expected one of P0, P1, P2, P3"));
        }

        #[test]
        fn test_schema_restricts_mode() {
            let schema = PolicySchema::new().mode(EvaluationMode::Collect);
            assert!(Policy::compile("labels", "name: l\ndefault: { k: v }\n", PolicySource::Inline, &schema).is_err());
        }
    }
}
