//! Fact documents handed to classification policies
//!
//! Every policy sees the same roots so operators can write rules against
//! any of them:
//!
//! - `namespace`: `{name, labels, annotations}`
//! - `workload`: `{kind, name, labels, annotations}` of the target
//! - `signal`: `{name, type, source, severity, labels, annotations}`
//! - `owners`: owner-chain kinds, immediate owner first
//! - `detected`: detected operational features
//!
//! Classifiers add their own derived roots (`environment` for priority).

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use sigproc_common::crd::{KubernetesContext, SignalRecordSpec};

/// Build the shared fact document for one signal
pub fn signal_facts(spec: &SignalRecordSpec, context: Option<&KubernetesContext>) -> Value {
    let mut facts = Map::new();
    facts.insert("namespace".into(), namespace_facts(spec, context));
    facts.insert("workload".into(), workload_facts(spec, context));
    facts.insert(
        "signal".into(),
        json!({
            "name": spec.name,
            "type": spec.signal_type,
            "source": spec.source,
            "severity": spec.severity,
            "labels": spec.labels,
            "annotations": spec.annotations,
        }),
    );

    if let Some(ctx) = context {
        facts.insert(
            "owners".into(),
            Value::Array(
                ctx.owner_chain
                    .iter()
                    .map(|o| Value::String(o.kind.clone()))
                    .collect(),
            ),
        );
        if let Some(detected) = &ctx.detected_labels {
            facts.insert(
                "detected".into(),
                serde_json::to_value(detected).unwrap_or(Value::Null),
            );
        }
    }

    Value::Object(facts)
}

fn namespace_facts(spec: &SignalRecordSpec, context: Option<&KubernetesContext>) -> Value {
    match context.and_then(|c| c.namespace.as_ref()) {
        Some(ns) => json!({
            "name": ns.name,
            "labels": ns.labels,
            "annotations": ns.annotations,
        }),
        // the name is still known from the target reference
        None => json!({
            "name": spec.target_resource.namespace,
            "labels": {},
            "annotations": {},
        }),
    }
}

fn workload_facts(spec: &SignalRecordSpec, context: Option<&KubernetesContext>) -> Value {
    let empty = BTreeMap::new();
    let labels = context
        .and_then(KubernetesContext::workload_labels)
        .unwrap_or(&empty);
    let annotations = context.and_then(workload_annotations).unwrap_or(&empty);

    json!({
        "kind": spec.target_resource.kind,
        "name": spec.target_resource.name,
        "labels": labels,
        "annotations": annotations,
    })
}

fn workload_annotations(ctx: &KubernetesContext) -> Option<&BTreeMap<String, String>> {
    if let Some(pod) = &ctx.pod {
        return Some(&pod.annotations);
    }
    if let Some(d) = &ctx.deployment {
        return Some(&d.annotations);
    }
    if let Some(s) = &ctx.stateful_set {
        return Some(&s.annotations);
    }
    ctx.service.as_ref().map(|s| &s.annotations)
}

/// Insert an extra root into a fact document
pub(crate) fn with_root(mut facts: Value, key: &str, value: Value) -> Value {
    if let Value::Object(map) = &mut facts {
        map.insert(key.to_string(), value);
    }
    facts
}
