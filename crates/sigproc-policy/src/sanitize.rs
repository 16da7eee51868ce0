//! Output validation applied to every policy decision
//!
//! Policy authors control decision keys and values, so bounds and the
//! reserved label namespaces are enforced here rather than trusted:
//!
//! 1. keys in a reserved namespace are stripped, as are keys whose value is
//!    `null` or a list of nothing but `null`s
//! 2. keys longer than [`MAX_KEY_LEN`] are truncated; a truncated key that
//!    collides with one already kept is dropped
//! 3. string values longer than [`MAX_VALUE_LEN`] are truncated (recursively
//!    inside lists and maps)
//! 4. at most [`MAX_KEYS`] keys are kept, first in evaluation order

use indexmap::IndexMap;
use serde_json::Value;

/// Maximum number of keys in a decision
pub const MAX_KEYS: usize = 10;

/// Maximum key length in characters
pub const MAX_KEY_LEN: usize = 63;

/// Maximum string value length in characters
pub const MAX_VALUE_LEN: usize = 100;

/// Label namespaces reserved for the platform
///
/// A key is reserved when its prefix (the part before `/`) equals one of
/// these domains or is a subdomain of it. A bare `system` key and the
/// `system/` prefix are reserved as well.
pub const RESERVED_DOMAINS: &[&str] = &["kubernaut.ai", "kubernetes.io", "k8s.io"];

/// What sanitizing removed or shortened
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SanitizeReport {
    /// Keys stripped as reserved
    pub reserved: Vec<String>,
    /// Number of keys truncated to [`MAX_KEY_LEN`]
    pub truncated_keys: usize,
    /// Number of string values truncated to [`MAX_VALUE_LEN`]
    pub truncated_values: usize,
    /// Keys dropped by collision or the [`MAX_KEYS`] limit
    pub dropped: Vec<String>,
}

impl SanitizeReport {
    /// Whether sanitizing changed anything
    pub fn is_clean(&self) -> bool {
        self.reserved.is_empty()
            && self.truncated_keys == 0
            && self.truncated_values == 0
            && self.dropped.is_empty()
    }
}

/// Whether `key` falls in a reserved namespace
pub fn is_reserved_key(key: &str) -> bool {
    let key = key.trim().to_ascii_lowercase();
    if key == "system" {
        return true;
    }
    let Some((prefix, _)) = key.split_once('/') else {
        return false;
    };
    prefix == "system"
        || RESERVED_DOMAINS
            .iter()
            .any(|domain| prefix == *domain || prefix.ends_with(&format!(".{domain}")))
}

/// Apply output validation to a decision, preserving evaluation order
pub fn sanitize_output(raw: IndexMap<String, Value>) -> (IndexMap<String, Value>, SanitizeReport) {
    let mut report = SanitizeReport::default();
    let mut out = IndexMap::with_capacity(raw.len().min(MAX_KEYS));

    for (key, value) in raw {
        if is_reserved_key(&key) {
            report.reserved.push(key);
            continue;
        }
        // absent outputs must not use up the key budget
        if is_absent(&value) {
            continue;
        }

        let key = match truncate(&key, MAX_KEY_LEN) {
            Some(short) => {
                report.truncated_keys += 1;
                short
            }
            None => key,
        };

        if out.contains_key(&key) || out.len() >= MAX_KEYS {
            report.dropped.push(key);
            continue;
        }

        let value = truncate_value(value, &mut report.truncated_values);
        out.insert(key, value);
    }

    (out, report)
}

fn is_absent(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.iter().all(Value::is_null),
        _ => false,
    }
}

/// Shortened copy of `s` when it exceeds `max` characters
fn truncate(s: &str, max: usize) -> Option<String> {
    s.char_indices()
        .nth(max)
        .map(|(byte_offset, _)| s[..byte_offset].to_string())
}

fn truncate_value(value: Value, count: &mut usize) -> Value {
    match value {
        Value::String(s) => match truncate(&s, MAX_VALUE_LEN) {
            Some(short) => {
                *count += 1;
                Value::String(short)
            }
            None => Value::String(s),
        },
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| truncate_value(item, count))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, truncate_value(v, count)))
                .collect(),
        ),
        other => other,
    }
}
