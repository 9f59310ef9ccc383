//! Security policies applied to the enriched context before it reaches the
//! decision engine: mask, encrypt, deny (remove), allow (pin).

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::models::{SecurityPolicy, SecurityRuleType};

pub const MASKED_VALUE: &str = "***REDACTED***";

/// Keys masked unconditionally, independent of configured policies. No value
/// under these ever reaches the decision engine or the audit log.
const BASELINE_SENSITIVE_KEYS: &[&str] = &["password", "token", "secret"];

/// Outcome marker folded into the context as `security_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    Standard,
    Restricted,
}

impl SecurityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Restricted => "restricted",
        }
    }
}

/// Apply enabled policies in priority order, then the baseline mask.
/// Returns the derived security level.
pub fn apply_security_policies(
    policies: &[SecurityPolicy],
    context: &mut HashMap<String, Value>,
    caller_permissions: &BTreeSet<String>,
) -> SecurityLevel {
    let mut ordered: Vec<&SecurityPolicy> = policies.iter().filter(|p| p.enabled).collect();
    ordered.sort_by_key(|p| p.priority);

    let mut pinned: BTreeSet<String> = BTreeSet::new();
    let mut restricted = false;

    for policy in ordered {
        for rule in &policy.rules {
            if !has_permissions(&rule.permissions, caller_permissions) {
                continue;
            }
            match rule.rule_type {
                SecurityRuleType::Allow => {
                    collect_matching_keys(context, &rule.condition, &mut pinned);
                }
                SecurityRuleType::Deny => {
                    let removed = remove_matching(context, &rule.condition, &pinned);
                    restricted |= removed;
                }
                SecurityRuleType::Mask => {
                    let masked = rewrite_matching(context, &rule.condition, mask_value);
                    restricted |= masked;
                }
                SecurityRuleType::Encrypt => {
                    let encrypted = rewrite_matching(context, &rule.condition, encrypt_value);
                    restricted |= encrypted;
                }
            }
        }
    }

    for key in BASELINE_SENSITIVE_KEYS {
        restricted |= rewrite_matching(context, key, mask_value);
    }

    if restricted {
        SecurityLevel::Restricted
    } else {
        SecurityLevel::Standard
    }
}

fn has_permissions(required: &[String], held: &BTreeSet<String>) -> bool {
    required.iter().all(|p| held.contains(p))
}

fn key_matches(key: &str, condition: &str) -> bool {
    key.to_ascii_lowercase()
        .contains(&condition.to_ascii_lowercase())
}

fn mask_value(_old: &Value) -> Value {
    Value::String(MASKED_VALUE.to_string())
}

/// Replace a sensitive value with an irreversible ciphertext reference; the
/// enforcement point never needs to decrypt what it hides.
fn encrypt_value(old: &Value) -> Value {
    let serialized = old.to_string();
    let digest = Sha256::digest(serialized.as_bytes());
    Value::String(format!("enc:sha256:{digest:x}"))
}

fn collect_matching_keys(
    context: &HashMap<String, Value>,
    condition: &str,
    out: &mut BTreeSet<String>,
) {
    for (key, value) in context {
        if key_matches(key, condition) {
            out.insert(key.clone());
        }
        if let Value::Object(map) = value {
            collect_matching_keys_obj(map, condition, out);
        }
    }
}

fn collect_matching_keys_obj(map: &Map<String, Value>, condition: &str, out: &mut BTreeSet<String>) {
    for (key, value) in map {
        if key_matches(key, condition) {
            out.insert(key.clone());
        }
        if let Value::Object(inner) = value {
            collect_matching_keys_obj(inner, condition, out);
        }
    }
}

/// Rewrite every value (recursively) whose key matches the condition.
/// Returns true when at least one field was rewritten.
fn rewrite_matching(
    context: &mut HashMap<String, Value>,
    condition: &str,
    rewrite: fn(&Value) -> Value,
) -> bool {
    let mut changed = false;
    for (key, value) in context.iter_mut() {
        if key_matches(key, condition) {
            if value.as_str() != Some(MASKED_VALUE) {
                *value = rewrite(value);
                changed = true;
            }
            continue;
        }
        changed |= rewrite_matching_value(value, condition, rewrite);
    }
    changed
}

fn rewrite_matching_value(value: &mut Value, condition: &str, rewrite: fn(&Value) -> Value) -> bool {
    let mut changed = false;
    match value {
        Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                if key_matches(key, condition) {
                    if inner.as_str() != Some(MASKED_VALUE) {
                        *inner = rewrite(inner);
                        changed = true;
                    }
                } else {
                    changed |= rewrite_matching_value(inner, condition, rewrite);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                changed |= rewrite_matching_value(item, condition, rewrite);
            }
        }
        _ => {}
    }
    changed
}

/// Remove matching top-level and nested fields, except pinned keys.
fn remove_matching(
    context: &mut HashMap<String, Value>,
    condition: &str,
    pinned: &BTreeSet<String>,
) -> bool {
    let before = context.len();
    context.retain(|key, _| pinned.contains(key) || !key_matches(key, condition));
    let mut changed = context.len() != before;
    for value in context.values_mut() {
        changed |= remove_matching_value(value, condition, pinned);
    }
    changed
}

fn remove_matching_value(value: &mut Value, condition: &str, pinned: &BTreeSet<String>) -> bool {
    let mut changed = false;
    match value {
        Value::Object(map) => {
            let before = map.len();
            map.retain(|key, _| pinned.contains(key) || !key_matches(key, condition));
            changed = map.len() != before;
            for inner in map.values_mut() {
                changed |= remove_matching_value(inner, condition, pinned);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                changed |= remove_matching_value(item, condition, pinned);
            }
        }
        _ => {}
    }
    changed
}
