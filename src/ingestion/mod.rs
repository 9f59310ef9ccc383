//! Context Ingestion Engine: enriches a normalized authorization request
//! with externally sourced attributes under permission and masking rules.
//!
//! Enrichment never fails a request. Any rule, source, or whole-engine
//! failure degrades to "no enrichment" at the call site.

pub mod security;
pub mod sources;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::IngestionError;
use crate::models::{AuthorizationRequest, DataSource, IngestionRule};
use crate::store::ConfigStore;
use security::{apply_security_policies, SecurityLevel};
use sources::SourceFetcher;

/// Result of a successful enrichment pass.
#[derive(Debug, Clone)]
pub struct EnrichedContext {
    pub context: HashMap<String, Value>,
    pub security_level: SecurityLevel,
}

pub struct ContextIngestionEngine {
    store: Arc<ConfigStore>,
    fetcher: Arc<SourceFetcher>,
    worker_limit: usize,
}

impl ContextIngestionEngine {
    pub fn new(store: Arc<ConfigStore>, fetcher: Arc<SourceFetcher>, worker_limit: usize) -> Self {
        Self {
            store,
            fetcher,
            worker_limit: worker_limit.max(1),
        }
    }

    /// Run every applicable ingestion rule and return the merged context.
    ///
    /// `allowed_sources` limits which data sources this caller may read
    /// (empty means all); `caller_permissions` gates rules and security
    /// policies.
    pub async fn ingest(
        &self,
        request: &AuthorizationRequest,
        allowed_sources: &[String],
        caller_permissions: &BTreeSet<String>,
    ) -> Result<EnrichedContext, IngestionError> {
        let config = self.store.snapshot().await;

        let mut applicable: Vec<(&IngestionRule, &DataSource)> = Vec::new();
        for rule in &config.rules {
            if !rule.enabled {
                continue;
            }
            if !rule.permissions.iter().all(|p| caller_permissions.contains(p)) {
                continue;
            }
            if !rule_matches(rule, request) {
                continue;
            }
            let Some(source) = config.sources.iter().find(|s| s.id == rule.source) else {
                // Config validation prevents this; an inert rule is skipped.
                warn!(rule = %rule.id, source = %rule.source, "Ingestion rule references unknown source");
                continue;
            };
            if !source.enabled {
                continue;
            }
            if !allowed_sources.is_empty()
                && !allowed_sources.contains(&source.name)
                && !allowed_sources.contains(&source.id)
            {
                continue;
            }
            applicable.push((rule, source));
        }
        applicable.sort_by_key(|(rule, _)| rule.priority);

        // Independent sources run concurrently under a bounded worker pool;
        // one slow source must not stall the others. Each task owns its
        // source so the futures carry no borrows into the spawn points.
        let fetches: Vec<_> = applicable
            .iter()
            .enumerate()
            .map(|(idx, (_rule, source))| {
                let fetcher = Arc::clone(&self.fetcher);
                let source = DataSource::clone(source);
                async move {
                    let outcome = fetcher.fetch(&source).await;
                    (idx, outcome)
                }
            })
            .collect();
        let mut results: Vec<(usize, Result<Value, IngestionError>)> = stream::iter(fetches)
            .buffer_unordered(self.worker_limit)
            .collect()
            .await;
        results.sort_by_key(|(idx, _)| *idx);

        let mut enriched: HashMap<String, Value> = HashMap::new();
        for (idx, outcome) in results {
            let (rule, _) = applicable[idx];
            match outcome {
                Ok(payload) => {
                    let transformed = apply_transform(rule, payload);
                    debug!(rule = %rule.id, target = %rule.target, "Ingestion rule contributed context");
                    enriched.insert(rule.target.clone(), transformed);
                }
                Err(err) => {
                    // Soft failure: this rule's contribution is skipped.
                    warn!(rule = %rule.id, error = %err, "Ingestion rule skipped");
                }
            }
        }

        // Ingestion-sourced keys win on conflict. Security policies run over
        // the merged whole, so secrets arriving in the original request
        // context are scrubbed the same as ingested ones.
        let mut context = request.context.clone();
        context.extend(enriched);
        let security_level =
            apply_security_policies(&config.security_policies, &mut context, caller_permissions);
        context.insert(
            "security_level".to_string(),
            Value::String(security_level.as_str().to_string()),
        );

        Ok(EnrichedContext {
            context,
            security_level,
        })
    }
}

/// Rename fetched fields per the rule's transform mapping; unmapped fields
/// pass through unchanged.
fn apply_transform(rule: &IngestionRule, payload: Value) -> Value {
    if rule.transform.mapping.is_empty() {
        return payload;
    }
    let Value::Object(map) = payload else {
        return payload;
    };
    let mut out = serde_json::Map::with_capacity(map.len());
    for (key, value) in map {
        let target_key = rule
            .transform
            .mapping
            .get(&key)
            .cloned()
            .unwrap_or(key);
        out.insert(target_key, value);
    }
    Value::Object(out)
}

/// Equality/membership checks against user/resource/action/context fields.
fn rule_matches(rule: &IngestionRule, request: &AuthorizationRequest) -> bool {
    rule.conditions.iter().all(|(path, expected)| {
        lookup_field(request, path)
            .map(|actual| value_matches(&actual, expected))
            .unwrap_or(false)
    })
}

fn lookup_field(request: &AuthorizationRequest, path: &str) -> Option<Value> {
    let set_to_value =
        |set: &BTreeSet<String>| Value::Array(set.iter().cloned().map(Value::String).collect());
    match path {
        "user.id" => Some(Value::String(request.user.id.clone())),
        "user.roles" => Some(set_to_value(&request.user.roles)),
        "user.groups" => Some(set_to_value(&request.user.groups)),
        "user.permissions" => Some(set_to_value(&request.user.permissions)),
        "resource.id" => Some(Value::String(request.resource.id.clone())),
        "resource.type" => Some(Value::String(request.resource.resource_type.clone())),
        "resource.name" => Some(Value::String(request.resource.name.clone())),
        "resource.owner" => request.resource.owner.clone().map(Value::String),
        "action.name" => Some(Value::String(request.action.name.clone())),
        "action.type" => Some(Value::String(request.action.action_type.clone())),
        _ => {
            if let Some(key) = path.strip_prefix("user.attributes.") {
                request.user.attributes.get(key).cloned()
            } else if let Some(key) = path.strip_prefix("resource.attributes.") {
                request.resource.attributes.get(key).cloned()
            } else if let Some(key) = path.strip_prefix("action.attributes.") {
                request.action.attributes.get(key).cloned()
            } else if let Some(key) = path.strip_prefix("context.") {
                request.context.get(key).cloned()
            } else {
                None
            }
        }
    }
}

/// Scalar expectations test equality (or membership when the actual value is
/// a set); array expectations test intersection/containment.
fn value_matches(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Array(actual_items), Value::Array(expected_items)) => expected_items
            .iter()
            .any(|e| actual_items.contains(e)),
        (Value::Array(actual_items), scalar) => actual_items.contains(scalar),
        (scalar, Value::Array(expected_items)) => expected_items.contains(scalar),
        (a, e) => a == e,
    }
}
