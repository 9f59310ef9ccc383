//! Core data model for the authorization pipeline.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The subject of an authorization question.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl User {
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(rename = "type", default)]
    pub action_type: String,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

/// Normalized authorization question, built once per inbound request.
/// Immutable after it is handed to the decision engine except for context
/// merging during enrichment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub user: User,
    pub resource: Resource,
    pub action: Action,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl AuthorizationRequest {
    /// Request ID assigned during extraction; always present on requests
    /// built by the extractor.
    pub fn request_id(&self) -> &str {
        self.context
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }

    pub fn client_ip(&self) -> &str {
        self.context
            .get("client_ip")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }
}

/// Produced exactly once per request; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub allow: bool,
    pub reason: String,
    #[serde(default)]
    pub constraints: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masked_data: Option<Value>,
}

impl AuthorizationDecision {
    pub fn decision_label(&self) -> &'static str {
        if self.allow {
            "allow"
        } else {
            "deny"
        }
    }
}

/// Versioned snapshot of evaluable policy, replaced atomically on sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyBundle {
    pub version: String,
    /// Opaque evaluable form; interpreted only by the external rule evaluator.
    pub rules: Value,
    /// External datasets shipped alongside the bundle.
    #[serde(default)]
    pub data: Value,
    pub fetched_at: DateTime<Utc>,
    pub source: String,
}

/// Bundle version placeholder used before the first successful sync.
pub const UNSYNCED_BUNDLE_VERSION: &str = "unsynced";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Api,
    Database,
    File,
    Stream,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Database => "database",
            Self::File => "file",
            Self::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Bearer,
    OAuth2,
}

/// Administrator-managed definition of an external attribute source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub url: String,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    /// Permissions a caller must hold for rules reading this source.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Requests per second; absent means unlimited.
    #[serde(default)]
    pub rate_limit: Option<u32>,
    #[serde(default = "default_source_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_source_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transform {
    /// Field renames applied to the fetched payload: fetched key -> context key.
    #[serde(default)]
    pub mapping: HashMap<String, String>,
}

/// Matches requests to data sources and places fetched attributes under a
/// target context key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRule {
    pub id: String,
    pub name: String,
    /// References a [`DataSource`] id; validated at config load.
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub conditions: HashMap<String, Value>,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityRuleType {
    Allow,
    Deny,
    Mask,
    Encrypt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRule {
    #[serde(rename = "type")]
    pub rule_type: SecurityRuleType,
    /// Field-name pattern the rule applies to (case-insensitive substring).
    pub condition: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Applied after ingestion, before the enriched context reaches the
/// decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub rules: Vec<SecurityRule>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Operator-facing sync health snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub healthy: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub bundle_version: Option<String>,
}
