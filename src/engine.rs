//! Policy Decision Engine: cache-first orchestration around the external
//! rule evaluator.
//!
//! The decision fingerprint includes the active bundle version, so a bundle
//! swap implicitly invalidates every cached decision without a cross-cache
//! sweep.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::bundle::BundleHandle;
use crate::cache::TtlLruCache;
use crate::errors::EvaluationError;
use crate::models::{AuthorizationDecision, AuthorizationRequest};

pub type DecisionCache = TtlLruCache<String, AuthorizationDecision>;

/// Seam to the external rule-evaluation service. Retry policy, if any,
/// belongs to the transport behind this trait, not to the engine.
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizationDecision, EvaluationError>;
}

/// HTTP rule evaluator posting `{user, resource, action, context}` and
/// translating the response into an [`AuthorizationDecision`].
pub struct HttpRuleEvaluator {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct EvaluatorResponse {
    allow: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    constraints: std::collections::HashMap<String, Value>,
}

impl HttpRuleEvaluator {
    pub fn new(http: reqwest::Client, url: String, timeout: Duration) -> Self {
        Self { http, url, timeout }
    }
}

#[async_trait]
impl RuleEvaluator for HttpRuleEvaluator {
    async fn evaluate(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizationDecision, EvaluationError> {
        let send = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .json(request)
            .send();
        let response = match tokio::time::timeout(self.timeout, send).await {
            Err(_) => {
                return Err(EvaluationError::Timeout {
                    seconds: self.timeout.as_secs(),
                })
            }
            Ok(Err(e)) if e.is_timeout() => {
                return Err(EvaluationError::Timeout {
                    seconds: self.timeout.as_secs(),
                })
            }
            Ok(Err(e)) => {
                return Err(EvaluationError::Unreachable {
                    reason: e.to_string(),
                })
            }
            Ok(Ok(resp)) => resp,
        };

        if !response.status().is_success() {
            return Err(EvaluationError::BadStatus {
                status: response.status().as_u16(),
            });
        }
        let body: EvaluatorResponse =
            response
                .json()
                .await
                .map_err(|e| EvaluationError::MalformedResponse {
                    reason: e.to_string(),
                })?;
        Ok(AuthorizationDecision {
            allow: body.allow,
            reason: body
                .reason
                .unwrap_or_else(|| {
                    if body.allow {
                        "permitted by policy".to_string()
                    } else {
                        "denied by policy".to_string()
                    }
                }),
            constraints: body.constraints,
            masked_data: None,
        })
    }
}

pub struct DecisionEngine {
    evaluator: Arc<dyn RuleEvaluator>,
    decision_cache: Arc<DecisionCache>,
    bundle: Arc<BundleHandle>,
    decision_ttl: Duration,
    /// Context keys that participate in the fingerprint (the subset policy
    /// actually depends on).
    context_keys: Vec<String>,
}

impl DecisionEngine {
    pub fn new(
        evaluator: Arc<dyn RuleEvaluator>,
        decision_cache: Arc<DecisionCache>,
        bundle: Arc<BundleHandle>,
        decision_ttl: Duration,
        context_keys: Vec<String>,
    ) -> Self {
        Self {
            evaluator,
            decision_cache,
            bundle,
            decision_ttl,
            context_keys,
        }
    }

    /// Deterministic fingerprint of a cacheable authorization question.
    pub fn fingerprint(&self, request: &AuthorizationRequest, bundle_version: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.user.id.as_bytes());
        hasher.update([0u8]);
        for role in &request.user.roles {
            hasher.update(role.as_bytes());
            hasher.update([1u8]);
        }
        hasher.update(request.resource.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.resource.resource_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.action.name.as_bytes());
        hasher.update([0u8]);

        // Canonical (sorted-key) serialization of the policy-relevant subset.
        let subset: BTreeMap<&str, &Value> = self
            .context_keys
            .iter()
            .filter_map(|k| request.context.get(k).map(|v| (k.as_str(), v)))
            .collect();
        hasher.update(serde_json::to_string(&subset).unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(bundle_version.as_bytes());

        format!("{:x}", hasher.finalize())
    }

    /// Allow-or-deny for a normalized request: decision cache fast path,
    /// external evaluation on miss. Evaluation failures are surfaced and
    /// never cached; there is no default-allow.
    pub async fn evaluate(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizationDecision, EvaluationError> {
        let bundle_version = self.bundle.version();
        let key = self.fingerprint(request, &bundle_version);

        if let Some(decision) = self.decision_cache.get(&key).await {
            debug!(
                fingerprint = %key,
                decision = decision.decision_label(),
                "Decision cache hit"
            );
            crate::metrics::METRICS
                .cache_operations_total
                .with_label_values(&["decision", "get", "hit"])
                .inc();
            return Ok(decision);
        }
        crate::metrics::METRICS
            .cache_operations_total
            .with_label_values(&["decision", "get", "miss"])
            .inc();

        let started = std::time::Instant::now();
        let outcome = self.evaluator.evaluate(request).await;
        crate::metrics::METRICS
            .evaluator_duration_seconds
            .with_label_values(&[if outcome.is_ok() { "success" } else { "error" }])
            .observe(started.elapsed().as_secs_f64());
        let decision = outcome?;
        info!(
            fingerprint = %key,
            bundle_version = %bundle_version,
            decision = decision.decision_label(),
            reason = %decision.reason,
            "Decision evaluated"
        );
        self.decision_cache
            .put_with_ttl(key, decision.clone(), self.decision_ttl)
            .await;
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PolicyBundle, User};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEvaluator {
        calls: AtomicUsize,
        allow: bool,
    }

    impl CountingEvaluator {
        fn new(allow: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                allow,
            }
        }
    }

    #[async_trait]
    impl RuleEvaluator for CountingEvaluator {
        async fn evaluate(
            &self,
            _request: &AuthorizationRequest,
        ) -> Result<AuthorizationDecision, EvaluationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AuthorizationDecision {
                allow: self.allow,
                reason: "test".to_string(),
                constraints: Default::default(),
                masked_data: None,
            })
        }
    }

    struct FailingEvaluator;

    #[async_trait]
    impl RuleEvaluator for FailingEvaluator {
        async fn evaluate(
            &self,
            _request: &AuthorizationRequest,
        ) -> Result<AuthorizationDecision, EvaluationError> {
            Err(EvaluationError::Unreachable {
                reason: "connection refused".to_string(),
            })
        }
    }

    fn request(user_id: &str) -> AuthorizationRequest {
        let mut req = AuthorizationRequest {
            user: User {
                id: user_id.to_string(),
                ..User::default()
            },
            ..AuthorizationRequest::default()
        };
        req.resource.id = "example.com:/api/widgets".to_string();
        req.resource.resource_type = "api".to_string();
        req.action.name = "read".to_string();
        req.context.insert("client_ip".to_string(), json!("10.0.0.1"));
        req
    }

    fn engine_with(
        evaluator: Arc<dyn RuleEvaluator>,
        bundle: Arc<BundleHandle>,
    ) -> DecisionEngine {
        DecisionEngine::new(
            evaluator,
            Arc::new(DecisionCache::new(128, Duration::from_secs(60))),
            bundle,
            Duration::from_secs(60),
            vec!["client_ip".to_string(), "security_level".to_string()],
        )
    }

    fn bundle(version: &str) -> Arc<PolicyBundle> {
        Arc::new(PolicyBundle {
            version: version.to_string(),
            rules: json!({}),
            data: json!({}),
            fetched_at: Utc::now(),
            source: "test".to_string(),
        })
    }

    #[tokio::test]
    async fn identical_requests_hit_the_cache_after_first_evaluation() {
        let evaluator = Arc::new(CountingEvaluator::new(true));
        let engine = engine_with(evaluator.clone(), Arc::new(BundleHandle::new()));

        let first = engine.evaluate(&request("alice")).await.unwrap();
        let second = engine.evaluate(&request("alice")).await.unwrap();

        assert!(first.allow && second.allow);
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bundle_version_change_breaks_cached_decisions() {
        let evaluator = Arc::new(CountingEvaluator::new(true));
        let handle = Arc::new(BundleHandle::new());
        handle.store(bundle("v1"));
        let engine = engine_with(evaluator.clone(), handle.clone());

        engine.evaluate(&request("alice")).await.unwrap();
        engine.evaluate(&request("alice")).await.unwrap();
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 1);

        handle.store(bundle("v2"));
        engine.evaluate(&request("alice")).await.unwrap();
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn evaluation_failure_is_surfaced_and_not_cached() {
        let engine = engine_with(Arc::new(FailingEvaluator), Arc::new(BundleHandle::new()));

        let result = engine.evaluate(&request("alice")).await;
        assert!(matches!(result, Err(EvaluationError::Unreachable { .. })));

        // Nothing was cached for the failed evaluation.
        let key = engine.fingerprint(&request("alice"), "unsynced");
        assert!(engine.decision_cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn fingerprint_distinguishes_the_cacheable_tuple() {
        let engine = engine_with(
            Arc::new(CountingEvaluator::new(true)),
            Arc::new(BundleHandle::new()),
        );

        let base = request("alice");
        let base_fp = engine.fingerprint(&base, "v1");

        assert_eq!(base_fp, engine.fingerprint(&request("alice"), "v1"));
        assert_ne!(base_fp, engine.fingerprint(&request("bob"), "v1"));
        assert_ne!(base_fp, engine.fingerprint(&base, "v2"));

        let mut other_action = request("alice");
        other_action.action.name = "delete".to_string();
        assert_ne!(base_fp, engine.fingerprint(&other_action, "v1"));

        let mut with_role = request("alice");
        with_role.user.roles.insert("admin".to_string());
        assert_ne!(base_fp, engine.fingerprint(&with_role, "v1"));

        let mut other_ip = request("alice");
        other_ip
            .context
            .insert("client_ip".to_string(), json!("10.9.9.9"));
        assert_ne!(base_fp, engine.fingerprint(&other_ip, "v1"));

        // Context keys outside the configured subset do not affect caching.
        let mut extra = request("alice");
        extra.context.insert("user_agent".to_string(), json!("curl"));
        assert_eq!(base_fp, engine.fingerprint(&extra, "v1"));
    }
}
