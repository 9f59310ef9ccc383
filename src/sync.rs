//! Policy Synchronization Client.
//!
//! Timer-driven pull of the policy bundle from the distribution service,
//! filtered to this enforcement point's identity and environment. Failure
//! keeps serving the last-known-good bundle; request processing is never
//! interrupted by sync.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::bundle::BundleHandle;
use crate::cache::TtlLruCache;
use crate::config::SyncConfig;
use crate::errors::SyncError;
use crate::models::{PolicyBundle, SyncStatus};

pub type PolicyCache = TtlLruCache<String, Arc<PolicyBundle>>;

/// Bundle document served by the distribution service.
#[derive(Debug, Deserialize)]
struct BundleDocument {
    version: String,
    rules: Value,
    #[serde(default)]
    data: Value,
}

pub struct PolicySyncClient {
    http: reqwest::Client,
    config: SyncConfig,
    bundle: Arc<BundleHandle>,
    policy_cache: Arc<PolicyCache>,
    policy_cache_ttl: Duration,
    status: RwLock<SyncStatus>,
}

impl PolicySyncClient {
    pub fn new(
        http: reqwest::Client,
        config: SyncConfig,
        bundle: Arc<BundleHandle>,
        policy_cache: Arc<PolicyCache>,
        policy_cache_ttl: Duration,
    ) -> Self {
        Self {
            http,
            config,
            bundle,
            policy_cache,
            policy_cache_ttl,
            status: RwLock::new(SyncStatus::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn is_configured(&self) -> bool {
        self.config.url.is_some()
    }

    /// Run the sync loop until the process exits. Spawned once at startup;
    /// fully decoupled from request-handling tasks.
    pub async fn run(self: Arc<Self>) {
        if !self.is_configured() {
            warn!("Policy sync disabled: no distribution service configured");
            return;
        }
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.sync_once().await {
                Ok(version) => {
                    info!(version = %version, "Policy bundle synchronized");
                }
                Err(err) => {
                    // Last-known-good bundle keeps serving; retried next tick.
                    warn!(error = %err, "Policy sync failed");
                }
            }
        }
    }

    /// Pull the current bundle and publish it atomically. Also the
    /// administrative force-sync entry point.
    pub async fn sync_once(&self) -> Result<String, SyncError> {
        let result = self.pull_bundle().await;
        let mut status = self.status.write().await;
        status.last_attempt = Some(Utc::now());
        match result {
            Ok(bundle) => {
                crate::metrics::record_sync("success");
                let version = bundle.version.clone();
                let bundle = Arc::new(bundle);
                self.bundle.store(bundle.clone());
                // The new version supersedes everything the policy cache held.
                self.policy_cache.clear().await;
                self.policy_cache
                    .put_with_ttl(version.clone(), bundle, self.policy_cache_ttl)
                    .await;
                status.healthy = true;
                status.last_sync = Some(Utc::now());
                status.last_error = None;
                status.bundle_version = Some(version.clone());
                Ok(version)
            }
            Err(err) => {
                crate::metrics::record_sync("failure");
                status.healthy = false;
                status.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    async fn pull_bundle(&self) -> Result<PolicyBundle, SyncError> {
        let url = self.config.url.as_ref().ok_or(SyncError::NotConfigured)?;

        let mut request = self
            .http
            .get(url)
            .timeout(self.config.request_timeout)
            .query(&[
                ("bouncer", self.config.bouncer_id.as_str()),
                ("environment", self.config.environment.as_str()),
            ]);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| SyncError::RequestFailed {
            reason: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(SyncError::BadStatus {
                status: response.status().as_u16(),
            });
        }
        let doc: BundleDocument =
            response
                .json()
                .await
                .map_err(|e| SyncError::MalformedBundle {
                    reason: e.to_string(),
                })?;
        if doc.version.is_empty() {
            return Err(SyncError::MalformedBundle {
                reason: "empty bundle version".to_string(),
            });
        }
        Ok(PolicyBundle {
            version: doc.version,
            rules: doc.rules,
            data: doc.data,
            fetched_at: Utc::now(),
            source: url.clone(),
        })
    }

    /// Operator-facing snapshot for the health endpoint.
    pub async fn status(&self) -> SyncStatus {
        let mut status = self.status.read().await.clone();
        // Before the first attempt, report health from configuration alone.
        if status.last_attempt.is_none() {
            status.healthy = !self.is_configured();
        }
        status.bundle_version = self.bundle.load().map(|b| b.version.clone());
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_config(url: Option<String>) -> SyncConfig {
        SyncConfig {
            url,
            api_key: Some("tenant-key".to_string()),
            bouncer_id: "gw-test-1".to_string(),
            environment: "test".to_string(),
            interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(2),
        }
    }

    fn client(url: Option<String>) -> PolicySyncClient {
        PolicySyncClient::new(
            reqwest::Client::new(),
            sync_config(url),
            Arc::new(BundleHandle::new()),
            Arc::new(PolicyCache::new(16, Duration::from_secs(600))),
            Duration::from_secs(600),
        )
    }

    #[tokio::test]
    async fn unconfigured_sync_returns_not_configured() {
        let c = client(None);
        assert!(matches!(c.sync_once().await, Err(SyncError::NotConfigured)));
        assert!(!c.is_configured());
    }

    #[tokio::test]
    async fn failed_sync_keeps_last_known_good_bundle() {
        // Point at a closed port; the pull fails, the bundle stays.
        let c = client(Some("http://127.0.0.1:1/v1/bundle".to_string()));
        c.bundle.store(Arc::new(PolicyBundle {
            version: "v1".to_string(),
            rules: serde_json::json!({}),
            data: serde_json::json!({}),
            fetched_at: Utc::now(),
            source: "seed".to_string(),
        }));

        assert!(c.sync_once().await.is_err());

        let status = c.status().await;
        assert!(!status.healthy);
        assert!(status.last_error.is_some());
        assert_eq!(status.bundle_version.as_deref(), Some("v1"));
        assert_eq!(c.bundle.version(), "v1");
    }
}
