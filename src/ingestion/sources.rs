//! Data-source fetchers for context ingestion.
//!
//! Every fetch is bounded by the source's own timeout and rate limit; any
//! failure here is a soft failure handled by the engine.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::IngestionError;
use crate::models::{AuthType, DataSource, SourceType};

/// Simple per-source token bucket, refilled continuously at `rate` per second.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new(rate: u32) -> Self {
        let capacity = f64::from(rate.max(1));
        Self {
            capacity,
            tokens: capacity,
            refilled_at: Instant::now(),
        }
    }

    fn try_take(&mut self, rate: u32) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * f64::from(rate.max(1))).min(self.capacity);
        self.refilled_at = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct SourceFetcher {
    http: reqwest::Client,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl SourceFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the source payload as a JSON object.
    pub async fn fetch(&self, source: &DataSource) -> Result<Value, IngestionError> {
        if !source.enabled {
            return Err(IngestionError::SourceDisabled {
                id: source.id.clone(),
            });
        }
        self.check_rate_limit(source).await?;

        let timeout = Duration::from_secs(source.timeout_seconds);
        let result = tokio::time::timeout(timeout, self.fetch_inner(source)).await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(IngestionError::FetchTimeout {
                id: source.id.clone(),
                seconds: source.timeout_seconds,
            }),
        }
    }

    async fn check_rate_limit(&self, source: &DataSource) -> Result<(), IngestionError> {
        let Some(rate) = source.rate_limit else {
            return Ok(());
        };
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(source.id.clone())
            .or_insert_with(|| TokenBucket::new(rate));
        if bucket.try_take(rate) {
            Ok(())
        } else {
            Err(IngestionError::RateLimited {
                id: source.id.clone(),
            })
        }
    }

    async fn fetch_inner(&self, source: &DataSource) -> Result<Value, IngestionError> {
        match source.source_type {
            SourceType::Api => self.fetch_api(source).await,
            SourceType::File => Self::fetch_file(source).await,
            SourceType::Database | SourceType::Stream => {
                Err(IngestionError::UnsupportedSource {
                    source_type: source.source_type.as_str().to_string(),
                })
            }
        }
    }

    async fn fetch_api(&self, source: &DataSource) -> Result<Value, IngestionError> {
        let mut request = self.http.get(&source.url);
        request = match source.auth_type {
            AuthType::None => request,
            AuthType::Basic => {
                let user = source.credentials.get("username").cloned().unwrap_or_default();
                let pass = source.credentials.get("password").cloned();
                request.basic_auth(user, pass)
            }
            AuthType::Bearer => {
                let token = source.credentials.get("token").cloned().unwrap_or_default();
                request.bearer_auth(token)
            }
            AuthType::OAuth2 => {
                // Token acquisition is the administrator's concern; the
                // configured access token is sent as a bearer credential.
                let token = source
                    .credentials
                    .get("access_token")
                    .cloned()
                    .unwrap_or_default();
                request.bearer_auth(token)
            }
        };

        let response = request.send().await.map_err(|e| IngestionError::FetchFailed {
            id: source.id.clone(),
            reason: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(IngestionError::FetchFailed {
                id: source.id.clone(),
                reason: format!("status {}", response.status().as_u16()),
            });
        }
        let payload: Value = response.json().await.map_err(|e| IngestionError::FetchFailed {
            id: source.id.clone(),
            reason: e.to_string(),
        })?;
        debug!(source = %source.id, "Fetched attributes from API source");
        ensure_object(source, payload)
    }

    async fn fetch_file(source: &DataSource) -> Result<Value, IngestionError> {
        let path = source.url.strip_prefix("file://").unwrap_or(&source.url);
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| IngestionError::FetchFailed {
                id: source.id.clone(),
                reason: e.to_string(),
            })?;
        let payload: Value =
            serde_json::from_str(&raw).map_err(|e| IngestionError::FetchFailed {
                id: source.id.clone(),
                reason: e.to_string(),
            })?;
        debug!(source = %source.id, "Fetched attributes from file source");
        ensure_object(source, payload)
    }
}

fn ensure_object(source: &DataSource, payload: Value) -> Result<Value, IngestionError> {
    if payload.is_object() {
        Ok(payload)
    } else {
        Err(IngestionError::InvalidPayload {
            id: source.id.clone(),
        })
    }
}
