//! Operator-facing HTTP surface: authorization checks, cache statistics,
//! sync control, and ingestion configuration views.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::{json, Value};

use crate::cache::CacheStats;
use crate::errors::AppError;
use crate::models::{AuthorizationDecision, AuthorizationRequest, DataSource, SyncStatus};
use crate::AppState;

/// Single authorization check over the same enrichment + decision path the
/// proxy uses, without forwarding.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Json(mut request): Json<AuthorizationRequest>,
) -> Result<Json<AuthorizationDecision>, AppError> {
    enrich_in_place(&state, &mut request).await;
    let decision = state.engine.evaluate(&request).await?;
    crate::metrics::record_decision(
        decision.decision_label(),
        &request.resource.resource_type,
        &request.action.name,
    );
    Ok(Json(decision))
}

/// Bulk form: items are decided independently; a failed item reports its
/// error without failing the batch.
pub async fn authorize_bulk(
    State(state): State<Arc<AppState>>,
    Json(requests): Json<Vec<AuthorizationRequest>>,
) -> Json<Vec<Value>> {
    let mut results = Vec::with_capacity(requests.len());
    for mut request in requests {
        enrich_in_place(&state, &mut request).await;
        match state.engine.evaluate(&request).await {
            Ok(decision) => {
                crate::metrics::record_decision(
                    decision.decision_label(),
                    &request.resource.resource_type,
                    &request.action.name,
                );
                results.push(serde_json::to_value(decision).unwrap_or(Value::Null));
            }
            Err(err) => results.push(json!({
                "error": "evaluation_error",
                "message": err.to_string(),
            })),
        }
    }
    Json(results)
}

async fn enrich_in_place(state: &AppState, request: &mut AuthorizationRequest) {
    let permissions = request.user.permissions.clone();
    if let Ok(enriched) = state
        .ingestion
        .ingest(request, &state.config.ingestion.allowed_sources, &permissions)
        .await
    {
        request.context = enriched.context;
    }
}

#[derive(Serialize)]
pub struct CacheStatsResponse {
    pub decision: CacheStats,
    pub policy: CacheStats,
}

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        decision: state.decision_cache.stats().await,
        policy: state.policy_cache.stats().await,
    })
}

pub async fn cache_clear(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.decision_cache.clear().await;
    state.policy_cache.clear().await;
    tracing::info!("Decision and policy caches cleared by operator");
    Json(json!({"cleared": true}))
}

/// Administrative force-sync entry point.
pub async fn force_sync(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let version = state.sync.sync_once().await?;
    Ok(Json(json!({"synced": true, "version": version})))
}

pub async fn sync_status(State(state): State<Arc<AppState>>) -> Json<SyncStatus> {
    Json(state.sync.status().await)
}

/// Sources view with credentials redacted; the admin store owns the real
/// values.
pub async fn list_sources(State(state): State<Arc<AppState>>) -> Json<Vec<DataSource>> {
    let snapshot = state.store.snapshot().await;
    let sources = snapshot.sources.iter().cloned().map(redact_source).collect();
    Json(sources)
}

pub async fn list_rules(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.store.snapshot().await;
    Json(serde_json::to_value(&snapshot.rules).unwrap_or(Value::Null))
}

pub async fn list_security_policies(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.store.snapshot().await;
    Json(serde_json::to_value(&snapshot.security_policies).unwrap_or(Value::Null))
}

pub async fn ingestion_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.store.snapshot().await;
    let sources: Vec<DataSource> = snapshot.sources.iter().cloned().map(redact_source).collect();
    Json(json!({
        "sources": sources,
        "rules": snapshot.rules,
        "security_policies": snapshot.security_policies,
    }))
}

pub async fn ingestion_reload(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let config = state.store.reload().await?;
    Ok(Json(json!({
        "reloaded": true,
        "sources": config.sources.len(),
        "rules": config.rules.len(),
        "security_policies": config.security_policies.len(),
    })))
}

fn redact_source(mut source: DataSource) -> DataSource {
    for value in source.credentials.values_mut() {
        *value = "***REDACTED***".to_string();
    }
    source
}

/// Liveness probe; bypasses the enforcement pipeline entirely.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Readiness probe; also static, with the sync snapshot for operators.
pub async fn ready(State(state): State<Arc<AppState>>) -> Json<Value> {
    let sync = state.sync.status().await;
    Json(json!({
        "status": "ready",
        "sync_healthy": sync.healthy,
        "bundle_version": sync.bundle_version,
    }))
}
