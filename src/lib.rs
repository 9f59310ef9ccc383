//! Authorization gateway: a policy enforcement point in front of a protected
//! backend.
//!
//! Pipeline: extract a normalized authorization request from the inbound
//! HTTP request, enrich its context from configured data sources, ask the
//! decision engine (cache-first, external rule evaluator on miss), then
//! deny with 403 or reverse-proxy to the backend.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

pub mod bundle;
pub mod cache;
pub mod config;
pub mod engine;
pub mod errors;
pub mod extract;
pub mod handlers;
pub mod ingestion;
pub mod metrics;
pub mod models;
pub mod proxy;
pub mod store;
pub mod sync;

use bundle::BundleHandle;
use config::AppConfig;
use engine::{DecisionCache, DecisionEngine, HttpRuleEvaluator, RuleEvaluator};
use errors::ConfigError;
use extract::JwtVerifier;
use ingestion::{sources::SourceFetcher, ContextIngestionEngine};
use store::ConfigStore;
use sync::{PolicyCache, PolicySyncClient};

pub struct AppState {
    pub config: AppConfig,
    pub jwt: JwtVerifier,
    pub store: Arc<ConfigStore>,
    pub ingestion: Arc<ContextIngestionEngine>,
    pub engine: Arc<DecisionEngine>,
    pub sync: Arc<PolicySyncClient>,
    pub bundle: Arc<BundleHandle>,
    pub policy_cache: Arc<PolicyCache>,
    pub decision_cache: Arc<DecisionCache>,
    pub http: reqwest::Client,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the full pipeline from configuration. The ingestion store is
    /// injected so tests and the admin layer can supply their own.
    pub fn build(config: AppConfig, store: Arc<ConfigStore>) -> Result<Arc<Self>, ConfigError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                reason: format!("http client: {e}"),
            })?;

        let jwt = JwtVerifier::from_config(&config.jwt);
        let bundle = Arc::new(BundleHandle::new());
        let policy_cache = Arc::new(PolicyCache::new(
            config.cache.policy_max_entries,
            config.cache.policy_ttl,
        ));
        let decision_cache = Arc::new(DecisionCache::new(
            config.cache.decision_max_entries,
            config.cache.decision_ttl,
        ));

        let evaluator: Arc<dyn RuleEvaluator> = Arc::new(HttpRuleEvaluator::new(
            http.clone(),
            config.evaluator.url.clone(),
            config.evaluator.timeout,
        ));
        let engine = Arc::new(DecisionEngine::new(
            evaluator,
            decision_cache.clone(),
            bundle.clone(),
            config.cache.decision_ttl,
            config.decision_context_keys.clone(),
        ));

        let fetcher = Arc::new(SourceFetcher::new(http.clone()));
        let ingestion = Arc::new(ContextIngestionEngine::new(
            store.clone(),
            fetcher,
            config.ingestion.worker_limit,
        ));

        let sync = Arc::new(PolicySyncClient::new(
            http.clone(),
            config.sync.clone(),
            bundle.clone(),
            policy_cache.clone(),
            config.cache.policy_ttl,
        ));

        Ok(Arc::new(Self {
            config,
            jwt,
            store,
            ingestion,
            engine,
            sync,
            bundle,
            policy_cache,
            decision_cache,
            http,
            started_at: Instant::now(),
        }))
    }
}

/// Build the router: probes and the operator API are explicit routes; all
/// remaining traffic falls through to the enforcement pipeline.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/v1/authorize", post(handlers::authorize))
        .route("/v1/authorize/bulk", post(handlers::authorize_bulk))
        .route("/v1/cache/stats", get(handlers::cache_stats))
        .route("/v1/cache/clear", post(handlers::cache_clear))
        .route("/v1/sync", post(handlers::force_sync))
        .route("/v1/sync/status", get(handlers::sync_status))
        .route("/v1/ingestion/sources", get(handlers::list_sources))
        .route("/v1/ingestion/rules", get(handlers::list_rules))
        .route(
            "/v1/ingestion/policies",
            get(handlers::list_security_policies),
        )
        .route("/v1/ingestion/config", get(handlers::ingestion_config))
        .route("/v1/ingestion/reload", post(handlers::ingestion_reload))
        .fallback(proxy::enforce)
        .layer(middleware::from_fn(metrics::http_metrics_middleware))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until shutdown. Binds, spawns the sync loop, and handles ctrl-c.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let bind_addr = state.config.server.bind_addr;
    tokio::spawn(state.sync.clone().run());

    let router = app(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "authz-gateway listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
    }
}
