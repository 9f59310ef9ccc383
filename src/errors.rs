use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Malformed inbound request; never reaches the caches.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Invalid header value for {name}")]
    InvalidHeader { name: String },

    #[error("Malformed request: {reason}")]
    MalformedRequest { reason: String },
}

/// Soft failure during context enrichment. Absorbed at the call site;
/// the request proceeds with the unenriched context.
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Data source disabled: {id}")]
    SourceDisabled { id: String },

    #[error("Source type {source_type} is not reachable from this deployment")]
    UnsupportedSource { source_type: String },

    #[error("Rate limit exhausted for source {id}")]
    RateLimited { id: String },

    #[error("Fetch from source {id} timed out after {seconds}s")]
    FetchTimeout { id: String, seconds: u64 },

    #[error("Fetch from source {id} failed: {reason}")]
    FetchFailed { id: String, reason: String },

    #[error("Source {id} returned a non-object payload")]
    InvalidPayload { id: String },
}

/// Policy distribution sync failure. Logged and retried on the next tick;
/// the last-known-good bundle keeps serving.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync is not configured (no distribution service URL)")]
    NotConfigured,

    #[error("Distribution service request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Distribution service returned status {status}")]
    BadStatus { status: u16 },

    #[error("Malformed policy bundle: {reason}")]
    MalformedBundle { reason: String },
}

/// Rule-evaluator failure on a decision-cache miss. Surfaced to the caller
/// as a 5xx; never cached, never defaulted to allow.
#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("Rule evaluator unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Rule evaluation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Rule evaluator returned status {status}")]
    BadStatus { status: u16 },

    #[error("Malformed evaluator response: {reason}")]
    MalformedResponse { reason: String },
}

/// Backend forwarding failure; the decision and audit record are already
/// committed as allowed by the time this can occur.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Backend unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Backend request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Invalid upstream request: {reason}")]
    BadRequest { reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Configuration loading failed: {reason}")]
    LoadFailed { reason: String },
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("JSON processing error")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Internal server error: {context}")]
    Internal { context: String },
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Extraction(_) => StatusCode::BAD_REQUEST,
            Self::Evaluation(EvaluationError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Self::Evaluation(_) => StatusCode::BAD_GATEWAY,
            Self::Proxy(ProxyError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Self::Proxy(_) => StatusCode::BAD_GATEWAY,
            Self::Sync(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Internal { .. } | Self::Json { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            // Ingestion failures are absorbed before reaching a response; if
            // one ever surfaces it is an internal wiring bug.
            Self::Ingestion(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_kind(&self) -> &'static str {
        match self {
            Self::Extraction(_) => "extraction_error",
            Self::Ingestion(_) => "ingestion_error",
            Self::Sync(_) => "sync_error",
            Self::Evaluation(_) => "evaluation_error",
            Self::Proxy(_) => "backend_unavailable",
            Self::Config(_) => "config_error",
            Self::Json { .. } => "json_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.error_kind(), "Request failed");
        } else {
            tracing::warn!(error = %self, kind = self.error_kind(), "Request rejected");
        }
        let body = Json(json!({
            "error": self.error_kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluator_failures_map_to_5xx() {
        let err = AppError::from(EvaluationError::Unreachable {
            reason: "connection refused".into(),
        });
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);

        let err = AppError::from(EvaluationError::Timeout { seconds: 5 });
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn extraction_failures_map_to_400() {
        let err = AppError::from(ExtractionError::MalformedRequest {
            reason: "bad uri".into(),
        });
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn backend_failures_map_to_gateway_statuses() {
        let err = AppError::from(ProxyError::Unreachable {
            reason: "dial".into(),
        });
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        let err = AppError::from(ProxyError::Timeout { seconds: 30 });
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }
}
