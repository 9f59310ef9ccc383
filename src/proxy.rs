//! Enforcement & Forwarding Layer.
//!
//! Every terminal outcome (permit, deny, error) emits exactly one audit
//! record before the response is produced. Permitted requests are
//! reverse-proxied to the protected backend with hop-by-hop headers
//! stripped in both directions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::errors::{AppError, ProxyError};
use crate::metrics;
use crate::models::AuthorizationRequest;
use crate::AppState;

/// RFC 2616 hop-by-hop headers, stripped from both directions.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// One audit record per terminal outcome; nothing from the enriched context
/// beyond the connection facts is logged here.
fn audit(
    request_id: &str,
    method: &str,
    path: &str,
    remote_addr: &str,
    decision: &str,
    reason: &str,
    duration_ms: u128,
) {
    tracing::info!(
        target: "audit",
        request_id = %request_id,
        method = %method,
        path = %path,
        remote_addr = %remote_addr,
        decision = %decision,
        reason = %reason,
        duration_ms = duration_ms as u64,
        "Authorization enforced"
    );
}

/// Fallback handler: the full enforcement pipeline for proxied traffic.
pub async fn enforce(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
) -> Response {
    let start = Instant::now();
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    let (parts, body) = req.into_parts();
    let method = parts.method.to_string();
    let path = parts.uri.path().to_string();

    let mut authz_req = match crate::extract::extract_request(&parts, remote_addr, &state.jwt) {
        Ok(r) => r,
        Err(err) => {
            audit(
                "unknown",
                &method,
                &path,
                &remote_addr.map_or_else(|| "unknown".to_string(), |a| a.to_string()),
                "error",
                &err.to_string(),
                start.elapsed().as_millis(),
            );
            return AppError::from(err).into_response();
        }
    };

    enrich(&state, &mut authz_req).await;

    let request_id = authz_req.request_id().to_string();
    let client_ip = authz_req.client_ip().to_string();

    let decision = match state.engine.evaluate(&authz_req).await {
        Ok(decision) => decision,
        Err(err) => {
            audit(
                &request_id,
                &method,
                &path,
                &client_ip,
                "error",
                &err.to_string(),
                start.elapsed().as_millis(),
            );
            metrics::record_decision("error", &authz_req.resource.resource_type, &authz_req.action.name);
            return AppError::from(err).into_response();
        }
    };

    metrics::record_decision(
        decision.decision_label(),
        &authz_req.resource.resource_type,
        &authz_req.action.name,
    );
    audit(
        &request_id,
        &method,
        &path,
        &client_ip,
        decision.decision_label(),
        &decision.reason,
        start.elapsed().as_millis(),
    );

    if !decision.allow {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "forbidden",
                "reason": decision.reason,
                "request_id": request_id,
            })),
        )
            .into_response();
    }

    match forward(&state, parts, body, &request_id).await {
        Ok(response) => response,
        Err(err) => AppError::from(err).into_response(),
    }
}

/// Context enrichment is best-effort: any failure leaves the original
/// context untouched and the request proceeds.
async fn enrich(state: &AppState, authz_req: &mut AuthorizationRequest) {
    let permissions = authz_req.user.permissions.clone();
    match state
        .ingestion
        .ingest(authz_req, &state.config.ingestion.allowed_sources, &permissions)
        .await
    {
        Ok(enriched) => {
            authz_req.context = enriched.context;
        }
        Err(err) => {
            warn!(error = %err, "Context ingestion failed, proceeding without enrichment");
        }
    }
}

/// Reverse-proxy the permitted request to the protected backend.
async fn forward(
    state: &AppState,
    parts: axum::http::request::Parts,
    body: Body,
    request_id: &str,
) -> Result<Response, ProxyError> {
    let base = state.config.upstream.url.trim_end_matches('/');
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());
    let url = format!("{base}{path_and_query}");

    let mut headers = strip_hop_by_hop(&parts.headers);
    // The client sets these for our listener, not for the backend.
    headers.remove("host");
    headers.remove("content-length");
    if let Ok(value) = request_id.parse() {
        headers.insert("x-request-id", value);
    }

    let outbound = state
        .http
        .request(parts.method, &url)
        .headers(headers)
        .timeout(state.config.upstream.timeout)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let upstream = outbound.send().await.map_err(|e| {
        if e.is_timeout() {
            ProxyError::Timeout {
                seconds: state.config.upstream.timeout.as_secs(),
            }
        } else {
            ProxyError::Unreachable {
                reason: e.to_string(),
            }
        }
    })?;

    let status = upstream.status();
    let response_headers = strip_hop_by_hop(upstream.headers());

    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ProxyError::BadRequest {
            reason: e.to_string(),
        })?;
    *response.headers_mut() = response_headers;
    Ok(response)
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("trailers", HeaderValue::from_static("x"));
        headers.insert("proxy-authenticate", HeaderValue::from_static("basic"));
        headers.insert("proxy-authorization", HeaderValue::from_static("basic x"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let out = strip_hop_by_hop(&headers);
        assert_eq!(out.len(), 2);
        assert_eq!(out.get("x-custom").unwrap(), "kept");
        assert_eq!(out.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn repeated_headers_survive_stripping() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));
        let out = strip_hop_by_hop(&headers);
        assert_eq!(out.get_all("x-tag").iter().count(), 2);
    }
}
