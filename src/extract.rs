//! Request Context Extractor: turns a raw HTTP request into a normalized
//! [`AuthorizationRequest`].
//!
//! Pure header/URI parsing, no I/O. Identity precedence, later wins:
//! anonymous default -> bearer-token claims -> explicit `X-User-*` identity
//! headers -> generic attribute headers. Derived standard context keys
//! (client_ip, method, path, ...) always win over `X-Context-*` values.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use axum::http::{request::Parts, HeaderMap, Method};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};

use crate::config::JwtConfig;
use crate::errors::ExtractionError;
use crate::models::{Action, AuthorizationRequest, Resource, User};

const USER_ATTR_PREFIX: &str = "x-user-attr-";
const RESOURCE_ATTR_PREFIX: &str = "x-resource-attr-";
const ACTION_ATTR_PREFIX: &str = "x-action-attr-";
const CONTEXT_PREFIX: &str = "x-context-";

/// JWT claims handled structurally; everything else lands in user attributes.
const REGISTERED_CLAIMS: &[&str] = &[
    "sub", "exp", "iat", "nbf", "iss", "aud", "jti", "roles", "permissions", "groups", "scope",
];

/// Verifies bearer tokens when a shared secret is configured. An absent
/// secret or an unverifiable token both degrade to the anonymous user.
pub struct JwtVerifier {
    decoding_key: Option<DecodingKey>,
    validation: Validation,
}

impl JwtVerifier {
    pub fn from_config(cfg: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = cfg.leeway_seconds;
        validation.validate_exp = true;
        if let Some(iss) = &cfg.issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(aud) = &cfg.audience {
            validation.set_audience(&[aud]);
        } else {
            validation.validate_aud = false;
        }
        Self {
            decoding_key: cfg
                .secret
                .as_ref()
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation,
        }
    }

    /// Decode and verify; `None` when verification is off or fails.
    fn decode(&self, token: &str) -> Option<Map<String, Value>> {
        let key = self.decoding_key.as_ref()?;
        match jsonwebtoken::decode::<Map<String, Value>>(token, key, &self.validation) {
            Ok(data) => Some(data.claims),
            Err(err) => {
                tracing::debug!(error = %err, "Bearer token rejected, treating caller as anonymous");
                None
            }
        }
    }
}

/// Build the normalized authorization request from the request head.
pub fn extract_request(
    parts: &Parts,
    remote_addr: Option<SocketAddr>,
    verifier: &JwtVerifier,
) -> Result<AuthorizationRequest, ExtractionError> {
    let headers = &parts.headers;

    let mut user = User::anonymous();
    if let Some(claims) = bearer_token(headers).and_then(|t| verifier.decode(&t)) {
        apply_token_claims(&mut user, &claims);
    }
    apply_identity_headers(&mut user, headers)?;
    fold_attr_headers(headers, USER_ATTR_PREFIX, &mut user.attributes);

    let path = parts.uri.path().to_string();
    let host = header_str(headers, "host")
        .or_else(|| parts.uri.host().map(str::to_string))
        .unwrap_or_default();

    let mut resource = Resource {
        id: format!("{host}:{path}"),
        resource_type: derive_resource_type(&path),
        name: path.clone(),
        ..Resource::default()
    };
    if let Some(id) = header_str(headers, "x-resource-id") {
        resource.id = id;
    }
    if let Some(rt) = header_str(headers, "x-resource-type") {
        resource.resource_type = rt;
    }
    if let Some(name) = header_str(headers, "x-resource-name") {
        resource.name = name;
    }
    resource.owner = header_str(headers, "x-resource-owner");
    fold_attr_headers(headers, RESOURCE_ATTR_PREFIX, &mut resource.attributes);

    let mut action = Action {
        name: derive_action_name(&parts.method),
        action_type: "http".to_string(),
        ..Action::default()
    };
    if let Some(name) = header_str(headers, "x-action-name") {
        action.name = name;
    }
    if let Some(at) = header_str(headers, "x-action-type") {
        action.action_type = at;
    }
    fold_attr_headers(headers, ACTION_ATTR_PREFIX, &mut action.attributes);

    let mut request = AuthorizationRequest {
        user,
        resource,
        action,
        ..AuthorizationRequest::default()
    };

    let ctx = &mut request.context;
    // Generic context headers fold first; the derived standard keys below
    // always win, so a caller cannot spoof client_ip or its siblings.
    let mut extra = std::collections::HashMap::new();
    fold_attr_headers(headers, CONTEXT_PREFIX, &mut extra);
    ctx.extend(extra);

    ctx.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
    ctx.insert(
        "client_ip".into(),
        Value::String(client_ip(headers, remote_addr)),
    );
    if let Some(ua) = header_str(headers, "user-agent") {
        ctx.insert("user_agent".into(), Value::String(ua));
    }
    if let Some(ct) = header_str(headers, "content-type") {
        ctx.insert("content_type".into(), Value::String(ct));
    }
    if let Some(referer) = header_str(headers, "referer") {
        ctx.insert("referer".into(), Value::String(referer));
    }
    let request_id = header_str(headers, "x-request-id")
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    ctx.insert("request_id".into(), Value::String(request_id));
    let scheme = header_str(headers, "x-forwarded-proto")
        .or_else(|| parts.uri.scheme_str().map(str::to_string))
        .unwrap_or_else(|| "http".to_string());
    ctx.insert("scheme".into(), Value::String(scheme));
    ctx.insert("method".into(), Value::String(parts.method.to_string()));
    ctx.insert("path".into(), Value::String(path));
    ctx.insert("host".into(), Value::String(host));
    if let Some(query) = parts.uri.query() {
        ctx.insert("query".into(), Value::String(query.to_string()));
    }

    Ok(request)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn apply_token_claims(user: &mut User, claims: &Map<String, Value>) {
    if let Some(sub) = claims.get("sub").and_then(Value::as_str) {
        user.id = sub.to_string();
    }
    user.roles = string_set_claim(claims.get("roles"));
    user.groups = string_set_claim(claims.get("groups"));
    user.permissions = string_set_claim(claims.get("permissions"));
    // OAuth-style space-separated scopes also count as permissions.
    if let Some(scope) = claims.get("scope").and_then(Value::as_str) {
        user.permissions
            .extend(scope.split_whitespace().map(str::to_string));
    }
    for (key, value) in claims {
        if !REGISTERED_CLAIMS.contains(&key.as_str()) {
            user.attributes.insert(key.clone(), value.clone());
        }
    }
}

/// Accepts both array-of-strings and comma-joined string claim forms.
fn string_set_claim(value: Option<&Value>) -> BTreeSet<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => split_csv(s),
        _ => BTreeSet::new(),
    }
}

fn split_csv(s: &str) -> BTreeSet<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Explicit identity headers override token-derived values when present.
fn apply_identity_headers(user: &mut User, headers: &HeaderMap) -> Result<(), ExtractionError> {
    if let Some(value) = headers.get("x-user-id") {
        let id = value.to_str().map_err(|_| ExtractionError::InvalidHeader {
            name: "x-user-id".to_string(),
        })?;
        user.id = id.to_string();
    }
    if let Some(value) = headers.get("x-user-roles") {
        let roles = value.to_str().map_err(|_| ExtractionError::InvalidHeader {
            name: "x-user-roles".to_string(),
        })?;
        user.roles = split_csv(roles);
    }
    if let Some(value) = headers.get("x-user-permissions") {
        let perms = value.to_str().map_err(|_| ExtractionError::InvalidHeader {
            name: "x-user-permissions".to_string(),
        })?;
        user.permissions = split_csv(perms);
    }
    Ok(())
}

/// Fold every `<prefix><name>` header into the map under `<name>`, joining
/// repeated headers with ", ". New attribute namespaces therefore require no
/// code change.
fn fold_attr_headers(
    headers: &HeaderMap,
    prefix: &str,
    target: &mut std::collections::HashMap<String, Value>,
) {
    for name in headers.keys() {
        let lname = name.as_str().to_ascii_lowercase();
        let Some(attr) = lname.strip_prefix(prefix) else {
            continue;
        };
        if attr.is_empty() {
            continue;
        }
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        target.insert(attr.to_string(), Value::String(joined));
    }
}

fn derive_resource_type(path: &str) -> String {
    let ty = if path.contains("/api/") {
        "api"
    } else if path.contains("/admin") {
        "admin"
    } else if path.contains("/users") {
        "user"
    } else if path.contains("/docs") {
        "documentation"
    } else if path.contains("/health") {
        "health"
    } else if path.ends_with(".json") {
        "json"
    } else if path.ends_with(".xml") {
        "xml"
    } else {
        "document"
    };
    ty.to_string()
}

fn derive_action_name(method: &Method) -> String {
    let name = match *method {
        Method::GET | Method::HEAD | Method::OPTIONS => "read",
        Method::POST => "create",
        Method::PUT | Method::PATCH => "update",
        Method::DELETE => "delete",
        _ => "unknown",
    };
    name.to_string()
}

/// Client IP preference: first `X-Forwarded-For` hop, then `X-Real-IP`,
/// then the socket address.
fn client_ip(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    if let Some(xff) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return real_ip;
    }
    remote_addr.map_or_else(|| "unknown".to_string(), |a| a.ip().to_string())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
