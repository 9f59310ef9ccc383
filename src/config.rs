use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::errors::ConfigError;

/// Parse a human-friendly duration string: bare numbers are seconds,
/// otherwise `ms`, `s`, `m`, `h` suffixes are accepted.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    if let Some(num) = s.strip_suffix("ms") {
        let n: u64 = num
            .parse()
            .map_err(|_| format!("invalid number in duration: {num}"))?;
        return Ok(Duration::from_millis(n));
    }
    let (num, suffix) = s.split_at(s.len() - 1);
    let n: u64 = num
        .parse()
        .map_err(|_| format!("invalid number in duration: {num}"))?;
    match suffix {
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(format!("invalid duration suffix: {suffix}")),
    }
}

fn env_duration(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(v) => parse_duration(&v).map_err(|reason| ConfigError::InvalidValue {
            key: key.to_string(),
            reason,
        }),
        Err(_) => Ok(default),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("not an integer: {v}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingRequired {
        key: key.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

/// Protected backend the gateway forwards permitted requests to.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub timeout: Duration,
}

/// External rule-evaluation service (the delegated half of the PDP).
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub url: String,
    pub timeout: Duration,
}

/// Policy distribution service the sync client pulls bundles from.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// Stable identity of this enforcement point, used by the distribution
    /// service to filter the bundle to what this instance needs.
    pub bouncer_id: String,
    pub environment: String,
    pub interval: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub leeway_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub policy_ttl: Duration,
    pub policy_max_entries: usize,
    pub decision_ttl: Duration,
    pub decision_max_entries: usize,
}

#[derive(Debug, Clone)]
pub struct IngestionSettings {
    /// JSON file holding sources/rules/security policies; enrichment is
    /// disabled when unset.
    pub config_path: Option<String>,
    pub worker_limit: usize,
    /// Source names this instance may read from; empty means all.
    pub allowed_sources: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub evaluator: EvaluatorConfig,
    pub sync: SyncConfig,
    pub jwt: JwtConfig,
    pub cache: CacheSettings,
    pub ingestion: IngestionSettings,
    /// Context keys that participate in the decision fingerprint.
    pub decision_context_keys: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080);
        let host: IpAddr = std::env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let upstream = UpstreamConfig {
            url: env_required("UPSTREAM_URL")?,
            timeout: env_duration("UPSTREAM_TIMEOUT", Duration::from_secs(30))?,
        };
        let evaluator = EvaluatorConfig {
            url: env_required("EVALUATOR_URL")?,
            timeout: env_duration("EVALUATOR_TIMEOUT", Duration::from_secs(5))?,
        };
        let sync = SyncConfig {
            url: std::env::var("SYNC_URL").ok(),
            api_key: std::env::var("SYNC_API_KEY").ok(),
            bouncer_id: std::env::var("BOUNCER_ID")
                .unwrap_or_else(|_| format!("authz-gateway-{}", uuid::Uuid::new_v4())),
            environment: std::env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            interval: env_duration("SYNC_INTERVAL", Duration::from_secs(300))?,
            request_timeout: env_duration("SYNC_TIMEOUT", Duration::from_secs(10))?,
        };
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET").ok(),
            issuer: std::env::var("JWT_ISSUER").ok(),
            audience: std::env::var("JWT_AUDIENCE").ok(),
            leeway_seconds: env_usize("JWT_LEEWAY_SECONDS", 60)? as u64,
        };
        let cache = CacheSettings {
            policy_ttl: env_duration("POLICY_CACHE_TTL", Duration::from_secs(600))?,
            policy_max_entries: env_usize("POLICY_CACHE_MAX_ENTRIES", 16)?,
            decision_ttl: env_duration("DECISION_CACHE_TTL", Duration::from_secs(60))?,
            decision_max_entries: env_usize("DECISION_CACHE_MAX_ENTRIES", 10_000)?,
        };
        let ingestion = IngestionSettings {
            config_path: std::env::var("INGESTION_CONFIG_PATH").ok(),
            worker_limit: env_usize("INGESTION_WORKERS", 4)?,
            allowed_sources: std::env::var("INGESTION_ALLOWED_SOURCES")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        };
        let decision_context_keys = std::env::var("DECISION_CONTEXT_KEYS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| vec!["client_ip".to_string(), "security_level".to_string()]);

        Ok(Self {
            server: ServerConfig {
                bind_addr: SocketAddr::new(host, port),
            },
            upstream,
            evaluator,
            sync,
            jwt,
            cache,
            ingestion,
            decision_context_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_seconds() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn parses_suffixed_durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn rejects_garbage_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("5y").is_err());
    }
}
