//! Operator API tests: authorization endpoints, cache controls, sync
//! administration, and ingestion configuration views.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use authz_gateway::config::{
    AppConfig, CacheSettings, EvaluatorConfig, IngestionSettings, JwtConfig, ServerConfig,
    SyncConfig, UpstreamConfig,
};
use authz_gateway::store::{ConfigStore, IngestionConfig};
use authz_gateway::AppState;
use serde_json::json;
use tokio::net::TcpListener;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(evaluator_url: &str, sync_url: Option<String>) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
        },
        upstream: UpstreamConfig {
            url: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_secs(5),
        },
        evaluator: EvaluatorConfig {
            url: evaluator_url.to_string(),
            timeout: Duration::from_secs(2),
        },
        sync: SyncConfig {
            url: sync_url,
            api_key: Some("tenant-key".to_string()),
            bouncer_id: "gw-admin-1".to_string(),
            environment: "test".to_string(),
            interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(2),
        },
        jwt: JwtConfig {
            secret: None,
            issuer: None,
            audience: None,
            leeway_seconds: 60,
        },
        cache: CacheSettings {
            policy_ttl: Duration::from_secs(600),
            policy_max_entries: 16,
            decision_ttl: Duration::from_secs(60),
            decision_max_entries: 1024,
        },
        ingestion: IngestionSettings {
            config_path: None,
            worker_limit: 4,
            allowed_sources: vec![],
        },
        decision_context_keys: vec!["client_ip".to_string(), "security_level".to_string()],
    }
}

async fn spawn_gateway(config: AppConfig, store: Arc<ConfigStore>) -> String {
    let state = AppState::build(config, store).unwrap();
    let app = authz_gateway::app(state);
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("http://{addr}")
}

fn check_request(user_id: &str) -> serde_json::Value {
    json!({
        "user": {"id": user_id, "roles": ["developer"]},
        "resource": {"id": "doc-1", "type": "document"},
        "action": {"name": "read"},
        "context": {"client_ip": "10.0.0.1"},
    })
}

#[tokio::test]
async fn authorize_endpoint_returns_the_decision_without_forwarding() {
    let evaluator = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"allow": false, "reason": "quota exceeded"})),
        )
        .mount(&evaluator)
        .await;

    let base = spawn_gateway(
        test_config(&evaluator.uri(), None),
        Arc::new(ConfigStore::empty()),
    )
    .await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/authorize"))
        .json(&check_request("alice"))
        .send()
        .await
        .unwrap();
    // A deny is a successful check, not an HTTP error.
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["allow"], json!(false));
    assert_eq!(body["reason"], json!("quota exceeded"));
}

#[tokio::test]
async fn bulk_authorize_decides_items_independently() {
    let evaluator = MockServer::start().await;
    // bob's evaluation fails; alice's succeeds.
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"user": {"id": "bob"}})))
        .respond_with(ResponseTemplate::new(500))
        .mount(&evaluator)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"user": {"id": "alice"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"allow": true})))
        .mount(&evaluator)
        .await;

    let base = spawn_gateway(
        test_config(&evaluator.uri(), None),
        Arc::new(ConfigStore::empty()),
    )
    .await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/authorize/bulk"))
        .json(&json!([check_request("alice"), check_request("bob")]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Vec<serde_json::Value> = resp.json().await.unwrap();
    assert_eq!(body.len(), 2);
    assert_eq!(body[0]["allow"], json!(true));
    assert_eq!(body[1]["error"], json!("evaluation_error"));
}

#[tokio::test]
async fn cache_stats_reflect_traffic_and_clear_resets_entries() {
    let evaluator = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"allow": true})))
        .mount(&evaluator)
        .await;

    let base = spawn_gateway(
        test_config(&evaluator.uri(), None),
        Arc::new(ConfigStore::empty()),
    )
    .await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        client
            .post(format!("{base}/v1/authorize"))
            .json(&check_request("alice"))
            .send()
            .await
            .unwrap();
    }

    let stats: serde_json::Value = client
        .get(format!("{base}/v1/cache/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["decision"]["misses"], json!(1));
    assert_eq!(stats["decision"]["hits"], json!(1));
    assert_eq!(stats["decision"]["entries"], json!(1));

    let cleared: serde_json::Value = client
        .post(format!("{base}/v1/cache/clear"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cleared["cleared"], json!(true));

    let stats: serde_json::Value = client
        .get(format!("{base}/v1/cache/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["decision"]["entries"], json!(0));
}

#[tokio::test]
async fn force_sync_pulls_the_bundle_and_updates_status() {
    let evaluator = MockServer::start().await;
    let distribution = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/bundle"))
        .and(query_param("bouncer", "gw-admin-1"))
        .and(query_param("environment", "test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": "v42",
            "rules": {"default": "deny"},
            "data": {},
        })))
        .mount(&distribution)
        .await;

    let base = spawn_gateway(
        test_config(
            &evaluator.uri(),
            Some(format!("{}/v1/bundle", distribution.uri())),
        ),
        Arc::new(ConfigStore::empty()),
    )
    .await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/sync"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["synced"], json!(true));
    assert_eq!(body["version"], json!("v42"));

    let status: serde_json::Value = client
        .get(format!("{base}/v1/sync/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["healthy"], json!(true));
    assert_eq!(status["bundle_version"], json!("v42"));

    // The distribution call carried the tenant credential.
    let calls = distribution.received_requests().await.unwrap();
    assert_eq!(
        calls[0].headers.get("authorization").unwrap(),
        "Bearer tenant-key"
    );
}

#[tokio::test]
async fn failed_force_sync_returns_503_and_marks_unhealthy() {
    let evaluator = MockServer::start().await;
    let distribution = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&distribution)
        .await;

    let base = spawn_gateway(
        test_config(
            &evaluator.uri(),
            Some(format!("{}/v1/bundle", distribution.uri())),
        ),
        Arc::new(ConfigStore::empty()),
    )
    .await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/v1/sync"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    let status: serde_json::Value = client
        .get(format!("{base}/v1/sync/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["healthy"], json!(false));
    assert!(status["last_error"].is_string());
}

#[tokio::test]
async fn source_listing_redacts_credentials() {
    let evaluator = MockServer::start().await;
    let ingestion_config: IngestionConfig = serde_json::from_value(json!({
        "sources": [{
            "id": "hr-api",
            "name": "hr-api",
            "type": "api",
            "url": "https://hr.internal/api",
            "auth_type": "bearer",
            "credentials": {"token": "supersecret"},
        }],
    }))
    .unwrap();
    let store = Arc::new(ConfigStore::with_config(ingestion_config).unwrap());

    let base = spawn_gateway(test_config(&evaluator.uri(), None), store).await;

    let sources: serde_json::Value = reqwest::get(format!("{base}/v1/ingestion/sources"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sources[0]["id"], json!("hr-api"));
    assert_eq!(sources[0]["credentials"]["token"], json!("***REDACTED***"));

    // The combined config view redacts too.
    let config: serde_json::Value = reqwest::get(format!("{base}/v1/ingestion/config"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        config["sources"][0]["credentials"]["token"],
        json!("***REDACTED***")
    );
}

#[tokio::test]
async fn ingestion_reload_picks_up_file_changes() {
    let evaluator = MockServer::start().await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ingestion.json");
    tokio::fs::write(&path, json!({"sources": [], "rules": []}).to_string())
        .await
        .unwrap();
    let store = Arc::new(ConfigStore::load(&path).await.unwrap());

    let base = spawn_gateway(test_config(&evaluator.uri(), None), store).await;

    tokio::fs::write(
        &path,
        json!({
            "sources": [{
                "id": "profile",
                "name": "profile",
                "type": "api",
                "url": "https://profiles.internal/api",
            }],
            "rules": [{
                "id": "user-context",
                "name": "user-context",
                "source": "profile",
                "target": "user_profile",
            }],
        })
        .to_string(),
    )
    .await
    .unwrap();

    let client = reqwest::Client::new();
    let resp: serde_json::Value = client
        .post(format!("{base}/v1/ingestion/reload"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["reloaded"], json!(true));
    assert_eq!(resp["sources"], json!(1));
    assert_eq!(resp["rules"], json!(1));

    let rules: serde_json::Value = reqwest::get(format!("{base}/v1/ingestion/rules"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rules[0]["id"], json!("user-context"));
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_exposition() {
    let evaluator = MockServer::start().await;
    let base = spawn_gateway(
        test_config(&evaluator.uri(), None),
        Arc::new(ConfigStore::empty()),
    )
    .await;

    // Generate at least one labeled observation before scraping.
    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = reqwest::get(format!("{base}/metrics")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("http_requests_total"));
}
