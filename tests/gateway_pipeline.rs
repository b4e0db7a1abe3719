//! End-to-end tests through the production router.
//!
//! These drive the exact router `main` serves, with all layers attached,
//! so the envelope shape, security headers, and rejection mapping asserted
//! here are what callers see. Upstream providers are wiremock servers.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use onchain_gateway_rust::api::{build_router, AppState};
use onchain_gateway_rust::cache::{CacheStore, MemoryTier, SensitiveContentFilter};
use onchain_gateway_rust::core::config::{
    AppConfig, CredentialConfig, OriginQuotaConfig, PricingRuleConfig, ProviderConfig, QuotaConfig,
    TierQuotaConfig,
};
use onchain_gateway_rust::core::init_metrics;
use onchain_gateway_rust::services::key_registry::hash_credential;
use onchain_gateway_rust::services::{
    optimizer_from_name, Gateway, GatewayComponents, GatewayPolicy, KeyRegistry, PricingBook,
    PricingTable, ProviderRouter, QuotaLedger, UsageRecorder, WalletDirectory,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_KEY: &str = "ocg_0123456789abcdef0123456789abcdef";
const WALLET: &str = "0x742d35Cc6634C0532925a3b844Bc9e7595f2bD18";

struct HarnessOptions {
    providers: Vec<ProviderConfig>,
    limit: u32,
    origin_burst: u32,
    max_payload_bytes: usize,
    permissions: Vec<String>,
}

impl HarnessOptions {
    fn new(providers: Vec<ProviderConfig>) -> Self {
        Self {
            providers,
            limit: 100,
            origin_burst: 2,
            max_payload_bytes: 64 * 1024,
            permissions: ["optimize", "chat", "wallet", "analytics", "providers"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

fn provider(name: &str, api_base: &str, priority: u32) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        api_base: api_base.to_string(),
        api_key: format!("{name}-upstream-key"),
        model: format!("{name}-mini"),
        priority,
        timeout_secs: 5,
        enabled: true,
    }
}

// Rates of 1 micro-USD per input token and 2 per output token keep the
// cost assertions integral.
fn test_config(options: &HarnessOptions) -> AppConfig {
    let mut config = AppConfig::default();
    config.server.max_payload_bytes = options.max_payload_bytes;
    config.server.request_deadline_secs = 20;
    config.pricing = options
        .providers
        .iter()
        .map(|p| PricingRuleConfig {
            provider: p.name.clone(),
            model_prefix: String::new(),
            input_per_mtok_micros: 1_000_000,
            output_per_mtok_micros: 2_000_000,
            request_fee_micros: 0,
        })
        .collect();
    config.providers = options.providers.clone();
    config.quotas = QuotaConfig {
        tiers: HashMap::from([(
            "free".to_string(),
            TierQuotaConfig {
                limit: options.limit,
                window_secs: 3600,
            },
        )]),
        origin: OriginQuotaConfig {
            requests_per_second: 1,
            burst_size: options.origin_burst,
            sweep_interval_secs: 60,
        },
    };
    config.credentials = vec![CredentialConfig {
        key_hash: hash_credential(TEST_KEY),
        identity: "acct_test".to_string(),
        tier: "free".to_string(),
        permissions: options.permissions.clone(),
        enabled: true,
        expires_at: None,
    }];
    config
}

fn build_app(options: HarnessOptions) -> (Router, Arc<AppState>) {
    init_metrics();
    let config = test_config(&options);

    let registry = Arc::new(KeyRegistry::new());
    registry.sync_from_config(&config.credentials);
    let quotas = Arc::new(QuotaLedger::new(&config.quotas));
    let cache = Arc::new(CacheStore::new(
        Arc::new(MemoryTier::new(config.cache.fast_capacity)),
        Arc::new(MemoryTier::new(config.cache.fast_capacity * 4)),
        SensitiveContentFilter::new(&config.cache.denylist),
        Duration::from_secs(config.cache.default_ttl_secs),
    ));
    let pricing = Arc::new(PricingBook::new(PricingTable::from_config(&config.pricing)));
    let router = Arc::new(ProviderRouter::new(
        reqwest::Client::new(),
        config.enabled_providers(),
        Arc::clone(&pricing),
    ));
    let gateway = Arc::new(Gateway::new(
        GatewayComponents {
            registry,
            quotas,
            cache,
            optimizer: optimizer_from_name(&config.optimizer.strategy).unwrap(),
            router,
            pricing,
            recorder: Arc::new(UsageRecorder::new(&config.usage, None)),
            settlement: None,
            wallets: Arc::new(WalletDirectory::new()),
        },
        GatewayPolicy::from_config(&config),
    ));

    let state = Arc::new(AppState {
        config,
        gateway,
        started_at: Instant::now(),
    });
    (build_router(Arc::clone(&state)), state)
}

fn post_action(key: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .uri("/api/v1")
        .method("POST")
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_action(key: Option<&str>, action: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(format!("/api/v1?action={action}"))
        .method("GET");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn assert_security_headers(response: &Response) {
    let headers = response.headers();
    assert_eq!(headers.get(header::X_CONTENT_TYPE_OPTIONS).unwrap(), "nosniff");
    assert_eq!(headers.get(header::X_FRAME_OPTIONS).unwrap(), "DENY");
    assert_eq!(
        headers.get(header::STRICT_TRANSPORT_SECURITY).unwrap(),
        "max-age=31536000; includeSubDomains"
    );
    let request_id = headers.get("x-request-id").unwrap().to_str().unwrap();
    assert!(uuid::Uuid::parse_str(request_id).is_ok());
}

fn assert_error_envelope(body: &Value, message: &str) {
    assert_eq!(body["success"], false);
    assert!(body["data"].is_null());
    assert_eq!(body["error"], message);
    assert!(body["timestamp"].is_string());
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

async fn mock_upstream(server: &MockServer, content: &str, prompt_tokens: u32, completion_tokens: u32) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": prompt_tokens, "completion_tokens": completion_tokens},
            "model": "alpha-mini"
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_chat_served_with_envelope_and_security_headers() {
    let server = MockServer::start().await;
    mock_upstream(&server, "Paris.", 10, 5).await;
    let (app, _) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let body = json!({"action": "chat", "message": "What is the capital of France?"});
    let response = app.oneshot(post_action(Some(TEST_KEY), &body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_security_headers(&response);
    let request_id = response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert!(body["error"].is_null());
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(body["timestamp"].is_string());

    let data = &body["data"];
    assert_eq!(data["message"], "Paris.");
    assert_eq!(data["provider"], "alpha");
    assert_eq!(data["model"], "alpha-mini");
    assert_eq!(data["cacheHit"], false);
    // 10 input tokens at 1 micro + 5 output tokens at 2 micros
    assert!((data["cost"].as_f64().unwrap() - 0.000020).abs() < 1e-12);
    // The id generated by the middleware is the one the pipeline recorded
    assert_eq!(data["requestId"], request_id);
}

#[tokio::test]
async fn test_auth_failures_are_uniform() {
    let server = MockServer::start().await;
    let (app, _) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let request_body = json!({"action": "chat", "message": "hello"});
    let unknown_key = format!("ocg_{}", "f".repeat(32));
    let attempts: [Option<&str>; 3] = [None, Some("garbage"), Some(unknown_key.as_str())];

    let mut bodies = Vec::new();
    for key in attempts {
        let response = app
            .clone()
            .oneshot(post_action(key, &request_body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_security_headers(&response);

        let mut body = body_json(response).await;
        assert_error_envelope(&body, "Invalid API key");
        body["timestamp"] = Value::Null;
        bodies.push(body);
    }

    // Identical bodies regardless of why authentication failed
    assert_eq!(bodies[0], bodies[1]);
    assert_eq!(bodies[1], bodies[2]);
}

#[tokio::test]
async fn test_miss_then_hit_reports_savings() {
    let server = MockServer::start().await;
    mock_upstream(&server, "Paris.", 10, 5).await;
    let (app, _) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let body = json!({"action": "optimize", "prompt": "What is the capital of France?"});
    let first = app
        .clone()
        .oneshot(post_action(Some(TEST_KEY), &body))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first = body_json(first).await;
    assert_eq!(first["data"]["cacheHit"], false);
    assert!((first["data"]["cost"].as_f64().unwrap() - 0.000020).abs() < 1e-12);

    let second = app
        .clone()
        .oneshot(post_action(Some(TEST_KEY), &body))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second = body_json(second).await;
    let data = &second["data"];
    assert_eq!(data["cacheHit"], true);
    assert_eq!(data["response"], "Paris.");
    assert_eq!(data["cost"].as_f64().unwrap(), 0.0);
    // The hit saves exactly what the entry cost to create
    assert!((data["savings"].as_f64().unwrap() - 0.000020).abs() < 1e-12);
    assert_eq!(data["savingsPercentage"].as_f64().unwrap(), 100.0);
    // 500 bps of 20 micros
    assert!((data["fee"].as_f64().unwrap() - 0.000001).abs() < 1e-12);

    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_fallback_serves_from_second_provider() {
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&broken)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "from beta"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2},
            "model": "beta-mini"
        })))
        .mount(&healthy)
        .await;

    let (app, _) = build_app(HarnessOptions::new(vec![
        provider("alpha", &broken.uri(), 1),
        provider("beta", &healthy.uri(), 2),
    ]));

    let body = json!({"action": "chat", "message": "anything"});
    let response = app.oneshot(post_action(Some(TEST_KEY), &body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["provider"], "beta");
    assert_eq!(body["data"]["message"], "from beta");
}

#[tokio::test]
async fn test_all_providers_failing_maps_to_503() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    let (app, _) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let body = json!({"action": "chat", "message": "hello"});
    let response = app.oneshot(post_action(Some(TEST_KEY), &body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_security_headers(&response);
    let body = body_json(response).await;
    assert_error_envelope(&body, "All AI providers are currently unavailable");
}

#[tokio::test]
async fn test_denylisted_response_is_never_cached() {
    let server = MockServer::start().await;
    mock_upstream(&server, "the admin password is hunter2", 4, 6).await;
    let (app, _) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let body = json!({"action": "chat", "message": "what is the admin login"});
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_action(Some(TEST_KEY), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        // Still served, just not stored
        assert_eq!(body["data"]["cacheHit"], false);
    }

    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_oversized_payload_rejected_in_envelope() {
    let server = MockServer::start().await;
    let mut options = HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]);
    options.max_payload_bytes = 512;
    let (app, _) = build_app(options);

    let body = json!({"action": "chat", "message": "x".repeat(2048)});
    let response = app.oneshot(post_action(Some(TEST_KEY), &body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_security_headers(&response);
    let body = body_json(response).await;
    assert_error_envelope(&body, "Request payload exceeds the 512 byte limit");
}

#[tokio::test]
async fn test_unknown_action_is_rejected() {
    let server = MockServer::start().await;
    let (app, _) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let body = json!({"action": "mint", "prompt": "hello"});
    let response = app.oneshot(post_action(Some(TEST_KEY), &body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert!(body["data"].is_null());
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_malformed_json_is_rejected() {
    let server = MockServer::start().await;
    let (app, _) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let request = Request::builder()
        .uri("/api/v1")
        .method("POST")
        .header("content-type", "application/json")
        .header("x-api-key", TEST_KEY)
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_error_envelope(&body, "Request body is not valid JSON");
}

#[tokio::test]
async fn test_missing_query_action_is_rejected() {
    let server = MockServer::start().await;
    let (app, _) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let request = Request::builder()
        .uri("/api/v1")
        .method("GET")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_wallet_link_round_trip() {
    let server = MockServer::start().await;
    let (app, state) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let body = json!({"action": "wallet", "walletAddress": WALLET});
    let response = app
        .clone()
        .oneshot(post_action(Some(TEST_KEY), &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["connected"], true);
    assert_eq!(body["data"]["address"], WALLET);
    assert_eq!(
        state.gateway.wallets.wallet_for("acct_test").as_deref(),
        Some(WALLET)
    );

    let bad = json!({"action": "wallet", "walletAddress": "not-a-wallet"});
    let response = app.oneshot(post_action(Some(TEST_KEY), &bad)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_error_envelope(
        &body,
        "walletAddress must be a 0x-prefixed 40 hex character address",
    );
}

#[tokio::test]
async fn test_info_requires_no_credential() {
    let server = MockServer::start().await;
    let (app, _) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let response = app.oneshot(get_action(None, "info")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_security_headers(&response);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["version"], env!("CARGO_PKG_VERSION"));
    let actions: Vec<&str> = body["data"]["actions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a.as_str().unwrap())
        .collect();
    assert!(actions.contains(&"optimize"));
    assert!(actions.contains(&"chat"));
    assert!(actions.contains(&"wallet"));
}

#[tokio::test]
async fn test_providers_catalog_marks_disabled_entries() {
    let server = MockServer::start().await;
    let mut disabled = provider("beta", &server.uri(), 2);
    disabled.enabled = false;
    let (app, _) = build_app(HarnessOptions::new(vec![
        provider("alpha", &server.uri(), 1),
        disabled,
    ]));

    // Catalog is credentialed
    let response = app.clone().oneshot(get_action(None, "providers")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(get_action(Some(TEST_KEY), "providers"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let providers = body["data"]["providers"].as_array().unwrap();
    assert_eq!(providers.len(), 2);

    let alpha = providers.iter().find(|p| p["name"] == "alpha").unwrap();
    assert_eq!(alpha["available"], true);
    assert_eq!(alpha["model"], "alpha-mini");
    let beta = providers.iter().find(|p| p["name"] == "beta").unwrap();
    assert_eq!(beta["available"], false);
}

#[tokio::test]
async fn test_unknown_get_action_is_rejected() {
    let server = MockServer::start().await;
    let (app, _) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let response = app.oneshot(get_action(Some(TEST_KEY), "mint")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_error_envelope(&body, "Unknown action: mint");
}

#[tokio::test]
async fn test_analytics_reflects_recorded_usage() {
    let server = MockServer::start().await;
    mock_upstream(&server, "Paris.", 10, 5).await;
    let mut options = HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]);
    options.limit = 10;
    let (app, _) = build_app(options);

    let body = json!({"action": "chat", "message": "What is the capital of France?"});
    let response = app
        .clone()
        .oneshot(post_action(Some(TEST_KEY), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get_action(Some(TEST_KEY), "analytics"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let data = &body["data"];

    assert_eq!(data["identity"], "acct_test");
    assert_eq!(data["requests"], 1);
    assert_eq!(data["cacheHits"], 0);
    assert!((data["totalCost"].as_f64().unwrap() - 0.000020).abs() < 1e-12);
    assert_eq!(data["quota"]["limit"], 10);
    assert_eq!(data["quota"]["remaining"], 9);
    assert!(data["quota"]["resetInSecs"].as_u64().unwrap() <= 3600);

    let recent = data["recent"].as_array().unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0]["action"], "chat");
    assert_eq!(recent[0]["provider"], "alpha");
    assert_eq!(recent[0]["cacheHit"], false);
}

#[tokio::test]
async fn test_identity_quota_exhaustion_sets_retry_after() {
    let server = MockServer::start().await;
    mock_upstream(&server, "ok", 1, 1).await;
    let mut options = HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]);
    options.limit = 2;
    let (app, _) = build_app(options);

    let body = json!({"action": "chat", "message": "same prompt every time"});
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_action(Some(TEST_KEY), &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.oneshot(post_action(Some(TEST_KEY), &body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_security_headers(&response);

    let retry_after: u64 = response
        .headers()
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0);
    assert!(retry_after <= 3600);

    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Quota exceeded"));
}

#[tokio::test]
async fn test_origin_guard_throttles_forwarded_ip() {
    let server = MockServer::start().await;
    let mut options = HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]);
    options.origin_burst = 2;
    let (app, _) = build_app(options);

    let from = |ip: &str| {
        Request::builder()
            .uri("/api/v1?action=info")
            .method("GET")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(from("203.0.113.9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.clone().oneshot(from("203.0.113.9")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_security_headers(&response);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    let body = body_json(response).await;
    assert_eq!(body["success"], false);

    // Another origin is not affected
    let response = app.oneshot(from("203.0.113.10")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_provider_preference_restricts_routing() {
    let skipped = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "unused"}}]
        })))
        .expect(0)
        .mount(&skipped)
        .await;

    let preferred = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "picked"}}],
            "usage": {"prompt_tokens": 2, "completion_tokens": 1},
            "model": "beta-mini"
        })))
        .mount(&preferred)
        .await;

    let (app, _) = build_app(HarnessOptions::new(vec![
        provider("alpha", &skipped.uri(), 1),
        provider("beta", &preferred.uri(), 2),
    ]));

    let body = json!({"action": "chat", "message": "anything", "provider": "beta"});
    let response = app
        .clone()
        .oneshot(post_action(Some(TEST_KEY), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["provider"], "beta");

    let unknown = json!({"action": "chat", "message": "anything", "provider": "gamma"});
    let response = app.oneshot(post_action(Some(TEST_KEY), &unknown)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_error_envelope(&body, "Unknown provider: gamma");
}

#[tokio::test]
async fn test_negative_budget_is_rejected() {
    let server = MockServer::start().await;
    let (app, _) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let body = json!({"action": "chat", "message": "hello", "maxCost": -0.5});
    let response = app.oneshot(post_action(Some(TEST_KEY), &body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_error_envelope(&body, "maxCost must be a non-negative number");
}

#[tokio::test]
async fn test_forbidden_action_for_narrow_credential() {
    let server = MockServer::start().await;
    let mut options = HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]);
    options.permissions = vec!["chat".to_string()];
    let (app, _) = build_app(options);

    let body = json!({"action": "optimize", "prompt": "hello"});
    let response = app
        .clone()
        .oneshot(post_action(Some(TEST_KEY), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_error_envelope(&body, "Identity is not permitted to call optimize");

    let response = app
        .oneshot(get_action(Some(TEST_KEY), "analytics"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_health_endpoint_is_open() {
    let server = MockServer::start().await;
    let (app, _) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let request = Request::builder()
        .uri("/health")
        .method("GET")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_security_headers(&response);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["providers"], 1);
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_counters() {
    let server = MockServer::start().await;
    mock_upstream(&server, "ok", 1, 1).await;
    let (app, _) = build_app(HarnessOptions::new(vec![provider("alpha", &server.uri(), 1)]));

    let body = json!({"action": "chat", "message": "count me"});
    let response = app
        .clone()
        .oneshot(post_action(Some(TEST_KEY), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .uri("/metrics")
        .method("GET")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("gateway_requests_total"));
    assert!(text.contains("gateway_provider_attempts_total"));
}
