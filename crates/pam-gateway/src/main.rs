//! PAM Gateway: developer API, model routing and sandbox validation over HTTP.
//! Webhook deliveries are drained by a background worker that stops with the server.

mod error;
mod extract;
mod handlers;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
    middleware::Next,
    response::Response,
    routing::{get, post, put},
    Router,
};
use pam_core::{
    AppRegistry, EdgeProcessor, HttpTransport, ModelRouter, OrchestratorSelector, PamConfig, PamStore, RateLimiter,
    SandboxValidator, UsageTracker, WebhookQueue, WebhookTransport,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub(crate) struct AppState {
    pub(crate) config: PamConfig,
    pub(crate) store: PamStore,
    pub(crate) apps: AppRegistry,
    pub(crate) usage: UsageTracker,
    pub(crate) limiter: RateLimiter,
    pub(crate) webhooks: Arc<WebhookQueue>,
    pub(crate) router: ModelRouter,
    pub(crate) edge: EdgeProcessor,
    pub(crate) orchestrator: OrchestratorSelector,
    pub(crate) sandbox: SandboxValidator,
}

impl AppState {
    fn new(config: PamConfig, store: PamStore, transport: Arc<dyn WebhookTransport>) -> Self {
        Self {
            apps: AppRegistry::new(store.clone()),
            usage: UsageTracker::new(store.clone()),
            limiter: RateLimiter::new(),
            webhooks: Arc::new(WebhookQueue::new(store.clone(), transport)),
            router: ModelRouter::new(config.models.clone()),
            edge: EdgeProcessor::new(config.edge.clone()),
            orchestrator: OrchestratorSelector::from_config(config.orchestrator_override.as_deref()),
            sandbox: SandboxValidator::new(&config.sandbox),
            store,
            config,
        }
    }
}

fn build_app(state: Arc<AppState>) -> Router {
    use handlers::{developer, pam, sandbox};

    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/developer/register", post(developer::register))
        .route("/api/v1/developer/rate-limits", get(developer::rate_limits))
        .route(
            "/api/v1/developer/apps/:app_id",
            get(developer::get_app).delete(developer::deactivate),
        )
        .route("/api/v1/developer/apps/:app_id/usage", get(developer::usage))
        .route("/api/v1/developer/apps/:app_id/rotate-key", post(developer::rotate_key))
        .route("/api/v1/developer/apps/:app_id/webhook", put(developer::set_webhook))
        .route("/api/v1/developer/apps/:app_id/webhook/test", post(developer::test_webhook))
        .route("/api/v1/developer/apps/:app_id/webhook/deliveries", get(developer::deliveries))
        .route("/api/v1/pam/route", post(pam::route))
        .route("/api/v1/pam/edge", post(pam::edge))
        .route("/api/v1/pam/stats", get(pam::stats))
        .route("/api/v1/sandbox/validate", post(sandbox::validate))
        .with_state(state)
        .layer(axum::middleware::from_fn(log_requests))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[pam-gateway] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PamConfig::load()?;
    let store = PamStore::open(&config.storage_path)?;
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(config.webhooks.timeout_secs))?);
    let state = Arc::new(AppState::new(config, store, transport));
    let addr = state.config.listen_addr();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = tokio::spawn(Arc::clone(&state.webhooks).run_worker(
        Duration::from_secs(state.config.webhooks.poll_interval_secs.max(1)),
        shutdown_rx,
    ));

    let app = build_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(target: "pam::gateway", "{} listening on {}", state.config.app_name, addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(target: "pam::gateway", error = %e, "ctrl_c handler failed");
            }
            tracing::info!(target: "pam::gateway", "Shutdown initiated");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = worker.await {
        tracing::warn!(target: "pam::gateway", error = %e, "Webhook worker did not stop cleanly");
    }
    state.store.flush().await?;
    tracing::info!(target: "pam::gateway", "Store flushed, bye");
    Ok(())
}

async fn log_requests(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    let started = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        target: "pam::http",
        %method,
        path = %path,
        peer = %peer,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, StatusCode};
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let store = PamStore::temporary().unwrap();
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(1)).unwrap());
        Arc::new(AppState::new(PamConfig::default(), store, transport))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        bearer: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, Response, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(key) = bearer {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }
        let req = match body {
            Some(json) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let (parts, body) = res.into_parts();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, Response::from_parts(parts, Body::empty()), json)
    }

    async fn send_raw(app: &Router, uri: &str, content_type: &str, body: &str) -> (StatusCode, String, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body.to_string()))
            .unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let ct = res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, ct, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    async fn register(app: &Router, extra: serde_json::Value) -> serde_json::Value {
        let mut body = serde_json::json!({
            "name": "Route Planner",
            "developer_email": "dev@example.com",
        });
        if let (Some(b), Some(e)) = (body.as_object_mut(), extra.as_object()) {
            b.extend(e.clone());
        }
        let (status, _, json) = send(app, "POST", "/api/v1/developer/register", None, Some(body)).await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        json
    }

    #[tokio::test]
    async fn health_reports_version() {
        let app = build_app(test_state());
        let (status, _, json) = send(&app, "GET", "/api/v1/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["app_name"], "PAM");
        assert_eq!(json["version"], pam_core::version());
    }

    #[tokio::test]
    async fn register_then_read_usage() {
        let app = build_app(test_state());
        let created = register(&app, serde_json::json!({"tier": "basic"})).await;
        let app_id = created["app_id"].as_str().unwrap();
        let key = created["api_key"].as_str().unwrap();
        assert!(pam_core::developer::is_valid_app_id(app_id));
        assert_eq!(created["rate_limit_per_minute"], 300);

        let uri = format!("/api/v1/developer/apps/{}/usage?days=7", app_id);
        let (status, _, json) = send(&app, "GET", &uri, Some(key), None).await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(json["app_id"], app_id);
        assert_eq!(json["period_days"], 7);
        // The usage call itself is counted.
        assert_eq!(json["today_requests"], 1);

        let (status, _, json) = send(&app, "GET", &uri, Some("pam_wrong"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(json["detail"].is_string());

        let (status, _, _) = send(&app, "GET", &uri, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn register_rejects_bad_input() {
        let app = build_app(test_state());
        let body = serde_json::json!({"name": "X", "developer_email": "nope", "tier": "free"});
        let (status, _, json) = send(&app, "POST", "/api/v1/developer/register", None, Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["detail"].as_str().unwrap().contains("developer_email"));
    }

    #[tokio::test]
    async fn rate_limit_table() {
        let app = build_app(test_state());
        let (status, _, json) = send(&app, "GET", "/api/v1/developer/rate-limits", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let tiers = json["tiers"].as_array().unwrap();
        assert_eq!(tiers.len(), 4);
        assert_eq!(tiers[0]["tier"], "free");
        assert_eq!(tiers[0]["requests_per_minute"], 60);
        assert_eq!(tiers[3]["requests_per_minute"], 5000);
    }

    #[tokio::test]
    async fn free_tier_is_limited_with_retry_after() {
        let state = test_state();
        let app = build_app(Arc::clone(&state));
        let created = register(
            &app,
            serde_json::json!({
                "webhook_url": "https://hooks.example.com/pam",
                "webhook_events": ["rate_limit.exceeded"],
            }),
        )
        .await;
        let app_id = created["app_id"].as_str().unwrap();
        let key = created["api_key"].as_str().unwrap();
        let uri = format!("/api/v1/developer/apps/{}", app_id);

        for _ in 0..60 {
            let (status, _, _) = send(&app, "GET", &uri, Some(key), None).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, res, json) = send(&app, "GET", &uri, Some(key), None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(res.headers().contains_key(header::RETRY_AFTER));
        assert!(json["detail"].as_str().unwrap().contains("Rate limit"));

        let queued = state.webhooks.deliveries_for(app_id, 10).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].event, pam_core::WebhookEvent::RateLimitExceeded);
    }

    #[tokio::test]
    async fn rotate_then_deactivate() {
        let state = test_state();
        let app = build_app(Arc::clone(&state));
        let created = register(
            &app,
            serde_json::json!({
                "webhook_url": "https://hooks.example.com/pam",
                "webhook_events": ["api_key.rotated", "app.deactivated"],
            }),
        )
        .await;
        let app_id = created["app_id"].as_str().unwrap();
        let old_key = created["api_key"].as_str().unwrap();

        let uri = format!("/api/v1/developer/apps/{}/rotate-key", app_id);
        let (status, _, json) = send(&app, "POST", &uri, Some(old_key), None).await;
        assert_eq!(status, StatusCode::OK);
        let new_key = json["api_key"].as_str().unwrap().to_string();
        assert_ne!(new_key, old_key);

        let app_uri = format!("/api/v1/developer/apps/{}", app_id);
        let (status, _, _) = send(&app, "GET", &app_uri, Some(old_key), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, json) = send(&app, "DELETE", &app_uri, Some(&new_key), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["is_active"], false);

        let (status, _, _) = send(&app, "GET", &app_uri, Some(&new_key), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let events: Vec<_> = state
            .webhooks
            .deliveries_for(app_id, 10)
            .unwrap()
            .into_iter()
            .map(|d| d.event)
            .collect();
        assert!(events.contains(&pam_core::WebhookEvent::ApiKeyRotated));
        assert!(events.contains(&pam_core::WebhookEvent::AppDeactivated));
    }

    #[tokio::test]
    async fn webhook_configure_test_and_log() {
        let app = build_app(test_state());
        let created = register(&app, serde_json::json!({})).await;
        let app_id = created["app_id"].as_str().unwrap();
        let key = created["api_key"].as_str().unwrap();

        let test_uri = format!("/api/v1/developer/apps/{}/webhook/test", app_id);
        let (status, _, _) = send(&app, "POST", &test_uri, Some(key), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let hook_uri = format!("/api/v1/developer/apps/{}/webhook", app_id);
        let body = serde_json::json!({
            "webhook_url": "https://hooks.example.com/pam",
            "events": ["api_key.rotated"],
        });
        let (status, _, json) = send(&app, "PUT", &hook_uri, Some(key), Some(body)).await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(json["webhook_events"][0], "api_key.rotated");

        let (status, _, json) = send(&app, "POST", &test_uri, Some(key), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "pending");

        let log_uri = format!("/api/v1/developer/apps/{}/webhook/deliveries", app_id);
        let (status, _, json) = send(&app, "GET", &log_uri, Some(key), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["deliveries"].as_array().unwrap().len(), 1);
        assert_eq!(json["deliveries"][0]["event"], "test");
    }

    #[tokio::test]
    async fn voice_greeting_is_answered_at_edge() {
        let app = build_app(test_state());
        let body = serde_json::json!({"message": "Hey PAM!", "is_voice": true});
        let (status, _, json) = send(&app, "POST", "/api/v1/pam/route", None, Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["handled_at_edge"], true);
        assert_eq!(json["edge"]["category"], "greeting");
        assert!(json.get("routing").is_none());
    }

    #[tokio::test]
    async fn complex_tool_query_goes_agentic() {
        let app = build_app(test_state());
        let body = serde_json::json!({
            "message": "Compare the fuel cost of routing through Denver versus Salt Lake and plan the cheapest itinerary",
            "has_tools": true,
        });
        let (status, _, json) = send(&app, "POST", "/api/v1/pam/route", None, Some(body)).await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(json["handled_at_edge"], false);
        assert_eq!(json["orchestrator"]["kind"], "agentic");
        assert_eq!(json["routing"]["complexity"], "complex");

        let (_, _, stats) = send(&app, "GET", "/api/v1/pam/stats", None, None).await;
        assert_eq!(stats["routing"]["total"], 1);
    }

    #[tokio::test]
    async fn empty_route_message_is_rejected() {
        let app = build_app(test_state());
        let body = serde_json::json!({"message": "   "});
        let (status, _, _) = send(&app, "POST", "/api/v1/pam/route", None, Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn edge_endpoint_forwards_long_queries() {
        let app = build_app(test_state());
        let body = serde_json::json!({"query": "what time is it"});
        let (_, _, json) = send(&app, "POST", "/api/v1/pam/edge", None, Some(body)).await;
        assert_eq!(json["handled"], true);

        let body = serde_json::json!({"query": "find a dump station near Moab with fresh water"});
        let (_, _, json) = send(&app, "POST", "/api/v1/pam/edge", None, Some(body)).await;
        assert_eq!(json["handled"], false);
    }

    #[tokio::test]
    async fn sandbox_validate_status_codes() {
        let app = build_app(test_state());
        let ok = serde_json::json!({"code": "import math\nresult = math.sqrt(16)\n"});
        let (status, _, json) = send(&app, "POST", "/api/v1/sandbox/validate", None, Some(ok)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["valid"], true);

        let bad = serde_json::json!({"code": "import os\nos.system('ls')\n"});
        let (status, _, json) = send(&app, "POST", "/api/v1/sandbox/validate", None, Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["valid"], false);
        assert_eq!(json["violations"][0]["kind"], "disallowed_import");
    }

    #[tokio::test]
    async fn malformed_register_body_is_json_400() {
        let app = build_app(test_state());
        let uri = "/api/v1/developer/register";

        let (status, ct, json) = send_raw(&app, uri, "application/json", r#"{"developer_email": "dev@example.com"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(ct.starts_with("application/json"), "{}", ct);
        assert!(json["detail"].as_str().unwrap().contains("name"), "{}", json);

        let (status, ct, json) = send_raw(&app, uri, "application/json", "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(ct.starts_with("application/json"));
        assert!(json["detail"].is_string());

        let (status, _, json) = send_raw(&app, uri, "text/plain", r#"{"name": "X"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["detail"].is_string());
    }

    #[tokio::test]
    async fn malformed_query_is_json_400() {
        let app = build_app(test_state());
        let created = register(&app, serde_json::json!({})).await;
        let app_id = created["app_id"].as_str().unwrap();
        let key = created["api_key"].as_str().unwrap();

        let uri = format!("/api/v1/developer/apps/{}/usage?days=abc", app_id);
        let (status, res, json) = send(&app, "GET", &uri, Some(key), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(res.headers()[header::CONTENT_TYPE].to_str().unwrap().starts_with("application/json"));
        assert!(json["detail"].is_string());
    }

    #[tokio::test]
    async fn sandbox_rejects_missing_code_field_as_json() {
        let app = build_app(test_state());
        let body = serde_json::json!({"source": "print(1)"});
        let (status, _, json) = send(&app, "POST", "/api/v1/sandbox/validate", None, Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["detail"].as_str().unwrap().contains("code"));
    }

    #[tokio::test]
    async fn daily_warning_fires_once_at_threshold() {
        let state = test_state();
        let app = build_app(Arc::clone(&state));
        let created = register(
            &app,
            serde_json::json!({
                "webhook_url": "https://hooks.example.com/pam",
                "webhook_events": ["usage.daily_limit_warning"],
            }),
        )
        .await;
        let app_id = created["app_id"].as_str().unwrap();
        let key = created["api_key"].as_str().unwrap();

        let threshold = pam_core::RateLimitTier::Free.daily_warning_threshold();
        let seeded = state
            .usage
            .record_many_on(app_id, "seed", chrono::Utc::now().date_naive(), threshold - 1)
            .unwrap();
        assert_eq!(seeded, threshold - 1);

        let uri = format!("/api/v1/developer/apps/{}", app_id);
        for _ in 0..2 {
            let (status, _, _) = send(&app, "GET", &uri, Some(key), None).await;
            assert_eq!(status, StatusCode::OK);
        }

        let queued = state.webhooks.deliveries_for(app_id, 10).unwrap();
        let warnings: Vec<_> = queued
            .iter()
            .filter(|d| d.event == pam_core::WebhookEvent::UsageWarning)
            .collect();
        assert_eq!(warnings.len(), 1);
        let body: serde_json::Value = serde_json::from_str(&warnings[0].body).unwrap();
        assert_eq!(body["data"]["requests_today"], threshold);
    }

    #[tokio::test]
    async fn app_details_include_rate_limit_window() {
        let app = build_app(test_state());
        let created = register(&app, serde_json::json!({})).await;
        let app_id = created["app_id"].as_str().unwrap();
        let key = created["api_key"].as_str().unwrap();

        let uri = format!("/api/v1/developer/apps/{}", app_id);
        let (status, _, json) = send(&app, "GET", &uri, Some(key), None).await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(json["app_id"], app_id);
        assert!(json.get("api_key_hash").is_none());
        assert_eq!(json["rate_limit"]["limit"], 60);
        assert_eq!(json["rate_limit"]["remaining"], 59);

        let (_, _, json) = send(&app, "GET", &uri, Some(key), None).await;
        assert_eq!(json["rate_limit"]["remaining"], 58);
    }
}
