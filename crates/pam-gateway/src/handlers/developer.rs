//! Developer API: app registration, key management, usage and webhook settings.
//!
//! Every app-scoped call goes through `authorize`: bearer key check, rate limit, usage count.

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap},
    Json,
};
use chrono::Utc;
use pam_core::{
    webhooks::WebhookEvent, AppInfo, DeveloperApp, PamError, RateLimitStatus, RateLimitTier, RegisterAppRequest,
    RegisteredApp, UsageSummary,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::error::ApiResult;
use crate::extract::{ApiJson, ApiQuery};
use crate::AppState;

const DEFAULT_USAGE_DAYS: u32 = 30;
const DEFAULT_DELIVERY_LIMIT: usize = 50;
const MAX_DELIVERY_LIMIT: usize = 200;

fn bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
}

/// Queue `event` for the app if it has a webhook subscribed to it. Failures are logged only.
fn notify(state: &AppState, app: &DeveloperApp, event: WebhookEvent, data: Value) {
    let Some(target) = app.webhook_target(event) else { return };
    if let Err(e) = state.webhooks.enqueue(&target, event, data) {
        warn!(target: "pam::webhooks", app_id = %app.app_id, event = %event, error = %e, "Failed to queue webhook");
    }
}

fn authorize(state: &AppState, app_id: &str, headers: &HeaderMap, endpoint: &str) -> ApiResult<DeveloperApp> {
    let app = state.apps.authenticate(app_id, bearer(headers))?;

    if let Err(e) = state.limiter.check(&app.app_id, app.tier) {
        if let PamError::RateLimited { limit, retry_after_secs } = &e {
            warn!(target: "pam::developer", app_id = %app.app_id, limit, "Rate limit exceeded");
            notify(
                state,
                &app,
                WebhookEvent::RateLimitExceeded,
                json!({ "limit": limit, "retry_after_secs": retry_after_secs, "endpoint": endpoint }),
            );
        }
        return Err(e.into());
    }

    match state.usage.record(&app.app_id, endpoint) {
        Ok(today) if today == app.tier.daily_warning_threshold() => notify(
            state,
            &app,
            WebhookEvent::UsageWarning,
            json!({
                "requests_today": today,
                "daily_capacity": app.tier.daily_capacity(),
                "tier": app.tier,
            }),
        ),
        Ok(_) => {}
        Err(e) => warn!(target: "pam::developer", app_id = %app.app_id, error = %e, "Usage not recorded"),
    }
    Ok(app)
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<RegisterAppRequest>,
) -> ApiResult<Json<RegisteredApp>> {
    Ok(Json(state.apps.register(req)?))
}

pub async fn rate_limits() -> Json<Value> {
    let tiers: Vec<Value> = RateLimitTier::ALL
        .iter()
        .map(|t| {
            json!({
                "tier": t,
                "requests_per_minute": t.requests_per_minute(),
                "daily_capacity": t.daily_capacity(),
            })
        })
        .collect();
    Json(json!({ "window_secs": 60, "tiers": tiers }))
}

/// App info plus the caller's current rate-limit window.
#[derive(Serialize)]
pub struct AppDetails {
    #[serde(flatten)]
    app: AppInfo,
    rate_limit: RateLimitStatus,
}

pub async fn get_app(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<AppDetails>> {
    let app = authorize(&state, &app_id, &headers, "GET /apps/:app_id")?;
    Ok(Json(AppDetails {
        rate_limit: state.limiter.status(&app.app_id, app.tier),
        app: app.public_view(),
    }))
}

#[derive(Deserialize)]
pub struct UsageQuery {
    days: Option<u32>,
}

pub async fn usage(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    ApiQuery(q): ApiQuery<UsageQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<UsageSummary>> {
    authorize(&state, &app_id, &headers, "GET /apps/:app_id/usage")?;
    Ok(Json(state.usage.summary(&app_id, q.days.unwrap_or(DEFAULT_USAGE_DAYS))?))
}

pub async fn rotate_key(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    authorize(&state, &app_id, &headers, "POST /apps/:app_id/rotate-key")?;
    let (app, api_key) = state.apps.rotate_key(&app_id)?;
    let rotated_at = app.key_rotated_at.unwrap_or_else(Utc::now);
    notify(&state, &app, WebhookEvent::ApiKeyRotated, json!({ "rotated_at": rotated_at }));
    Ok(Json(json!({
        "app_id": app.app_id,
        "api_key": api_key,
        "rotated_at": rotated_at,
    })))
}

pub async fn deactivate(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    authorize(&state, &app_id, &headers, "DELETE /apps/:app_id")?;
    let app = state.apps.deactivate(&app_id)?;
    state.limiter.reset(&app_id);
    notify(&state, &app, WebhookEvent::AppDeactivated, json!({ "deactivated_at": Utc::now() }));
    Ok(Json(json!({ "app_id": app.app_id, "is_active": app.is_active })))
}

#[derive(Deserialize)]
pub struct WebhookUpdate {
    webhook_url: Option<String>,
    #[serde(default)]
    events: Vec<String>,
}

pub async fn set_webhook(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<WebhookUpdate>,
) -> ApiResult<Json<AppInfo>> {
    authorize(&state, &app_id, &headers, "PUT /apps/:app_id/webhook")?;
    let app = state
        .apps
        .set_webhook(&app_id, body.webhook_url.as_deref(), &body.events)?;
    Ok(Json(app.public_view()))
}

pub async fn test_webhook(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let app = authorize(&state, &app_id, &headers, "POST /apps/:app_id/webhook/test")?;
    let target = app
        .webhook_target(WebhookEvent::Test)
        .ok_or_else(|| PamError::validation("App has no webhook_url configured"))?;
    let delivery = state.webhooks.enqueue(
        &target,
        WebhookEvent::Test,
        json!({ "message": "Test webhook from PAM" }),
    )?;
    Ok(Json(json!({
        "delivery_id": delivery.delivery_id,
        "status": delivery.status,
        "url": delivery.url,
    })))
}

#[derive(Deserialize)]
pub struct DeliveriesQuery {
    limit: Option<usize>,
}

pub async fn deliveries(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    ApiQuery(q): ApiQuery<DeliveriesQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    authorize(&state, &app_id, &headers, "GET /apps/:app_id/webhook/deliveries")?;
    let limit = q.limit.unwrap_or(DEFAULT_DELIVERY_LIMIT).clamp(1, MAX_DELIVERY_LIMIT);
    let deliveries = state.webhooks.deliveries_for(&app_id, limit)?;
    Ok(Json(json!({ "app_id": app_id, "deliveries": deliveries })))
}
