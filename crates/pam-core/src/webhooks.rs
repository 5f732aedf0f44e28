//! Webhook delivery queue for developer apps.
//!
//! Deliveries are persisted in the `webhook_deliveries` tree and retried with a fixed
//! exponential schedule: after the n-th failed attempt the next one is due
//! `min(300, 2^n * 60)` seconds later. The fifth failure marks the delivery `max_retries`.
//!
//! Bodies are signed at enqueue time (`X-PAM-Signature: sha256=<hex>`), so the worker
//! never needs the app's secret.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{PamError, PamResult};
use crate::store::{get_json, put_json, scan_json, PamStore};

pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;
pub const BASE_RETRY_SECS: u64 = 60;
pub const MAX_RETRY_SECS: u64 = 300;

pub const SIGNATURE_HEADER: &str = "X-PAM-Signature";
pub const EVENT_HEADER: &str = "X-PAM-Event";
pub const DELIVERY_HEADER: &str = "X-PAM-Delivery";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEvent {
    #[serde(rename = "api_key.rotated")]
    ApiKeyRotated,
    #[serde(rename = "rate_limit.exceeded")]
    RateLimitExceeded,
    #[serde(rename = "app.deactivated")]
    AppDeactivated,
    #[serde(rename = "usage.daily_limit_warning")]
    UsageWarning,
    #[serde(rename = "test")]
    Test,
}

impl WebhookEvent {
    pub const NAMES: &'static [&'static str] = &[
        "api_key.rotated",
        "rate_limit.exceeded",
        "app.deactivated",
        "usage.daily_limit_warning",
        "test",
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WebhookEvent::ApiKeyRotated => "api_key.rotated",
            WebhookEvent::RateLimitExceeded => "rate_limit.exceeded",
            WebhookEvent::AppDeactivated => "app.deactivated",
            WebhookEvent::UsageWarning => "usage.daily_limit_warning",
            WebhookEvent::Test => "test",
        }
    }
}

impl fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "api_key.rotated" => Ok(WebhookEvent::ApiKeyRotated),
            "rate_limit.exceeded" => Ok(WebhookEvent::RateLimitExceeded),
            "app.deactivated" => Ok(WebhookEvent::AppDeactivated),
            "usage.daily_limit_warning" => Ok(WebhookEvent::UsageWarning),
            "test" => Ok(WebhookEvent::Test),
            other => Err(format!("unknown webhook event '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    /// Last attempt failed; another one is scheduled at `next_retry`.
    Failed,
    MaxRetries,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::MaxRetries)
    }
}

/// Where and how to deliver one app's events.
#[derive(Debug, Clone)]
pub struct WebhookTarget {
    pub app_id: String,
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub delivery_id: String,
    pub app_id: String,
    pub url: String,
    pub event: WebhookEvent,
    pub body: String,
    pub signature: String,
    pub attempts: u32,
    pub status: DeliveryStatus,
    pub next_retry: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_status_code: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    fn key(&self) -> String {
        delivery_key(&self.app_id, &self.delivery_id)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.next_retry.map(|t| t <= now).unwrap_or(false)
    }
}

fn delivery_key(app_id: &str, delivery_id: &str) -> String {
    format!("{}:{}", app_id, delivery_id)
}

/// Delay before the next attempt once `attempts` attempts have failed.
pub fn retry_delay_secs(attempts: u32) -> u64 {
    2u64.checked_pow(attempts)
        .and_then(|p| p.checked_mul(BASE_RETRY_SECS))
        .map(|d| d.min(MAX_RETRY_SECS))
        .unwrap_or(MAX_RETRY_SECS)
}

/// `sha256=<hex HMAC-SHA256(secret, body)>`
pub fn sign_payload(secret: &str, body: &str) -> PamResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PamError::Internal(format!("webhook signing key: {}", e)))?;
    mac.update(body.as_bytes());
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Constant-time check of a `sha256=<hex>` header, for receivers and tests.
pub fn verify_signature(secret: &str, body: &str, header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else { return false };
    let Ok(expected) = hex::decode(hex_sig) else { return false };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else { return false };
    mac.update(body.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Outcome of one HTTP attempt: the response status, or a transport error.
pub type SendOutcome = Result<u16, String>;

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(&self, delivery: &WebhookDelivery) -> SendOutcome;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: std::time::Duration) -> PamResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pam-webhooks/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PamError::Internal(format!("webhook client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn send(&self, delivery: &WebhookDelivery) -> SendOutcome {
        let res = self
            .client
            .post(&delivery.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, &delivery.signature)
            .header(EVENT_HEADER, delivery.event.as_str())
            .header(DELIVERY_HEADER, &delivery.delivery_id)
            .body(delivery.body.clone())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(res.status().as_u16())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub exhausted: usize,
}

pub struct WebhookQueue {
    store: PamStore,
    transport: Arc<dyn WebhookTransport>,
}

impl WebhookQueue {
    pub fn new(store: PamStore, transport: Arc<dyn WebhookTransport>) -> Self {
        Self { store, transport }
    }

    pub fn enqueue(
        &self,
        target: &WebhookTarget,
        event: WebhookEvent,
        data: serde_json::Value,
    ) -> PamResult<WebhookDelivery> {
        self.enqueue_at(target, event, data, Utc::now())
    }

    /// Persist a signed delivery, due immediately.
    pub fn enqueue_at(
        &self,
        target: &WebhookTarget,
        event: WebhookEvent,
        data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> PamResult<WebhookDelivery> {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        let delivery_id = format!("dlv_{}_{}", now.timestamp_millis(), &simple[..12]);
        let body = serde_json::json!({
            "delivery_id": delivery_id,
            "event": event.as_str(),
            "app_id": target.app_id,
            "created_at": now.to_rfc3339(),
            "data": data,
        })
        .to_string();
        let signature = sign_payload(&target.secret, &body)?;

        let delivery = WebhookDelivery {
            delivery_id,
            app_id: target.app_id.clone(),
            url: target.url.clone(),
            event,
            body,
            signature,
            attempts: 0,
            status: DeliveryStatus::Pending,
            next_retry: Some(now),
            last_error: None,
            last_status_code: None,
            created_at: now,
            delivered_at: None,
        };
        put_json(self.store.deliveries(), &delivery.key(), &delivery)?;
        debug!(
            target: "pam::webhooks",
            app_id = %delivery.app_id,
            delivery_id = %delivery.delivery_id,
            event = %event,
            "Webhook queued"
        );
        Ok(delivery)
    }

    pub fn get(&self, app_id: &str, delivery_id: &str) -> PamResult<WebhookDelivery> {
        get_json(self.store.deliveries(), &delivery_key(app_id, delivery_id))?
            .ok_or_else(|| PamError::not_found(format!("Delivery {}", delivery_id)))
    }

    /// Newest first.
    pub fn deliveries_for(&self, app_id: &str, limit: usize) -> PamResult<Vec<WebhookDelivery>> {
        let mut all: Vec<WebhookDelivery> =
            scan_json::<WebhookDelivery>(self.store.deliveries(), &format!("{}:", app_id))?
                .into_iter()
                .map(|(_, d)| d)
                .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.delivery_id.cmp(&a.delivery_id)));
        all.truncate(limit);
        Ok(all)
    }

    pub fn due(&self, now: DateTime<Utc>) -> PamResult<Vec<WebhookDelivery>> {
        let mut due: Vec<WebhookDelivery> = scan_json::<WebhookDelivery>(self.store.deliveries(), "")?
            .into_iter()
            .map(|(_, d)| d)
            .filter(|d| d.is_due(now))
            .collect();
        due.sort_by_key(|d| d.next_retry);
        Ok(due)
    }

    /// One delivery attempt; the updated record is persisted and returned.
    pub async fn attempt(&self, mut delivery: WebhookDelivery, now: DateTime<Utc>) -> PamResult<WebhookDelivery> {
        if delivery.status.is_terminal() {
            return Ok(delivery);
        }

        let outcome = self.transport.send(&delivery).await;
        delivery.attempts += 1;

        match outcome {
            Ok(code) if (200..300).contains(&code) => {
                delivery.status = DeliveryStatus::Delivered;
                delivery.delivered_at = Some(now);
                delivery.next_retry = None;
                delivery.last_error = None;
                delivery.last_status_code = Some(code);
                info!(
                    target: "pam::webhooks",
                    app_id = %delivery.app_id,
                    delivery_id = %delivery.delivery_id,
                    attempts = delivery.attempts,
                    "Webhook delivered"
                );
            }
            failure => {
                let (code, err) = match failure {
                    Ok(code) => (Some(code), format!("HTTP {}", code)),
                    Err(e) => (None, e),
                };
                delivery.last_status_code = code;
                delivery.last_error = Some(err);
                if delivery.attempts >= MAX_DELIVERY_ATTEMPTS {
                    delivery.status = DeliveryStatus::MaxRetries;
                    delivery.next_retry = None;
                    warn!(
                        target: "pam::webhooks",
                        app_id = %delivery.app_id,
                        delivery_id = %delivery.delivery_id,
                        error = ?delivery.last_error,
                        "Webhook gave up after {} attempts",
                        delivery.attempts
                    );
                } else {
                    let delay = retry_delay_secs(delivery.attempts);
                    delivery.status = DeliveryStatus::Failed;
                    delivery.next_retry = Some(now + Duration::seconds(delay as i64));
                    warn!(
                        target: "pam::webhooks",
                        app_id = %delivery.app_id,
                        delivery_id = %delivery.delivery_id,
                        attempts = delivery.attempts,
                        retry_in_secs = delay,
                        error = ?delivery.last_error,
                        "Webhook attempt failed"
                    );
                }
            }
        }

        put_json(self.store.deliveries(), &delivery.key(), &delivery)?;
        Ok(delivery)
    }

    pub async fn process_due(&self, now: DateTime<Utc>) -> PamResult<DeliveryReport> {
        let mut report = DeliveryReport::default();
        for delivery in self.due(now)? {
            let updated = self.attempt(delivery, now).await?;
            report.attempted += 1;
            match updated.status {
                DeliveryStatus::Delivered => report.delivered += 1,
                DeliveryStatus::MaxRetries => report.exhausted += 1,
                _ => report.failed += 1,
            }
        }
        Ok(report)
    }

    /// Background loop: processes due deliveries every `every` until `shutdown` flips to true.
    pub async fn run_worker(
        self: Arc<Self>,
        every: std::time::Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(every);
        info!(target: "pam::webhooks", interval_secs = every.as_secs(), "Webhook worker started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.process_due(Utc::now()).await {
                        Ok(report) if report.attempted > 0 => {
                            info!(
                                target: "pam::webhooks",
                                attempted = report.attempted,
                                delivered = report.delivered,
                                failed = report.failed,
                                exhausted = report.exhausted,
                                "Webhook tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(target: "pam::webhooks", error = %e, "Webhook tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(target: "pam::webhooks", "Webhook worker stopped");
    }
}
