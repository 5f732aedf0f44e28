//! Developer app registry: registration, bearer-key auth, key rotation, webhook settings.
//!
//! API keys are shown once at registration/rotation. Only their SHA-256 is stored, in the
//! `api_keys` tree (hash -> app_id).

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use super::RateLimitTier;
use crate::error::{PamError, PamResult};
use crate::store::{get_json, put_json, PamStore};
use crate::validation::{validate_email, validate_enum, validate_non_empty, validate_webhook_url};
use crate::webhooks::{WebhookEvent, WebhookTarget};

pub const API_KEY_PREFIX: &str = "pam_";
const API_KEY_RANDOM_LEN: usize = 40;
const WEBHOOK_SECRET_PREFIX: &str = "whsec_";

pub const SCOPES: &[&str] = &["chat", "trips", "expenses", "vehicles", "voice"];
const DEFAULT_SCOPE: &str = "chat";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterAppRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub developer_email: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_events: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeveloperApp {
    pub app_id: String,
    pub name: String,
    pub description: Option<String>,
    pub developer_email: String,
    pub tier: RateLimitTier,
    pub scopes: Vec<String>,
    pub webhook_url: Option<String>,
    pub webhook_events: Vec<WebhookEvent>,
    pub webhook_secret: String,
    pub api_key_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub key_rotated_at: Option<DateTime<Utc>>,
}

impl DeveloperApp {
    /// Delivery target for `event`, if the app has a webhook and subscribes to it.
    /// `test` is always delivered when a URL is set.
    pub fn webhook_target(&self, event: WebhookEvent) -> Option<WebhookTarget> {
        let url = self.webhook_url.as_ref()?;
        if event != WebhookEvent::Test && !self.webhook_events.contains(&event) {
            return None;
        }
        Some(WebhookTarget {
            app_id: self.app_id.clone(),
            url: url.clone(),
            secret: self.webhook_secret.clone(),
        })
    }

    pub fn public_view(&self) -> AppInfo {
        AppInfo {
            app_id: self.app_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            developer_email: self.developer_email.clone(),
            tier: self.tier,
            rate_limit_per_minute: self.tier.requests_per_minute(),
            scopes: self.scopes.clone(),
            webhook_url: self.webhook_url.clone(),
            webhook_events: self.webhook_events.clone(),
            is_active: self.is_active,
            created_at: self.created_at,
            key_rotated_at: self.key_rotated_at,
        }
    }
}

/// App details safe to return to the developer (no key hash, no secret).
#[derive(Debug, Clone, Serialize)]
pub struct AppInfo {
    pub app_id: String,
    pub name: String,
    pub description: Option<String>,
    pub developer_email: String,
    pub tier: RateLimitTier,
    pub rate_limit_per_minute: u32,
    pub scopes: Vec<String>,
    pub webhook_url: Option<String>,
    pub webhook_events: Vec<WebhookEvent>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub key_rotated_at: Option<DateTime<Utc>>,
}

/// Returned once by `register`.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredApp {
    pub app_id: String,
    pub api_key: String,
    pub webhook_secret: String,
    pub tier: RateLimitTier,
    pub rate_limit_per_minute: u32,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn new_app_id(now: DateTime<Utc>) -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    format!("app_{}_{}", now.format("%Y%m%d"), &simple[..8])
}

/// True for ids shaped `app_YYYYMMDD_<8 lowercase hex>`.
pub fn is_valid_app_id(app_id: &str) -> bool {
    let Some(rest) = app_id.strip_prefix("app_") else { return false };
    let Some((date, suffix)) = rest.split_once('_') else { return false };
    date.len() == 8
        && date.bytes().all(|b| b.is_ascii_digit())
        && chrono::NaiveDate::parse_from_str(date, "%Y%m%d").is_ok()
        && suffix.len() == 8
        && suffix.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn parse_events(raw: &[String]) -> PamResult<Vec<WebhookEvent>> {
    let mut out = Vec::new();
    for name in raw {
        let ev: WebhookEvent = validate_enum("webhook_events", name, WebhookEvent::NAMES)?;
        if !out.contains(&ev) {
            out.push(ev);
        }
    }
    Ok(out)
}

fn parse_scopes(raw: &[String]) -> PamResult<Vec<String>> {
    if raw.is_empty() {
        return Ok(vec![DEFAULT_SCOPE.to_string()]);
    }
    let mut out: Vec<String> = Vec::new();
    for s in raw {
        let s = s.trim().to_lowercase();
        if !SCOPES.contains(&s.as_str()) {
            return Err(PamError::validation(format!(
                "scopes must be drawn from: {}",
                SCOPES.join(", ")
            )));
        }
        if !out.contains(&s) {
            out.push(s);
        }
    }
    Ok(out)
}

#[derive(Clone)]
pub struct AppRegistry {
    store: PamStore,
}

impl AppRegistry {
    pub fn new(store: PamStore) -> Self {
        Self { store }
    }

    pub fn register(&self, req: RegisterAppRequest) -> PamResult<RegisteredApp> {
        self.register_at(req, Utc::now())
    }

    pub fn register_at(&self, req: RegisterAppRequest, now: DateTime<Utc>) -> PamResult<RegisteredApp> {
        let name = validate_non_empty("name", &req.name)?.to_string();
        let developer_email = validate_email("developer_email", &req.developer_email)?;
        let tier = match req.tier.as_deref() {
            Some(t) => validate_enum::<RateLimitTier>("tier", t, RateLimitTier::NAMES)?,
            None => RateLimitTier::default(),
        };
        let description = match req.description.as_deref().map(str::trim) {
            Some(d) if !d.is_empty() => Some(validate_non_empty("description", d)?.to_string()),
            _ => None,
        };
        let webhook_url = req.webhook_url.as_deref().map(validate_webhook_url).transpose()?;
        let webhook_events = parse_events(&req.webhook_events)?;
        let scopes = parse_scopes(&req.scopes)?;

        let mut app_id = new_app_id(now);
        while self.store.apps().contains_key(app_id.as_bytes())? {
            app_id = new_app_id(now);
        }

        let api_key = format!("{}{}", API_KEY_PREFIX, random_token(API_KEY_RANDOM_LEN));
        let webhook_secret = format!("{}{}", WEBHOOK_SECRET_PREFIX, random_token(32));
        let api_key_hash = hash_api_key(&api_key);

        let app = DeveloperApp {
            app_id: app_id.clone(),
            name,
            description,
            developer_email,
            tier,
            scopes: scopes.clone(),
            webhook_url,
            webhook_events,
            webhook_secret: webhook_secret.clone(),
            api_key_hash: api_key_hash.clone(),
            is_active: true,
            created_at: now,
            key_rotated_at: None,
        };

        put_json(self.store.apps(), &app_id, &app)?;
        self.store.api_keys().insert(api_key_hash.as_bytes(), app_id.as_bytes())?;

        info!(target: "pam::developer", app_id = %app_id, tier = %tier, "Developer app registered");

        Ok(RegisteredApp {
            app_id,
            api_key,
            webhook_secret,
            tier,
            rate_limit_per_minute: tier.requests_per_minute(),
            scopes,
            created_at: now,
        })
    }

    pub fn get(&self, app_id: &str) -> PamResult<DeveloperApp> {
        get_json(self.store.apps(), app_id)?.ok_or_else(|| PamError::not_found(format!("App {}", app_id)))
    }

    /// Resolve a bearer key for `app_id`. Every mismatch is reported as 401.
    pub fn authenticate(&self, app_id: &str, bearer: Option<&str>) -> PamResult<DeveloperApp> {
        let key = bearer
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| PamError::unauthorized("Missing API key"))?;
        let invalid = || PamError::unauthorized("Invalid API key");

        let owner = self
            .store
            .api_keys()
            .get(hash_api_key(key).as_bytes())?
            .ok_or_else(invalid)?;
        if &owner[..] != app_id.as_bytes() {
            return Err(invalid());
        }

        let app: DeveloperApp = get_json(self.store.apps(), app_id)?.ok_or_else(invalid)?;
        if !app.is_active {
            return Err(PamError::unauthorized("App is deactivated"));
        }
        Ok(app)
    }

    /// Issue a new key; the previous one stops working immediately.
    pub fn rotate_key(&self, app_id: &str) -> PamResult<(DeveloperApp, String)> {
        let mut app = self.get(app_id)?;
        let api_key = format!("{}{}", API_KEY_PREFIX, random_token(API_KEY_RANDOM_LEN));
        let new_hash = hash_api_key(&api_key);

        self.store.api_keys().remove(app.api_key_hash.as_bytes())?;
        self.store.api_keys().insert(new_hash.as_bytes(), app_id.as_bytes())?;
        app.api_key_hash = new_hash;
        app.key_rotated_at = Some(Utc::now());
        put_json(self.store.apps(), app_id, &app)?;

        info!(target: "pam::developer", app_id = %app_id, "API key rotated");
        Ok((app, api_key))
    }

    pub fn deactivate(&self, app_id: &str) -> PamResult<DeveloperApp> {
        let mut app = self.get(app_id)?;
        self.store.api_keys().remove(app.api_key_hash.as_bytes())?;
        app.is_active = false;
        put_json(self.store.apps(), app_id, &app)?;
        info!(target: "pam::developer", app_id = %app_id, "Developer app deactivated");
        Ok(app)
    }

    /// Replace the webhook URL and subscribed events. `None` removes the webhook.
    pub fn set_webhook(&self, app_id: &str, url: Option<&str>, events: &[String]) -> PamResult<DeveloperApp> {
        let mut app = self.get(app_id)?;
        app.webhook_url = url.map(validate_webhook_url).transpose()?;
        app.webhook_events = parse_events(events)?;
        put_json(self.store.apps(), app_id, &app)?;
        Ok(app)
    }
}
