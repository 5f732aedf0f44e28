//! Gateway configuration.
//!
//! Precedence: defaults < TOML file (`PAM_CONFIG`, default `config/pam`) < `PAM__*` env vars.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | app_name | PAM | Reported by `/api/v1/health`. |
//! | host / port | 127.0.0.1 / 8000 | Listen address. |
//! | storage_path | ./data/pam | sled database directory. |
//! | models.fast / balanced / reasoning | see below | Model strings per routing tier. |
//! | edge.enabled | true | Answer trivial voice queries without the LLM. |
//! | edge.min_confidence | 0.5 | Minimum phrase coverage for an edge answer. |
//! | edge.max_query_words | 8 | Longer queries always go to the orchestrator. |
//! | webhooks.poll_interval_secs | 5 | Delivery worker tick. |
//! | webhooks.timeout_secs | 10 | Per-delivery HTTP timeout. |
//! | sandbox.max_code_bytes | 20000 | Upper bound on generated tool source. |
//! | orchestrator_override | unset | Force `simple`, `enhanced` or `agentic`. |

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::PamResult;
use crate::validation::validate_unit_interval;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub fast: String,
    pub balanced: String,
    pub reasoning: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            fast: "claude-3-5-haiku-20241022".to_string(),
            balanced: "claude-sonnet-4-5-20250929".to_string(),
            reasoning: "claude-opus-4-1-20250805".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub enabled: bool,
    pub min_confidence: f32,
    pub max_query_words: usize,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.5,
            max_query_words: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_code_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self { max_code_bytes: 20_000 }
    }
}

/// Top-level configuration for the PAM gateway and core services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PamConfig {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub storage_path: String,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Forces one orchestrator for every request ("simple", "enhanced", "agentic").
    #[serde(default)]
    pub orchestrator_override: Option<String>,
}

impl Default for PamConfig {
    fn default() -> Self {
        Self {
            app_name: "PAM".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            storage_path: "./data/pam".to_string(),
            models: ModelConfig::default(),
            edge: EdgeConfig::default(),
            webhooks: WebhookConfig::default(),
            sandbox: SandboxConfig::default(),
            orchestrator_override: None,
        }
    }
}

impl PamConfig {
    /// Load config from file and environment.
    pub fn load() -> PamResult<Self> {
        let config_path = std::env::var("PAM_CONFIG").unwrap_or_else(|_| "config/pam".to_string());
        Self::load_from(&config_path)
    }

    /// Load with an explicit file stem/path. A missing file falls back to defaults.
    pub fn load_from(config_path: &str) -> PamResult<Self> {
        let defaults = PamConfig::default();
        let builder = config::Config::builder()
            .set_default("app_name", defaults.app_name)?
            .set_default("host", defaults.host)?
            .set_default("port", i64::from(defaults.port))?
            .set_default("storage_path", defaults.storage_path)?;

        let path = Path::new(config_path);
        let with_ext = Path::new(config_path).with_extension("toml");
        let builder = if path.is_file() {
            builder.add_source(config::File::from(path))
        } else if with_ext.is_file() {
            builder.add_source(config::File::from(with_ext.as_path()))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("PAM").separator("__"))
            .build()?;

        let config: PamConfig = built.try_deserialize()?;
        validate_unit_interval("edge.min_confidence", config.edge.min_confidence)?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
