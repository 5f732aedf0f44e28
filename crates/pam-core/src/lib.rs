//! PAM core library.
//! Developer apps and API keys, rate limits, usage, the webhook delivery queue, model
//! routing, edge answers for voice, and static validation of generated tool code.

pub mod config;
pub mod developer;
pub mod edge;
pub mod error;
pub mod orchestrator;
pub mod router;
pub mod sandbox;
pub mod store;
pub mod validation;
pub mod webhooks;

pub use config::{EdgeConfig, ModelConfig, PamConfig, SandboxConfig, WebhookConfig};
pub use developer::{
    AppInfo, AppRegistry, DeveloperApp, RateLimitStatus, RateLimitTier, RateLimiter, RegisterAppRequest,
    RegisteredApp, UsageSummary, UsageTracker,
};
pub use edge::{EdgeCategory, EdgeProcessor, EdgeResult, EdgeStats};
pub use error::{PamError, PamResult};
pub use orchestrator::{OrchestratorChoice, OrchestratorKind, OrchestratorSelector};
pub use router::{ModelRouter, ModelTier, QueryComplexity, RoutingContext, RoutingDecision, RoutingStats};
pub use sandbox::{SandboxReport, SandboxValidator, Violation, ViolationKind};
pub use store::PamStore;
pub use webhooks::{
    DeliveryStatus, HttpTransport, WebhookDelivery, WebhookEvent, WebhookQueue, WebhookTarget, WebhookTransport,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
