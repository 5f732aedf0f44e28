//! Orchestrator strategy selection. A small rule table; first match wins.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::router::{QueryComplexity, RoutingContext};

/// Turns after which a conversation needs the enhanced (memory-aware) orchestrator.
const ENHANCED_MIN_TURNS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorKind {
    /// Single completion, no tools.
    Simple,
    /// Conversation memory and tool calling.
    Enhanced,
    /// Multi-step planning loop over tools.
    Agentic,
}

impl OrchestratorKind {
    pub const NAMES: &'static [&'static str] = &["simple", "enhanced", "agentic"];

    pub fn as_str(self) -> &'static str {
        match self {
            OrchestratorKind::Simple => "simple",
            OrchestratorKind::Enhanced => "enhanced",
            OrchestratorKind::Agentic => "agentic",
        }
    }
}

impl fmt::Display for OrchestratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrchestratorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(OrchestratorKind::Simple),
            "enhanced" => Ok(OrchestratorKind::Enhanced),
            "agentic" => Ok(OrchestratorKind::Agentic),
            other => Err(format!("unknown orchestrator '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorChoice {
    pub kind: OrchestratorKind,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorSelector {
    override_kind: Option<OrchestratorKind>,
}

impl OrchestratorSelector {
    pub fn new(override_kind: Option<OrchestratorKind>) -> Self {
        Self { override_kind }
    }

    /// Unknown override strings are ignored with a warning.
    pub fn from_config(raw: Option<&str>) -> Self {
        let override_kind = raw.and_then(|s| match s.parse() {
            Ok(kind) => Some(kind),
            Err(e) => {
                tracing::warn!(target: "pam::orchestrator", error = %e, "ignoring orchestrator override");
                None
            }
        });
        Self { override_kind }
    }

    pub fn select(&self, ctx: &RoutingContext, complexity: QueryComplexity) -> OrchestratorChoice {
        if let Some(kind) = self.override_kind {
            return OrchestratorChoice { kind, reason: "configured_override" };
        }
        if complexity == QueryComplexity::Complex && ctx.has_tools {
            return OrchestratorChoice { kind: OrchestratorKind::Agentic, reason: "complex_with_tools" };
        }
        if ctx.has_tools {
            return OrchestratorChoice { kind: OrchestratorKind::Enhanced, reason: "tools_available" };
        }
        if ctx.persona_lower().is_some() {
            return OrchestratorChoice { kind: OrchestratorKind::Enhanced, reason: "persona" };
        }
        if ctx.conversation_turns > ENHANCED_MIN_TURNS {
            return OrchestratorChoice { kind: OrchestratorKind::Enhanced, reason: "conversation_history" };
        }
        OrchestratorChoice { kind: OrchestratorKind::Simple, reason: "default" }
    }
}
