//! Intelligent model router: an ordered rule table keyed by persona and request context.
//! The first matching rule picks the model tier; the catch-all default is always last.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::config::ModelConfig;

/// Rough cost of answering a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryComplexity {
    Simple,
    Moderate,
    Complex,
}

/// Phrases that signal multi-step planning or analysis.
const COMPLEX_MARKERS: &[&str] = &[
    "plan",
    "itinerary",
    "compare",
    "analyze",
    "analyse",
    "budget",
    "optimize",
    "optimise",
    "forecast",
    "breakdown",
    "strategy",
    "route",
    "explain why",
    "step by step",
    "pros and cons",
];

const SIMPLE_MAX_WORDS: usize = 6;
const COMPLEX_MIN_WORDS: usize = 40;

fn contains_marker(lower: &str, marker: &str) -> bool {
    if marker.contains(' ') {
        return lower.contains(marker);
    }
    lower.split(|c: char| !c.is_alphanumeric()).any(|w| {
        w.strip_prefix(marker)
            .is_some_and(|rest| MARKER_SUFFIXES.contains(&rest))
    })
}

const MARKER_SUFFIXES: &[&str] = &["", "s", "d", "ed", "es", "ing", "ned", "ning"];

impl QueryComplexity {
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let words = lower.split_whitespace().count();
        let marked = COMPLEX_MARKERS.iter().any(|m| contains_marker(&lower, m));

        if words >= COMPLEX_MIN_WORDS || (marked && words > SIMPLE_MAX_WORDS) {
            QueryComplexity::Complex
        } else if words <= SIMPLE_MAX_WORDS && !marked {
            QueryComplexity::Simple
        } else {
            QueryComplexity::Moderate
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    Balanced,
    Reasoning,
}

impl ModelTier {
    pub fn model<'a>(self, models: &'a ModelConfig) -> &'a str {
        match self {
            ModelTier::Fast => &models.fast,
            ModelTier::Balanced => &models.balanced,
            ModelTier::Reasoning => &models.reasoning,
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelTier::Fast => "fast",
            ModelTier::Balanced => "balanced",
            ModelTier::Reasoning => "reasoning",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingContext {
    pub message: String,
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default)]
    pub is_voice: bool,
    #[serde(default)]
    pub has_tools: bool,
    #[serde(default)]
    pub conversation_turns: usize,
}

impl RoutingContext {
    pub fn persona_lower(&self) -> Option<String> {
        self.persona.as_deref().map(|p| p.trim().to_lowercase()).filter(|p| !p.is_empty())
    }
}

/// One row of the rule table. Unset conditions match anything.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub name: &'static str,
    pub personas: Option<&'static [&'static str]>,
    pub voice: Option<bool>,
    pub complexity: Option<QueryComplexity>,
    pub requires_tools: bool,
    pub min_turns: usize,
    pub tier: ModelTier,
}

impl RoutingRule {
    /// Catch-all row: matches everything, balanced tier.
    pub const fn default_rule() -> Self {
        RoutingRule {
            name: "default",
            personas: None,
            voice: None,
            complexity: None,
            requires_tools: false,
            min_turns: 0,
            tier: ModelTier::Balanced,
        }
    }

    /// True when the row has no conditions at all.
    pub fn is_catch_all(&self) -> bool {
        self.personas.is_none()
            && self.voice.is_none()
            && self.complexity.is_none()
            && !self.requires_tools
            && self.min_turns == 0
    }

    pub fn matches(&self, ctx: &RoutingContext, complexity: QueryComplexity) -> bool {
        if let Some(personas) = self.personas {
            match ctx.persona_lower() {
                Some(p) if personas.contains(&p.as_str()) => {}
                _ => return false,
            }
        }
        if self.voice.is_some_and(|v| v != ctx.is_voice) {
            return false;
        }
        if self.complexity.is_some_and(|c| c != complexity) {
            return false;
        }
        if self.requires_tools && !ctx.has_tools {
            return false;
        }
        ctx.conversation_turns >= self.min_turns
    }
}

const FINANCE_PERSONAS: &[&str] = &["finance", "budget_advisor", "expense_tracker"];
const TRAVEL_PERSONAS: &[&str] = &["trip_planner", "travel", "navigator"];

/// Default rule table, most specific first.
pub fn default_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule {
            name: "voice_low_latency",
            voice: Some(true),
            complexity: Some(QueryComplexity::Simple),
            tier: ModelTier::Fast,
            ..RoutingRule::default_rule()
        },
        RoutingRule {
            name: "complex_reasoning",
            complexity: Some(QueryComplexity::Complex),
            tier: ModelTier::Reasoning,
            ..RoutingRule::default_rule()
        },
        RoutingRule {
            name: "finance_tools",
            personas: Some(FINANCE_PERSONAS),
            requires_tools: true,
            tier: ModelTier::Balanced,
            ..RoutingRule::default_rule()
        },
        RoutingRule {
            name: "travel_tools",
            personas: Some(TRAVEL_PERSONAS),
            requires_tools: true,
            tier: ModelTier::Balanced,
            ..RoutingRule::default_rule()
        },
        RoutingRule {
            name: "long_conversation",
            min_turns: 20,
            tier: ModelTier::Balanced,
            ..RoutingRule::default_rule()
        },
        RoutingRule {
            name: "simple_query",
            complexity: Some(QueryComplexity::Simple),
            tier: ModelTier::Fast,
            ..RoutingRule::default_rule()
        },
        RoutingRule::default_rule(),
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub model: String,
    pub tier: ModelTier,
    pub rule: &'static str,
    pub complexity: QueryComplexity,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingStats {
    pub total: u64,
    pub by_model: BTreeMap<String, u64>,
    pub by_rule: BTreeMap<String, u64>,
}

pub struct ModelRouter {
    rules: Vec<RoutingRule>,
    models: ModelConfig,
    by_model: DashMap<String, u64>,
    by_rule: DashMap<&'static str, u64>,
}

impl ModelRouter {
    pub fn new(models: ModelConfig) -> Self {
        Self::with_rules(models, default_rules())
    }

    /// Custom table; a catch-all default is appended unless the last row already is one.
    pub fn with_rules(models: ModelConfig, mut rules: Vec<RoutingRule>) -> Self {
        if !rules.last().is_some_and(RoutingRule::is_catch_all) {
            rules.push(RoutingRule::default_rule());
        }
        Self {
            rules,
            models,
            by_model: DashMap::new(),
            by_rule: DashMap::new(),
        }
    }

    pub fn route(&self, ctx: &RoutingContext) -> RoutingDecision {
        let complexity = QueryComplexity::classify(&ctx.message);
        let rule = self
            .rules
            .iter()
            .find(|r| r.matches(ctx, complexity))
            .cloned()
            .unwrap_or_else(RoutingRule::default_rule);

        let model = rule.tier.model(&self.models).to_string();
        *self.by_model.entry(model.clone()).or_insert(0) += 1;
        *self.by_rule.entry(rule.name).or_insert(0) += 1;

        debug!(
            target: "pam::router",
            rule = rule.name,
            tier = %rule.tier,
            model = %model,
            complexity = ?complexity,
            "Model routed"
        );

        RoutingDecision {
            model,
            tier: rule.tier,
            rule: rule.name,
            complexity,
        }
    }

    pub fn stats(&self) -> RoutingStats {
        let by_model: BTreeMap<String, u64> =
            self.by_model.iter().map(|e| (e.key().clone(), *e.value())).collect();
        let by_rule: BTreeMap<String, u64> =
            self.by_rule.iter().map(|e| (e.key().to_string(), *e.value())).collect();
        RoutingStats {
            total: by_rule.values().sum(),
            by_model,
            by_rule,
        }
    }
}
