//! Edge processing for voice: answer trivial queries (greetings, time, date...) without an
//! LLM round trip. Anything that is not a confident, short phrase match is forwarded.

use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::config::EdgeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeCategory {
    Greeting,
    Time,
    Date,
    Thanks,
    Farewell,
    Help,
}

impl EdgeCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeCategory::Greeting => "greeting",
            EdgeCategory::Time => "time",
            EdgeCategory::Date => "date",
            EdgeCategory::Thanks => "thanks",
            EdgeCategory::Farewell => "farewell",
            EdgeCategory::Help => "help",
        }
    }
}

struct EdgePattern {
    category: EdgeCategory,
    /// Already normalized (lowercase, no punctuation).
    phrases: &'static [&'static str],
}

const PATTERNS: &[EdgePattern] = &[
    EdgePattern {
        category: EdgeCategory::Time,
        phrases: &["what time is it", "whats the time", "what is the time", "current time", "time is it"],
    },
    EdgePattern {
        category: EdgeCategory::Date,
        phrases: &[
            "what day is it",
            "whats the date",
            "what is the date",
            "todays date",
            "what is today",
            "whats today",
        ],
    },
    EdgePattern {
        category: EdgeCategory::Greeting,
        phrases: &[
            "hello",
            "hi",
            "hey",
            "hello pam",
            "hi pam",
            "hey pam",
            "good morning",
            "good afternoon",
            "good evening",
        ],
    },
    EdgePattern {
        category: EdgeCategory::Thanks,
        phrases: &["thanks", "thank you", "thanks pam", "thank you pam", "cheers", "much appreciated"],
    },
    EdgePattern {
        category: EdgeCategory::Farewell,
        phrases: &["bye", "goodbye", "bye pam", "see you", "see you later", "good night"],
    },
    EdgePattern {
        category: EdgeCategory::Help,
        phrases: &["help", "what can you do", "how do you work", "what do you do"],
    },
];

#[derive(Debug, Clone, Serialize)]
pub struct EdgeResult {
    pub handled: bool,
    pub category: Option<EdgeCategory>,
    pub response: Option<String>,
    pub confidence: f32,
    pub normalized: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EdgeStats {
    pub total: u64,
    pub handled: u64,
    pub forwarded: u64,
    pub by_category: BTreeMap<String, u64>,
}

/// Lowercase, drop apostrophes, turn other punctuation into spaces, collapse whitespace.
pub fn normalize(query: &str) -> String {
    let cleaned: String = query
        .chars()
        .filter(|c| *c != '\'' && *c != '’')
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .flat_map(char::to_lowercase)
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// True when `phrase` occurs in `words` as a contiguous run.
fn contains_phrase(words: &[&str], phrase: &[&str]) -> bool {
    !phrase.is_empty() && words.windows(phrase.len()).any(|w| w == phrase)
}

/// Best (category, confidence) for normalized `words`; earlier categories win ties.
fn best_match(words: &[&str]) -> Option<(EdgeCategory, f32)> {
    if words.is_empty() {
        return None;
    }
    let mut best: Option<(EdgeCategory, f32)> = None;
    for pattern in PATTERNS {
        for phrase in pattern.phrases {
            let phrase_words: Vec<&str> = phrase.split(' ').collect();
            if !contains_phrase(words, &phrase_words) {
                continue;
            }
            let confidence = (phrase_words.len() as f32 / words.len() as f32).min(1.0);
            if best.map(|(_, c)| confidence > c).unwrap_or(true) {
                best = Some((pattern.category, confidence));
            }
        }
    }
    best
}

fn respond(category: EdgeCategory, now: DateTime<FixedOffset>) -> String {
    match category {
        EdgeCategory::Time => format!("It's {}.", now.format("%-I:%M %p")),
        EdgeCategory::Date => format!("Today is {}.", now.format("%A, %B %-d, %Y")),
        EdgeCategory::Greeting => {
            let part = match now.hour() {
                5..=11 => "Good morning",
                12..=16 => "Good afternoon",
                _ => "Good evening",
            };
            format!("{}! Where are we headed today?", part)
        }
        EdgeCategory::Thanks => "You're welcome! Anything else for the trip?".to_string(),
        EdgeCategory::Farewell => "Safe travels! Talk soon.".to_string(),
        EdgeCategory::Help => {
            "I can plan trips, track expenses and fuel, check the weather along your route, and keep an eye on vehicle maintenance. Just ask.".to_string()
        }
    }
}

pub struct EdgeProcessor {
    config: EdgeConfig,
    total: AtomicU64,
    handled: AtomicU64,
    by_category: DashMap<EdgeCategory, u64>,
}

impl EdgeProcessor {
    pub fn new(config: EdgeConfig) -> Self {
        Self {
            config,
            total: AtomicU64::new(0),
            handled: AtomicU64::new(0),
            by_category: DashMap::new(),
        }
    }

    /// Process with the current time shifted by the caller's UTC offset (minutes).
    pub fn process(&self, query: &str, utc_offset_minutes: Option<i32>) -> EdgeResult {
        let offset = utc_offset_minutes
            .and_then(|m| FixedOffset::east_opt(m.saturating_mul(60)))
            .unwrap_or_else(|| Utc.fix());
        self.process_at(query, Utc::now().with_timezone(&offset))
    }

    pub fn process_at(&self, query: &str, now: DateTime<FixedOffset>) -> EdgeResult {
        self.total.fetch_add(1, Ordering::Relaxed);
        let normalized = normalize(query);
        let words: Vec<&str> = normalized.split(' ').filter(|w| !w.is_empty()).collect();

        let matched = if self.config.enabled && words.len() <= self.config.max_query_words {
            best_match(&words)
        } else {
            None
        };

        let result = match matched {
            Some((category, confidence)) if confidence >= self.config.min_confidence => {
                self.handled.fetch_add(1, Ordering::Relaxed);
                *self.by_category.entry(category).or_insert(0) += 1;
                EdgeResult {
                    handled: true,
                    category: Some(category),
                    response: Some(respond(category, now)),
                    confidence,
                    normalized,
                }
            }
            other => EdgeResult {
                handled: false,
                category: other.map(|(c, _)| c),
                response: None,
                confidence: other.map(|(_, c)| c).unwrap_or(0.0),
                normalized,
            },
        };

        debug!(
            target: "pam::edge",
            handled = result.handled,
            category = ?result.category,
            confidence = result.confidence,
            "Edge query processed"
        );
        result
    }

    pub fn stats(&self) -> EdgeStats {
        let total = self.total.load(Ordering::Relaxed);
        let handled = self.handled.load(Ordering::Relaxed);
        EdgeStats {
            total,
            handled,
            forwarded: total.saturating_sub(handled),
            by_category: self
                .by_category
                .iter()
                .map(|e| (e.key().as_str().to_string(), *e.value()))
                .collect(),
        }
    }
}
