//! Normalized live-call insight payloads.
//!
//! These are the shapes the router produces after defaulting and coercing
//! backend frames. Every type is `PartialEq` so writes can be skipped when
//! nothing changed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Customer sentiment estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    /// `positive`, `neutral`, `negative`, or whatever label the backend uses.
    pub label: String,
    /// Polarity in [-1, 1].
    pub score: f64,
    /// Model confidence in [0, 1].
    pub confidence: f64,
}

/// Call priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl PriorityLevel {
    /// Parse a level case-insensitively, falling back to `Medium`.
    #[must_use]
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            "urgent" | "critical" => Self::Urgent,
            _ => Self::Medium,
        }
    }
}

/// Call priority assessment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Priority {
    pub level: PriorityLevel,
    pub reason: Option<String>,
    pub escalate: bool,
}

/// Confidence bucket for intent detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accuracy {
    High,
    Medium,
    Low,
}

impl Accuracy {
    /// Lower bound (inclusive) of the `High` bucket.
    pub const HIGH_THRESHOLD: f64 = 0.85;
    /// Lower bound (inclusive) of the `Medium` bucket.
    pub const MEDIUM_THRESHOLD: f64 = 0.6;

    /// Bucket a confidence value.
    #[must_use]
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= Self::HIGH_THRESHOLD {
            Self::High
        } else if confidence >= Self::MEDIUM_THRESHOLD {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl fmt::Display for Accuracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        })
    }
}

/// Detected caller intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub intent: String,
    pub confidence: f64,
    pub accuracy: Accuracy,
    pub sub_intents: Vec<String>,
}

/// A next-best-action suggestion for the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: PriorityLevel,
}

/// A knowledge-base article surfaced for the current call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeArticle {
    pub id: String,
    pub title: String,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub relevance: f64,
}

/// Who said a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    #[default]
    Customer,
    Agent,
    System,
}

impl Speaker {
    /// Parse a speaker name, falling back to `Customer`.
    #[must_use]
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "agent" => Self::Agent,
            "system" | "bot" => Self::System,
            _ => Self::Customer,
        }
    }
}

/// One line of live transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub is_final: bool,
}

/// Customer profile attached to the current call.
///
/// `id` is never empty once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub tier: Option<String>,
    pub account_number: Option<String>,
}

/// Everything the backend has told us about the current call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveInsights {
    pub sentiment: Option<Sentiment>,
    pub priority: Option<Priority>,
    pub intent: Option<Intent>,
    pub actions: Vec<SuggestedAction>,
    pub knowledge: Vec<KnowledgeArticle>,
    pub transcript: Vec<TranscriptEntry>,
    pub customer: Option<CustomerProfile>,
}

impl LiveInsights {
    /// True when no per-call data has been received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Change notification broadcast by the insight store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum InsightUpdate {
    Sentiment(Sentiment),
    Priority(Priority),
    Intent(Intent),
    Actions(Vec<SuggestedAction>),
    Knowledge(Vec<KnowledgeArticle>),
    Transcript(TranscriptEntry),
    Customer(CustomerProfile),
    /// All per-call state was dropped.
    Cleared,
}
