//! Wire protocol between the agent client and the call-routing gateway.
//!
//! Outbound messages are a closed set serialized with a `type` tag.
//! Inbound frames are looser: fields may be missing, numbers may arrive as
//! strings, and several keys are spelled more than one way. Inbound parsing
//! therefore goes through lenient raw structs and is normalized into the
//! typed payloads of [`call_desk_core::insights`].

use call_desk_core::insights::{
    Accuracy, Intent, KnowledgeArticle, Priority, PriorityLevel, Sentiment, Speaker,
    SuggestedAction, TranscriptEntry,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Message from the agent client to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Keep-alive ping.
    Heartbeat,
    /// The agent picked up.
    #[serde(rename_all = "camelCase")]
    AcceptCall {
        caller_id: String,
        agent_id: String,
        caller_name: String,
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
    },
    /// The agent hung up.
    #[serde(rename_all = "camelCase")]
    EndCall {
        caller_id: String,
        agent_id: String,
        /// Call length in seconds.
        duration: u64,
        timestamp: i64,
    },
}

impl OutboundMessage {
    #[must_use]
    pub fn accept_call(
        caller_id: impl Into<String>,
        agent_id: impl Into<String>,
        caller_name: impl Into<String>,
    ) -> Self {
        Self::AcceptCall {
            caller_id: caller_id.into(),
            agent_id: agent_id.into(),
            caller_name: caller_name.into(),
            timestamp: now_ms(),
        }
    }

    #[must_use]
    pub fn end_call(caller_id: impl Into<String>, agent_id: impl Into<String>, duration: u64) -> Self {
        Self::EndCall {
            caller_id: caller_id.into(),
            agent_id: agent_id.into(),
            duration,
            timestamp: now_ms(),
        }
    }
}

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame is not a JSON object")]
    NotAnObject,
    #[error("Frame has no type discriminator")]
    MissingType,
}

/// Customer fields as received, before identity resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerFields {
    pub id: Option<String>,
    pub customer_id: Option<String>,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub tier: Option<String>,
    pub account_number: Option<String>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Sentiment(Sentiment),
    Priority(Priority),
    Intent(Intent),
    Actions(Vec<SuggestedAction>),
    Knowledge(Vec<KnowledgeArticle>),
    Transcript(TranscriptEntry),
    Customer(CustomerFields),
    HeartbeatAck,
    /// A well-formed frame with a type this client does not handle.
    Unknown(String),
}

impl InboundEvent {
    /// Decode and normalize one text frame.
    ///
    /// `now_ms` fills in missing transcript timestamps.
    ///
    /// # Errors
    /// Returns error if the frame is not a JSON object with a string `type`,
    /// or if a known payload has fields of an unusable shape.
    pub fn parse(text: &str, now_ms: i64) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        let payload = payload_of(&value, kind);

        let event = match kind {
            "sentiment" => Self::Sentiment(serde_json::from_value::<RawSentiment>(payload)?.normalize()),
            "priority" => Self::Priority(serde_json::from_value::<RawPriority>(payload)?.normalize()),
            "intent" => Self::Intent(serde_json::from_value::<RawIntent>(payload)?.normalize()),
            "actions" | "suggested_actions" => {
                Self::Actions(serde_json::from_value::<RawActions>(payload)?.normalize())
            }
            "knowledge" | "knowledge_articles" | "knowledge_update" => {
                Self::Knowledge(serde_json::from_value::<RawKnowledge>(payload)?.normalize())
            }
            "transcript" => {
                Self::Transcript(serde_json::from_value::<RawTranscript>(payload)?.normalize(now_ms))
            }
            "customer" | "customer_info" => {
                Self::Customer(serde_json::from_value::<RawCustomer>(payload)?.normalize())
            }
            "heartbeat_ack" | "pong" => Self::HeartbeatAck,
            other => Self::Unknown(other.to_string()),
        };
        Ok(event)
    }

    /// Short name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Sentiment(_) => "sentiment",
            Self::Priority(_) => "priority",
            Self::Intent(_) => "intent",
            Self::Actions(_) => "actions",
            Self::Knowledge(_) => "knowledge",
            Self::Transcript(_) => "transcript",
            Self::Customer(_) => "customer",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Payloads come either flat on the frame or nested under `data`,
/// `payload`, or a key named after the type.
fn payload_of(frame: &Value, kind: &str) -> Value {
    ["data", "payload", kind]
        .iter()
        .filter_map(|key| frame.get(*key))
        .find(|v| v.is_object())
        .unwrap_or(frame)
        .clone()
}

/// Map confidences to [0, 1]; values in (1, 100] are read as percentages.
fn unit_interval(v: f64) -> f64 {
    let v = if v > 1.0 && v <= 100.0 { v / 100.0 } else { v };
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

// ---- lenient field deserializers ----

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(Option::<Value>::deserialize(d)?.and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Ok(Option::<Value>::deserialize(d)?.and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    Ok(Option::<Value>::deserialize(d)?.and_then(|v| match v {
        Value::Bool(b) => Some(b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }))
}

/// Strings, with numbers accepted and blanks treated as absent.
fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Value>::deserialize(d)?
        .and_then(|v| match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty()))
}

// ---- raw payloads ----

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawSentiment {
    #[serde(alias = "label", alias = "overall", deserialize_with = "lenient_string")]
    sentiment: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    score: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    confidence: Option<f64>,
}

impl RawSentiment {
    fn normalize(self) -> Sentiment {
        Sentiment {
            label: self
                .sentiment
                .map_or_else(|| "neutral".to_string(), |s| s.to_ascii_lowercase()),
            score: self.score.filter(|s| !s.is_nan()).unwrap_or(0.0).clamp(-1.0, 1.0),
            confidence: self.confidence.map_or(0.5, unit_interval),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawPriority {
    #[serde(alias = "priority", deserialize_with = "lenient_string")]
    level: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    reason: Option<String>,
    #[serde(
        alias = "escalationRequired",
        alias = "escalation_required",
        deserialize_with = "lenient_bool"
    )]
    escalate: Option<bool>,
}

impl RawPriority {
    fn normalize(self) -> Priority {
        let level = self
            .level
            .as_deref()
            .map_or(PriorityLevel::default(), PriorityLevel::parse_lenient);
        Priority {
            level,
            reason: self.reason,
            escalate: self.escalate.unwrap_or(false),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawIntent {
    #[serde(alias = "primaryIntent", alias = "primary_intent", deserialize_with = "lenient_string")]
    intent: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    confidence: Option<f64>,
    #[serde(alias = "sub_intents")]
    sub_intents: Vec<String>,
}

impl RawIntent {
    fn normalize(self) -> Intent {
        let confidence = self.confidence.map_or(0.0, unit_interval);
        Intent {
            intent: self.intent.unwrap_or_else(|| "unknown".to_string()),
            confidence,
            accuracy: Accuracy::from_confidence(confidence),
            sub_intents: self.sub_intents,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawAction {
    #[serde(deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(alias = "label", alias = "action", deserialize_with = "lenient_string")]
    title: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    description: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    priority: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawActions {
    #[serde(alias = "suggestions", alias = "suggested_actions")]
    actions: Vec<RawAction>,
}

impl RawActions {
    fn normalize(self) -> Vec<SuggestedAction> {
        self.actions
            .into_iter()
            .enumerate()
            .map(|(i, a)| SuggestedAction {
                id: a.id.unwrap_or_else(|| format!("action-{}", i + 1)),
                title: a
                    .title
                    .or_else(|| a.description.clone())
                    .unwrap_or_else(|| "Action".to_string()),
                description: a.description,
                priority: a
                    .priority
                    .as_deref()
                    .map_or(PriorityLevel::default(), PriorityLevel::parse_lenient),
            })
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawArticle {
    #[serde(deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    title: Option<String>,
    #[serde(alias = "snippet", alias = "content", deserialize_with = "lenient_string")]
    summary: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    url: Option<String>,
    #[serde(alias = "score", alias = "relevanceScore", deserialize_with = "lenient_f64")]
    relevance: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawKnowledge {
    #[serde(alias = "knowledgeArticles", alias = "knowledge_articles")]
    articles: Vec<RawArticle>,
}

impl RawKnowledge {
    fn normalize(self) -> Vec<KnowledgeArticle> {
        self.articles
            .into_iter()
            .enumerate()
            .map(|(i, a)| KnowledgeArticle {
                id: a.id.unwrap_or_else(|| format!("article-{}", i + 1)),
                title: a.title.unwrap_or_else(|| "Untitled".to_string()),
                summary: a.summary,
                url: a.url,
                relevance: a.relevance.map_or(0.0, unit_interval),
            })
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawTranscript {
    #[serde(alias = "role", deserialize_with = "lenient_string")]
    speaker: Option<String>,
    #[serde(alias = "content", alias = "transcript", deserialize_with = "lenient_string")]
    text: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    timestamp: Option<i64>,
    #[serde(alias = "is_final", alias = "final", deserialize_with = "lenient_bool")]
    is_final: Option<bool>,
}

impl RawTranscript {
    fn normalize(self, now_ms: i64) -> TranscriptEntry {
        TranscriptEntry {
            speaker: self
                .speaker
                .as_deref()
                .map_or(Speaker::default(), Speaker::parse_lenient),
            text: self.text.unwrap_or_default(),
            timestamp: self.timestamp.unwrap_or(now_ms),
            is_final: self.is_final.unwrap_or(true),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawCustomer {
    #[serde(deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(alias = "customer_id", deserialize_with = "lenient_string")]
    customer_id: Option<String>,
    #[serde(alias = "customerName", alias = "customer_name", deserialize_with = "lenient_string")]
    name: Option<String>,
    #[serde(alias = "phoneNumber", alias = "phone_number", deserialize_with = "lenient_string")]
    phone: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    email: Option<String>,
    #[serde(alias = "loyaltyTier", alias = "loyalty_tier", deserialize_with = "lenient_string")]
    tier: Option<String>,
    #[serde(alias = "account_number", deserialize_with = "lenient_string")]
    account_number: Option<String>,
}

impl RawCustomer {
    fn normalize(self) -> CustomerFields {
        CustomerFields {
            id: self.id,
            customer_id: self.customer_id,
            name: self.name.unwrap_or_else(|| "Unknown Caller".to_string()),
            phone: self.phone,
            email: self.email,
            tier: self.tier,
            account_number: self.account_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn parse(text: &str) -> InboundEvent {
        InboundEvent::parse(text, NOW).unwrap()
    }

    #[test]
    fn test_outbound_wire_shape() {
        let msg = OutboundMessage::EndCall {
            caller_id: "c-1".to_string(),
            agent_id: "a-1".to_string(),
            duration: 93,
            timestamp: NOW,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "end_call");
        assert_eq!(json["callerId"], "c-1");
        assert_eq!(json["agentId"], "a-1");
        assert_eq!(json["duration"], 93);

        let heartbeat = serde_json::to_string(&OutboundMessage::Heartbeat).unwrap();
        assert_eq!(heartbeat, r#"{"type":"heartbeat"}"#);

        let accept = serde_json::to_value(OutboundMessage::accept_call("c-1", "a-1", "Jane")).unwrap();
        assert_eq!(accept["type"], "accept_call");
        assert_eq!(accept["callerName"], "Jane");
    }

    #[test]
    fn test_sentiment_defaults() {
        let InboundEvent::Sentiment(s) = parse(r#"{"type":"sentiment"}"#) else {
            panic!("Wrong event type");
        };
        assert_eq!(s.label, "neutral");
        assert!((s.confidence - 0.5).abs() < f64::EPSILON);
        assert!(s.score.abs() < f64::EPSILON);
    }

    #[test]
    fn test_sentiment_coerces_strings_and_clamps() {
        let InboundEvent::Sentiment(s) =
            parse(r#"{"type":"sentiment","data":{"sentiment":"Negative","score":"-3","confidence":"87"}}"#)
        else {
            panic!("Wrong event type");
        };
        assert_eq!(s.label, "negative");
        assert!((s.score + 1.0).abs() < f64::EPSILON);
        assert!((s.confidence - 0.87).abs() < 1e-9);
    }

    #[test]
    fn test_intent_accuracy_bucket() {
        let cases = [("0.9", Accuracy::High), ("0.7", Accuracy::Medium), ("0.2", Accuracy::Low)];
        for (confidence, expected) in cases {
            let frame = format!(r#"{{"type":"intent","intent":"billing","confidence":{confidence}}}"#);
            let InboundEvent::Intent(intent) = parse(&frame) else {
                panic!("Wrong event type");
            };
            assert_eq!(intent.accuracy, expected);
            assert_eq!(intent.intent, "billing");
        }

        let InboundEvent::Intent(intent) = parse(r#"{"type":"intent"}"#) else {
            panic!("Wrong event type");
        };
        assert_eq!(intent.intent, "unknown");
        assert_eq!(intent.accuracy, Accuracy::Low);
    }

    #[test]
    fn test_knowledge_accepts_both_keys() {
        let a = parse(r#"{"type":"knowledge","articles":[{"title":"Refunds","relevance":0.8}]}"#);
        let b = parse(
            r#"{"type":"knowledge_update","knowledgeArticles":[{"title":"Refunds","relevance":0.8}]}"#,
        );
        assert_eq!(a, b);

        let InboundEvent::Knowledge(articles) = a else {
            panic!("Wrong event type");
        };
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].id, "article-1");
    }

    #[test]
    fn test_actions_fill_ids_and_titles() {
        let InboundEvent::Actions(actions) = parse(
            r#"{"type":"actions","actions":[{"description":"Offer a refund","priority":"high"},{"id":7,"label":"Escalate"}]}"#,
        ) else {
            panic!("Wrong event type");
        };
        assert_eq!(actions[0].id, "action-1");
        assert_eq!(actions[0].title, "Offer a refund");
        assert_eq!(actions[0].priority, PriorityLevel::High);
        assert_eq!(actions[1].id, "7");
        assert_eq!(actions[1].title, "Escalate");
    }

    #[test]
    fn test_transcript_defaults() {
        let InboundEvent::Transcript(line) = parse(r#"{"type":"transcript","text":"hello"}"#) else {
            panic!("Wrong event type");
        };
        assert_eq!(line.speaker, Speaker::Customer);
        assert_eq!(line.timestamp, NOW);
        assert!(line.is_final);
    }

    #[test]
    fn test_customer_nested_payload() {
        let InboundEvent::Customer(fields) =
            parse(r#"{"type":"customer","customer":{"customerId":"C-9","name":"Jane Doe"}}"#)
        else {
            panic!("Wrong event type");
        };
        assert_eq!(fields.id, None);
        assert_eq!(fields.customer_id.as_deref(), Some("C-9"));
        assert_eq!(fields.name, "Jane Doe");
    }

    #[test]
    fn test_unknown_and_malformed_frames() {
        assert_eq!(parse(r#"{"type":"weather"}"#), InboundEvent::Unknown("weather".to_string()));
        assert_eq!(parse(r#"{"type":"heartbeat_ack"}"#), InboundEvent::HeartbeatAck);
        assert!(matches!(InboundEvent::parse("{not json", NOW), Err(ProtocolError::Json(_))));
        assert!(matches!(InboundEvent::parse("[1,2]", NOW), Err(ProtocolError::NotAnObject)));
        assert!(matches!(InboundEvent::parse(r#"{"kind":"x"}"#, NOW), Err(ProtocolError::MissingType)));
    }
}
