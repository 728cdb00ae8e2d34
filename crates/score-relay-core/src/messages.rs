use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{explain, ReasoningResult};
use crate::{EntityMetrics, ReputationTier};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScoreRequest {
    pub entity_id: String,
    pub request_id: String,
    pub originator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawMetrics {
    pub request_id: String,
    pub entity_id: String,
    pub metrics: EntityMetrics,
}

/// The metrics collector could not produce facts for a request.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MetricsFailure {
    pub request_id: String,
    pub entity_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerConfirmation {
    pub request_id: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    pub status: LedgerStatus,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Operator query for the coordinator's counters; answered at `reply_to`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusQuery {
    pub request_id: String,
    pub reply_to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    ScoreRequest(ScoreRequest),
    RawMetrics(RawMetrics),
    MetricsFailed(MetricsFailure),
    LedgerConfirmation(LedgerConfirmation),
    StatusQuery(StatusQuery),
}

impl InboundMessage {
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::ScoreRequest(message) => &message.request_id,
            Self::RawMetrics(message) => &message.request_id,
            Self::MetricsFailed(message) => &message.request_id,
            Self::LedgerConfirmation(message) => &message.request_id,
            Self::StatusQuery(message) => &message.request_id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ScoreRequest(_) => "score_request",
            Self::RawMetrics(_) => "raw_metrics",
            Self::MetricsFailed(_) => "metrics_failed",
            Self::LedgerConfirmation(_) => "ledger_confirmation",
            Self::StatusQuery(_) => "status_query",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MetricsRequest {
    pub request_id: String,
    pub entity_id: String,
}

/// Reasoning fields carried downstream of the rule engine.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScoreSummary {
    pub final_score: u32,
    pub reputation_level: ReputationTier,
    pub applied_rules: Vec<String>,
    pub score_adjustment: i64,
    pub narrative: String,
}

impl ScoreSummary {
    #[must_use]
    pub fn from_result(result: &ReasoningResult) -> Self {
        Self {
            final_score: result.final_score,
            reputation_level: result.reputation_level,
            applied_rules: result.applied_rules.clone(),
            score_adjustment: result.score_adjustment,
            narrative: explain(result),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerWriteRequest {
    pub request_id: String,
    pub entity_id: String,
    pub summary: ScoreSummary,
    /// SHA-256 of the full reasoning result; the audit signature.
    pub digest: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStage {
    Scored,
    Completed,
    Failed,
}

impl NotificationStage {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub request_id: String,
    pub originator: String,
    pub stage: NotificationStage,
    pub payload: Value,
}

/// Reply to a [`StatusQuery`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub request_id: String,
    pub status: String,
    pub live_requests: u64,
    pub stats: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    MetricsRequest(MetricsRequest),
    LedgerWriteRequest(LedgerWriteRequest),
    Notification(Notification),
    Status(StatusReport),
}

impl OutboundMessage {
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::MetricsRequest(message) => &message.request_id,
            Self::LedgerWriteRequest(message) => &message.request_id,
            Self::Notification(message) => &message.request_id,
            Self::Status(message) => &message.request_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_messages_decode_by_type_tag() {
        let raw = r#"{"type":"raw_metrics","request_id":"req-1","entity_id":"0xabc","metrics":{"score":700,"has_verified_identity":true}}"#;
        let message: InboundMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => panic!("expected raw_metrics to decode: {err}"),
        };

        assert_eq!(message.kind(), "raw_metrics");
        assert_eq!(message.request_id(), "req-1");
        let InboundMessage::RawMetrics(metrics) = message else {
            panic!("expected raw metrics variant");
        };
        assert_eq!(metrics.metrics.base_score(), 700);
    }

    #[test]
    fn ledger_confirmation_optional_fields_default() {
        let raw = r#"{"type":"ledger_confirmation","request_id":"req-9","status":"error"}"#;
        let message: InboundMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => panic!("expected ledger_confirmation to decode: {err}"),
        };
        let InboundMessage::LedgerConfirmation(confirmation) = message else {
            panic!("expected ledger confirmation variant");
        };
        assert_eq!(confirmation.status, LedgerStatus::Error);
        assert!(confirmation.reference.is_none());
        assert!(confirmation.error.is_none());
    }

    #[test]
    fn status_query_requires_reply_address() {
        let raw = r#"{"type":"status_query","request_id":"q-1","reply_to":"agent://ops"}"#;
        let message: InboundMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => panic!("expected status_query to decode: {err}"),
        };
        assert_eq!(message.kind(), "status_query");
        assert_eq!(message.request_id(), "q-1");

        let missing = r#"{"type":"status_query","request_id":"q-2"}"#;
        assert!(serde_json::from_str::<InboundMessage>(missing).is_err());
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let raw = r#"{"type":"cancel","request_id":"req-1"}"#;
        assert!(serde_json::from_str::<InboundMessage>(raw).is_err());
    }

    #[test]
    fn summary_serializes_tier_label() {
        let summary = ScoreSummary {
            final_score: 720,
            reputation_level: ReputationTier::VeryGood,
            applied_rules: vec!["veteran_entity".to_string()],
            score_adjustment: 30,
            narrative: String::new(),
        };
        let value = match serde_json::to_value(&summary) {
            Ok(value) => value,
            Err(err) => panic!("expected summary to encode: {err}"),
        };
        assert_eq!(value["reputation_level"], "Very Good");
    }
}
