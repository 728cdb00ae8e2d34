#![forbid(unsafe_code)]

//! Domain model and rule engine for the score relay.
//!
//! - [`EntityMetrics`] is the flat fact set a metrics collector reports.
//! - [`rules`] defines typed conditions/effects and the default rule set.
//! - [`engine`] turns metrics into a [`engine::ReasoningResult`].
//! - [`messages`] holds the wire schemas exchanged with collaborators.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

pub mod engine;
pub mod messages;
pub mod rules;

pub use engine::{digest, evaluate, explain, AppliedRule, NarrativeTag, ReasoningResult, ScoreAdjustment};
pub use messages::{
    InboundMessage, LedgerConfirmation, LedgerStatus, LedgerWriteRequest, MetricsFailure,
    MetricsRequest, Notification, NotificationStage, OutboundMessage, RawMetrics, ScoreRequest,
    ScoreSummary, StatusQuery, StatusReport,
};
pub use rules::{
    default_rules, load_rules_json, Comparator, Condition, ConditionError, Effect, Rule,
    RuleDefinition,
};

/// Lowest reachable final score.
pub const MIN_SCORE: i64 = 0;
/// Highest reachable final score.
pub const MAX_SCORE: i64 = 1000;
/// Fact that carries the base score reported by the metrics collector.
pub const BASE_SCORE_FACT: &str = "score";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// A single observed fact. Booleans compare as `1.0`/`0.0`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FactValue {
    Flag(bool),
    Number(f64),
}

impl FactValue {
    #[must_use]
    pub fn as_number(self) -> f64 {
        match self {
            Self::Flag(true) => 1.0,
            Self::Flag(false) => 0.0,
            Self::Number(value) => value,
        }
    }
}

impl From<bool> for FactValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<f64> for FactValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for FactValue {
    #[allow(clippy::cast_precision_loss)]
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i32> for FactValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl std::fmt::Display for FactValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flag(value) => write!(f, "{value}"),
            Self::Number(value) => write!(f, "{value}"),
        }
    }
}

/// Named facts describing one scored entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct EntityMetrics {
    facts: BTreeMap<String, FactValue>,
}

impl EntityMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FactValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FactValue>) {
        self.facts.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<FactValue> {
        self.facts.get(name).copied()
    }

    /// Numeric view of a fact; a missing fact reads as `0.0`.
    #[must_use]
    pub fn numeric(&self, name: &str) -> f64 {
        self.get(name).map_or(0.0, FactValue::as_number)
    }

    /// Base score rounded to the nearest integer. Missing or non-finite reads as 0.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn base_score(&self) -> i64 {
        let raw = self.numeric(BASE_SCORE_FACT);
        if raw.is_finite() {
            raw.round() as i64
        } else {
            0
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FactValue)> {
        self.facts.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Decodes a metrics object of numbers and booleans.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the payload is not a flat object
    /// of numeric or boolean facts.
    pub fn from_json(value: &Value) -> Result<Self, CoreError> {
        serde_json::from_value(value.clone()).map_err(|err| {
            CoreError::Validation(format!(
                "metrics MUST be a flat object of numbers/booleans: {err}"
            ))
        })
    }
}

/// Discrete label derived from the clamped final score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ReputationTier {
    Exceptional,
    Excellent,
    #[serde(rename = "Very Good")]
    VeryGood,
    Good,
    Moderate,
    Developing,
}

impl ReputationTier {
    #[must_use]
    pub fn from_score(final_score: u32) -> Self {
        match final_score {
            900.. => Self::Exceptional,
            800..=899 => Self::Excellent,
            700..=799 => Self::VeryGood,
            600..=699 => Self::Good,
            400..=599 => Self::Moderate,
            _ => Self::Developing,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exceptional => "Exceptional",
            Self::Excellent => "Excellent",
            Self::VeryGood => "Very Good",
            Self::Good => "Good",
            Self::Moderate => "Moderate",
            Self::Developing => "Developing",
        }
    }
}

impl std::fmt::Display for ReputationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a tracked scoring request.
///
/// `RECEIVED -> ANALYZING -> SCORED -> LEDGER_PENDING -> COMPLETED`, with
/// `FAILED` reachable from `ANALYZING`, `SCORED` and `LEDGER_PENDING`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Received,
    Analyzing,
    Scored,
    LedgerPending,
    Completed,
    Failed,
}

impl RequestState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Analyzing => "ANALYZING",
            Self::Scored => "SCORED",
            Self::LedgerPending => "LEDGER_PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RECEIVED" => Some(Self::Received),
            "ANALYZING" => Some(Self::Analyzing),
            "SCORED" => Some(Self::Scored),
            "LEDGER_PENDING" => Some(Self::LedgerPending),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` is a legal single step from `self`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::Analyzing)
                | (Self::Analyzing, Self::Scored | Self::Failed)
                | (Self::Scored, Self::LedgerPending | Self::Failed)
                | (Self::LedgerPending, Self::Completed | Self::Failed)
        )
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`CoreError::Validation`] when the value is empty or whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

/// Truncates to at most `max_chars` characters, respecting char boundaries.
#[must_use]
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_index, _)) => value[..byte_index].to_string(),
        None => value.to_string(),
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`CoreError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CoreError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CoreError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CoreError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CoreError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CoreError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| CoreError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_bands_follow_fixed_thresholds() {
        assert_eq!(ReputationTier::from_score(1000), ReputationTier::Exceptional);
        assert_eq!(ReputationTier::from_score(900), ReputationTier::Exceptional);
        assert_eq!(ReputationTier::from_score(899), ReputationTier::Excellent);
        assert_eq!(ReputationTier::from_score(700), ReputationTier::VeryGood);
        assert_eq!(ReputationTier::from_score(600), ReputationTier::Good);
        assert_eq!(ReputationTier::from_score(400), ReputationTier::Moderate);
        assert_eq!(ReputationTier::from_score(399), ReputationTier::Developing);
        assert_eq!(ReputationTier::from_score(0), ReputationTier::Developing);
    }

    #[test]
    fn lifecycle_only_moves_forward_one_step() {
        use RequestState::{Analyzing, Completed, Failed, LedgerPending, Received, Scored};

        assert!(Received.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Scored));
        assert!(Scored.can_transition_to(LedgerPending));
        assert!(LedgerPending.can_transition_to(Completed));
        for from in [Analyzing, Scored, LedgerPending] {
            assert!(from.can_transition_to(Failed));
        }

        assert!(!Received.can_transition_to(Scored));
        assert!(!Received.can_transition_to(Failed));
        assert!(!Scored.can_transition_to(Analyzing));
        assert!(!Analyzing.can_transition_to(Completed));
        for terminal in [Completed, Failed] {
            for next in [Received, Analyzing, Scored, LedgerPending, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn state_names_round_trip_through_parse() {
        for state in [
            RequestState::Received,
            RequestState::Analyzing,
            RequestState::Scored,
            RequestState::LedgerPending,
            RequestState::Completed,
            RequestState::Failed,
        ] {
            assert_eq!(RequestState::parse(state.as_str()), Some(state));
        }
        assert_eq!(RequestState::parse("scored"), None);
    }

    #[test]
    fn metrics_decode_numbers_and_flags() {
        let value = serde_json::json!({
            "score": 712.6,
            "transaction_count": 42,
            "has_verified_identity": true
        });
        let metrics = match EntityMetrics::from_json(&value) {
            Ok(metrics) => metrics,
            Err(err) => panic!("expected metrics to decode: {err}"),
        };

        assert_eq!(metrics.base_score(), 713);
        assert!((metrics.numeric("transaction_count") - 42.0).abs() < f64::EPSILON);
        assert_eq!(metrics.get("has_verified_identity"), Some(FactValue::Flag(true)));
        assert!(metrics.numeric("missing_fact").abs() < f64::EPSILON);
    }

    #[test]
    fn metrics_reject_nested_values() {
        let value = serde_json::json!({"score": {"nested": 1}});
        assert!(matches!(
            EntityMetrics::from_json(&value),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("short", 150), "short");
        assert_eq!(truncate_chars("", 3), "");
    }
}
