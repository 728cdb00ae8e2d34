use score_relay_core::{ensure_non_empty, CoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_METRICS_ENDPOINT: &str = "metrics-collector";
pub const DEFAULT_LEDGER_ENDPOINT: &str = "ledger-writer";
pub const DEFAULT_NOTIFIER_ENDPOINT: &str = "notifier";
pub const DEFAULT_STALE_AFTER_SECONDS: u64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_FALLBACK_ORIGINATOR: &str = "unknown-originator";
pub const DEFAULT_ERROR_TRUNCATE_CHARS: usize = 150;

/// What to do with a reply whose request id is not tracked.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UnknownReplyPolicy {
    /// Synthesize a record with the fallback originator and carry on.
    #[default]
    Recover,
    /// Log and discard the reply.
    Drop,
}

impl UnknownReplyPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recover => "recover",
            Self::Drop => "drop",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "recover" => Some(Self::Recover),
            "drop" => Some(Self::Drop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub metrics_endpoint: String,
    pub ledger_endpoint: String,
    pub notifier_endpoint: String,
    pub stale_after_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub fallback_originator: String,
    pub unknown_reply_policy: UnknownReplyPolicy,
    pub error_truncate_chars: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            metrics_endpoint: DEFAULT_METRICS_ENDPOINT.to_string(),
            ledger_endpoint: DEFAULT_LEDGER_ENDPOINT.to_string(),
            notifier_endpoint: DEFAULT_NOTIFIER_ENDPOINT.to_string(),
            stale_after_seconds: DEFAULT_STALE_AFTER_SECONDS,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
            fallback_originator: DEFAULT_FALLBACK_ORIGINATOR.to_string(),
            unknown_reply_policy: UnknownReplyPolicy::Recover,
            error_truncate_chars: DEFAULT_ERROR_TRUNCATE_CHARS,
        }
    }
}

impl CoordinatorConfig {
    /// Validate endpoint names and timing bounds.
    ///
    /// # Errors
    /// Returns [`CoreError::Configuration`] when any field is out of range.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (field, value) in [
            ("metrics_endpoint", &self.metrics_endpoint),
            ("ledger_endpoint", &self.ledger_endpoint),
            ("notifier_endpoint", &self.notifier_endpoint),
            ("fallback_originator", &self.fallback_originator),
        ] {
            ensure_non_empty(field, value)
                .map_err(|err| CoreError::Configuration(err.to_string()))?;
        }

        if self.stale_after_seconds == 0 {
            return Err(CoreError::Configuration(
                "stale_after_seconds MUST be >= 1".to_string(),
            ));
        }
        if i64::try_from(self.stale_after_seconds).is_err() {
            return Err(CoreError::Configuration(
                "stale_after_seconds is out of range".to_string(),
            ));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(CoreError::Configuration(
                "sweep_interval_seconds MUST be >= 1".to_string(),
            ));
        }
        if self.error_truncate_chars == 0 {
            return Err(CoreError::Configuration(
                "error_truncate_chars MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse a config object; absent fields take their defaults.
    ///
    /// # Errors
    /// Returns [`CoreError::Configuration`] on unknown fields, wrong types, or
    /// values rejected by [`CoordinatorConfig::validate`].
    pub fn from_json(value: &Value) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|err| CoreError::Configuration(format!("invalid coordinator config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn stale_after(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.stale_after_seconds).unwrap_or(i64::MAX))
    }

    #[must_use]
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_seconds)
    }
}
