#![forbid(unsafe_code)]

//! Drives scoring requests through metrics collection, rule evaluation and the
//! ledger write.
//!
//! Every handler runs to completion against the [`Tracker`]; nothing waits on
//! a collaborator. The next step is triggered by the next inbound message for
//! the same request id.

use std::collections::BTreeMap;

use score_relay_core::{
    digest, evaluate, truncate_chars, InboundMessage, LedgerConfirmation, LedgerStatus,
    LedgerWriteRequest, MetricsFailure, MetricsRequest, Notification, NotificationStage,
    OutboundMessage, RawMetrics, RequestState, Rule, ScoreRequest, ScoreSummary, StatusQuery,
    StatusReport,
};
use score_relay_tracker::{
    RecordStore, RecoveredRequest, RequestRecord, StagePayload, Tracker, TrackerError,
};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

mod config;
mod dispatch;

pub use config::{
    CoordinatorConfig, UnknownReplyPolicy, DEFAULT_ERROR_TRUNCATE_CHARS,
    DEFAULT_FALLBACK_ORIGINATOR, DEFAULT_LEDGER_ENDPOINT, DEFAULT_METRICS_ENDPOINT,
    DEFAULT_NOTIFIER_ENDPOINT, DEFAULT_STALE_AFTER_SECONDS, DEFAULT_SWEEP_INTERVAL_SECONDS,
};
pub use dispatch::{Dispatch, Dispatcher, JsonLinesDispatcher, RecordingDispatcher};

/// Entity id used when a recovered ledger reply does not name one.
pub const UNKNOWN_ENTITY: &str = "unknown-entity";

#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct CoordinatorStats {
    pub requests_received: u64,
    pub duplicates_rejected: u64,
    pub scored: u64,
    pub completed: u64,
    pub failed: u64,
    pub recovered: u64,
    pub dropped: u64,
    pub discarded: u64,
    pub stale_evictions: u64,
    pub dispatch_failures: u64,
    pub status_queries: u64,
}

/// What a handler did with one inbound message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Disposition {
    /// The request moved forward and now rests in this state.
    Advanced(RequestState),
    /// A record was synthesized for an untracked id; it now rests in this state.
    Recovered(RequestState),
    /// A score request reused a live id.
    Rejected,
    /// Reply for an untracked id, dropped by policy.
    Dropped,
    /// Duplicate or out-of-order reply; no state changed.
    Discarded,
    /// A status query was answered.
    Reported,
}

pub struct Coordinator<S: RecordStore, D: Dispatcher> {
    config: CoordinatorConfig,
    rules: Vec<Rule>,
    tracker: Tracker<S>,
    dispatcher: D,
    stats: CoordinatorStats,
    /// Ids that already received a terminal notification, with the time it was sent.
    finalized: BTreeMap<String, OffsetDateTime>,
    last_sweep: Option<OffsetDateTime>,
}

impl<S: RecordStore, D: Dispatcher> Coordinator<S, D> {
    /// # Errors
    /// Returns [`score_relay_core::CoreError::Configuration`] when `config` is invalid.
    pub fn new(
        config: CoordinatorConfig,
        rules: Vec<Rule>,
        tracker: Tracker<S>,
        dispatcher: D,
    ) -> Result<Self, score_relay_core::CoreError> {
        config.validate()?;
        Ok(Self {
            config,
            rules,
            tracker,
            dispatcher,
            stats: CoordinatorStats::default(),
            finalized: BTreeMap::new(),
            last_sweep: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    #[must_use]
    pub fn tracker(&self) -> &Tracker<S> {
        &self.tracker
    }

    #[must_use]
    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    /// Whether a terminal notification was already sent for `request_id`.
    #[must_use]
    pub fn is_finalized(&self, request_id: &str) -> bool {
        self.finalized.contains_key(request_id)
    }

    /// Process one inbound message to completion.
    ///
    /// Duplicates and out-of-order replies are discarded with a log entry.
    ///
    /// # Errors
    /// Returns [`TrackerError::Store`] when the record store fails.
    pub fn handle(
        &mut self,
        message: InboundMessage,
        now: OffsetDateTime,
    ) -> Result<Disposition, TrackerError> {
        debug!(request_id = message.request_id(), kind = message.kind(), "inbound message");
        match message {
            InboundMessage::ScoreRequest(request) => self.on_score_request(request, now),
            InboundMessage::RawMetrics(raw) => self.on_raw_metrics(raw, now),
            InboundMessage::MetricsFailed(failure) => self.on_metrics_failed(failure, now),
            InboundMessage::LedgerConfirmation(confirmation) => {
                self.on_ledger_confirmation(confirmation, now)
            }
            InboundMessage::StatusQuery(query) => self.on_status_query(query),
        }
    }

    fn on_status_query(&mut self, query: StatusQuery) -> Result<Disposition, TrackerError> {
        self.stats.status_queries += 1;
        let live_requests = u64::try_from(self.tracker.list()?.len()).unwrap_or(u64::MAX);
        info!(
            request_id = %query.request_id,
            reply_to = %query.reply_to,
            live_requests,
            "status query answered"
        );

        let report = OutboundMessage::Status(StatusReport {
            request_id: query.request_id,
            status: "active".to_string(),
            live_requests,
            stats: json!(self.stats),
        });
        // Best effort, like notifications.
        let _ = self.send(&query.reply_to, report);
        Ok(Disposition::Reported)
    }

    fn on_score_request(
        &mut self,
        request: ScoreRequest,
        now: OffsetDateTime,
    ) -> Result<Disposition, TrackerError> {
        self.stats.requests_received += 1;

        match self
            .tracker
            .create(&request.request_id, &request.entity_id, &request.originator, now)
        {
            Ok(_) => {}
            Err(TrackerError::DuplicateRequest(request_id)) => {
                warn!(request_id = %request_id, "duplicate request rejected");
                self.stats.duplicates_rejected += 1;
                return Ok(Disposition::Rejected);
            }
            Err(err) => return Err(err),
        }
        // The id is live again; replies for it must correlate to the new record.
        self.finalized.remove(&request.request_id);
        info!(request_id = %request.request_id, entity_id = %request.entity_id, "score request received");

        self.tracker.transition(
            &request.request_id,
            RequestState::Analyzing,
            StagePayload::Empty,
            now,
        )?;

        let outbound = OutboundMessage::MetricsRequest(MetricsRequest {
            request_id: request.request_id.clone(),
            entity_id: request.entity_id,
        });
        let endpoint = self.config.metrics_endpoint.clone();
        if let Err(reason) = self.send(&endpoint, outbound) {
            return self.fail(&request.request_id, reason, now);
        }

        Ok(Disposition::Advanced(RequestState::Analyzing))
    }

    fn on_raw_metrics(
        &mut self,
        raw: RawMetrics,
        now: OffsetDateTime,
    ) -> Result<Disposition, TrackerError> {
        if self.discard_if_finalized(&raw.request_id, "raw_metrics") {
            return Ok(Disposition::Discarded);
        }

        let result = evaluate(&raw.metrics, &self.rules);
        let payload = StagePayload::scored(raw.metrics, result);

        let recovered = match self.tracker.get(&raw.request_id)? {
            Some(_) => {
                if self
                    .advance(&raw.request_id, RequestState::Scored, payload, now)?
                    .is_none()
                {
                    return Ok(Disposition::Discarded);
                }
                false
            }
            None => {
                let seed = RecoveredRequest {
                    request_id: raw.request_id.clone(),
                    entity_id: raw.entity_id,
                    originator: self.config.fallback_originator.clone(),
                    state: RequestState::Scored,
                    payload,
                };
                if !self.recover(seed, now)? {
                    return Ok(Disposition::Dropped);
                }
                true
            }
        };
        self.stats.scored += 1;

        let state = self.forward_to_ledger(&raw.request_id, now)?;
        Ok(if recovered {
            Disposition::Recovered(state)
        } else {
            Disposition::Advanced(state)
        })
    }

    /// Dispatch the ledger write for a freshly scored record and send the interim
    /// notification. Returns the state the record rests in afterwards.
    fn forward_to_ledger(
        &mut self,
        request_id: &str,
        now: OffsetDateTime,
    ) -> Result<RequestState, TrackerError> {
        let Some(record) = self.tracker.get(request_id)? else {
            return Err(TrackerError::UnknownRequest(request_id.to_string()));
        };
        let Some(result) = record.result.as_ref() else {
            self.fail(request_id, "scored record has no reasoning result".to_string(), now)?;
            return Ok(RequestState::Failed);
        };

        let signature = match digest(result) {
            Ok(signature) => signature,
            Err(err) => {
                self.fail(request_id, err.to_string(), now)?;
                return Ok(RequestState::Failed);
            }
        };
        let summary = ScoreSummary::from_result(result);
        info!(
            request_id,
            final_score = summary.final_score,
            reputation_level = %summary.reputation_level,
            "request scored"
        );

        let write = OutboundMessage::LedgerWriteRequest(LedgerWriteRequest {
            request_id: request_id.to_string(),
            entity_id: record.entity_id.clone(),
            summary: summary.clone(),
            digest: signature.clone(),
        });
        let endpoint = self.config.ledger_endpoint.clone();
        if let Err(reason) = self.send(&endpoint, write) {
            self.fail(request_id, reason, now)?;
            return Ok(RequestState::Failed);
        }

        if self
            .advance(request_id, RequestState::LedgerPending, StagePayload::Empty, now)?
            .is_none()
        {
            return Ok(record.state);
        }

        self.notify(
            request_id,
            &record.originator,
            NotificationStage::Scored,
            json!({
                "final_score": summary.final_score,
                "reputation_level": summary.reputation_level,
                "applied_rules": summary.applied_rules,
                "score_adjustment": summary.score_adjustment,
                "narrative": summary.narrative,
                "digest": signature,
            }),
        );
        Ok(RequestState::LedgerPending)
    }

    fn on_metrics_failed(
        &mut self,
        failure: MetricsFailure,
        now: OffsetDateTime,
    ) -> Result<Disposition, TrackerError> {
        if self.discard_if_finalized(&failure.request_id, "metrics_failed") {
            return Ok(Disposition::Discarded);
        }

        let recovered = match self.tracker.get(&failure.request_id)? {
            Some(record) if record.state == RequestState::Analyzing => false,
            Some(record) => {
                self.discard(
                    &failure.request_id,
                    &format!("metrics failure while {}", record.state),
                );
                return Ok(Disposition::Discarded);
            }
            None => {
                let seed = RecoveredRequest {
                    request_id: failure.request_id.clone(),
                    entity_id: failure.entity_id,
                    originator: self.config.fallback_originator.clone(),
                    state: RequestState::Analyzing,
                    payload: StagePayload::Empty,
                };
                if !self.recover(seed, now)? {
                    return Ok(Disposition::Dropped);
                }
                true
            }
        };

        let state = self.fail(&failure.request_id, failure.error, now)?;
        Ok(match (recovered, state) {
            (true, Disposition::Advanced(state)) => Disposition::Recovered(state),
            (_, other) => other,
        })
    }

    fn on_ledger_confirmation(
        &mut self,
        confirmation: LedgerConfirmation,
        now: OffsetDateTime,
    ) -> Result<Disposition, TrackerError> {
        let request_id = confirmation.request_id.clone();
        if self.discard_if_finalized(&request_id, "ledger_confirmation") {
            return Ok(Disposition::Discarded);
        }

        let recovered = match self.tracker.get(&request_id)? {
            Some(record) if record.state == RequestState::LedgerPending => false,
            Some(record) => {
                self.discard(
                    &request_id,
                    &format!("ledger confirmation while {}", record.state),
                );
                return Ok(Disposition::Discarded);
            }
            None => {
                let seed = RecoveredRequest {
                    request_id: request_id.clone(),
                    entity_id: confirmation
                        .entity_id
                        .clone()
                        .unwrap_or_else(|| UNKNOWN_ENTITY.to_string()),
                    originator: self.config.fallback_originator.clone(),
                    state: RequestState::LedgerPending,
                    payload: StagePayload::Empty,
                };
                if !self.recover(seed, now)? {
                    return Ok(Disposition::Dropped);
                }
                true
            }
        };

        let outcome = match confirmation.status {
            LedgerStatus::Success => self.complete(&request_id, confirmation.reference, now)?,
            LedgerStatus::Error => {
                let reason = confirmation
                    .error
                    .unwrap_or_else(|| "ledger write failed".to_string());
                self.fail(&request_id, reason, now)?
            }
        };

        Ok(match (recovered, outcome) {
            (true, Disposition::Advanced(state)) => Disposition::Recovered(state),
            (_, other) => other,
        })
    }

    fn complete(
        &mut self,
        request_id: &str,
        reference: Option<String>,
        now: OffsetDateTime,
    ) -> Result<Disposition, TrackerError> {
        let Some(record) = self.advance(
            request_id,
            RequestState::Completed,
            StagePayload::LedgerReceipt {
                reference: reference.clone(),
            },
            now,
        )?
        else {
            return Ok(Disposition::Discarded);
        };

        info!(request_id, reference = reference.as_deref().unwrap_or(""), "request completed");
        let (final_score, reputation_level) = match record.result.as_ref() {
            Some(result) => (Some(result.final_score), Some(result.reputation_level)),
            None => (None, None),
        };
        self.notify(
            request_id,
            &record.originator,
            NotificationStage::Completed,
            json!({
                "reference": reference,
                "final_score": final_score,
                "reputation_level": reputation_level,
            }),
        );
        self.stats.completed += 1;
        self.finalize(request_id, now)?;
        Ok(Disposition::Advanced(RequestState::Completed))
    }

    /// Move a live record to `FAILED`, notify the originator, and evict it.
    fn fail(
        &mut self,
        request_id: &str,
        reason: String,
        now: OffsetDateTime,
    ) -> Result<Disposition, TrackerError> {
        let reason = truncate_chars(&reason, self.config.error_truncate_chars);
        let stage = match self.tracker.get(request_id)? {
            Some(record) => record.state,
            None => return Err(TrackerError::UnknownRequest(request_id.to_string())),
        };

        let Some(record) = self.advance(
            request_id,
            RequestState::Failed,
            StagePayload::failure(reason.clone()),
            now,
        )?
        else {
            return Ok(Disposition::Discarded);
        };

        warn!(request_id, stage = %stage, reason = %reason, "request failed");
        self.notify(
            request_id,
            &record.originator,
            NotificationStage::Failed,
            json!({
                "stage": stage,
                "reason": reason,
            }),
        );
        self.stats.failed += 1;
        self.finalize(request_id, now)?;
        Ok(Disposition::Advanced(RequestState::Failed))
    }

    fn finalize(&mut self, request_id: &str, now: OffsetDateTime) -> Result<(), TrackerError> {
        self.tracker.evict(request_id)?;
        self.finalized.insert(request_id.to_string(), now);
        Ok(())
    }

    /// Transition, turning illegal or unknown-id outcomes into a logged discard.
    fn advance(
        &mut self,
        request_id: &str,
        next: RequestState,
        payload: StagePayload,
        now: OffsetDateTime,
    ) -> Result<Option<RequestRecord>, TrackerError> {
        match self.tracker.transition(request_id, next, payload, now) {
            Ok(record) => Ok(Some(record)),
            Err(TrackerError::IllegalTransition { from, to, .. }) => {
                self.discard(request_id, &format!("{from} -> {to}"));
                Ok(None)
            }
            Err(TrackerError::UnknownRequest(_)) => {
                self.discard(request_id, "request is no longer tracked");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Apply the unknown-reply policy. Returns whether a record now exists.
    fn recover(&mut self, seed: RecoveredRequest, now: OffsetDateTime) -> Result<bool, TrackerError> {
        match self.config.unknown_reply_policy {
            UnknownReplyPolicy::Drop => {
                warn!(request_id = %seed.request_id, state = %seed.state, "unknown request dropped");
                self.stats.dropped += 1;
                Ok(false)
            }
            UnknownReplyPolicy::Recover => {
                let request_id = seed.request_id.clone();
                let state = seed.state;
                self.tracker.recover(seed, now)?;
                warn!(request_id = %request_id, state = %state, "unknown request recovered");
                self.stats.recovered += 1;
                Ok(true)
            }
        }
    }

    fn discard_if_finalized(&mut self, request_id: &str, kind: &str) -> bool {
        if self.finalized.contains_key(request_id) {
            self.discard(request_id, &format!("{kind} after terminal notification"));
            return true;
        }
        false
    }

    fn discard(&mut self, request_id: &str, reason: &str) {
        warn!(request_id, reason, "out-of-order message discarded");
        self.stats.discarded += 1;
    }

    fn send(&mut self, endpoint: &str, message: OutboundMessage) -> Result<(), String> {
        let dispatch = Dispatch::new(endpoint, message);
        match self.dispatcher.dispatch(&dispatch) {
            Ok(()) => {
                debug!(
                    request_id = dispatch.message.request_id(),
                    endpoint,
                    message_id = %dispatch.message_id,
                    "dispatched"
                );
                Ok(())
            }
            Err(err) => {
                let reason = format!("dispatch to {endpoint} failed: {err:#}");
                warn!(request_id = dispatch.message.request_id(), endpoint, error = %err, "dispatch failed");
                self.stats.dispatch_failures += 1;
                Err(reason)
            }
        }
    }

    /// Notifications are best effort; a refused notification does not change state.
    fn notify(
        &mut self,
        request_id: &str,
        originator: &str,
        stage: NotificationStage,
        payload: serde_json::Value,
    ) {
        let endpoint = self.config.notifier_endpoint.clone();
        let message = OutboundMessage::Notification(Notification {
            request_id: request_id.to_string(),
            originator: originator.to_string(),
            stage,
            payload,
        });
        let _ = self.send(&endpoint, message);
    }

    /// Evict records older than `stale_after_seconds`.
    ///
    /// A swept record that never reached a terminal state gets one failed
    /// notification. Tombstones older than the same threshold are forgotten.
    ///
    /// # Errors
    /// Returns [`TrackerError::Store`] when the record store fails.
    pub fn sweep(&mut self, now: OffsetDateTime) -> Result<Vec<String>, TrackerError> {
        let max_age = self.config.stale_after();
        let evicted = self.tracker.sweep_records(now, max_age)?;
        self.last_sweep = Some(now);

        let mut ids = Vec::with_capacity(evicted.len());
        for record in evicted {
            warn!(
                request_id = %record.request_id,
                state = %record.state,
                age_seconds = record.age(now).whole_seconds(),
                "stale request evicted"
            );
            self.stats.stale_evictions += 1;
            self.abandon(&record, "timed out", now);
            ids.push(record.request_id);
        }

        self.finalized
            .retain(|_, finalized_at| now - *finalized_at <= max_age);
        Ok(ids)
    }

    /// Fail and evict every live record before the process exits.
    ///
    /// Callers backed by a durable tracker skip this so the records outlive
    /// the process.
    ///
    /// # Errors
    /// Returns [`TrackerError::Store`] when the record store fails.
    pub fn shutdown(&mut self, now: OffsetDateTime) -> Result<Vec<String>, TrackerError> {
        let mut ids = Vec::new();
        for record in self.tracker.list()? {
            self.tracker.evict(&record.request_id)?;
            warn!(request_id = %record.request_id, state = %record.state, "live request abandoned at shutdown");
            self.abandon(&record, "relay stopped", now);
            ids.push(record.request_id);
        }
        Ok(ids)
    }

    /// Send the terminal failure for an evicted record that never got one.
    fn abandon(&mut self, record: &RequestRecord, cause: &str, now: OffsetDateTime) {
        if record.state.is_terminal() || self.finalized.contains_key(&record.request_id) {
            return;
        }
        let reason = truncate_chars(
            &format!("{cause} at stage {}", record.state),
            self.config.error_truncate_chars,
        );
        self.notify(
            &record.request_id,
            &record.originator,
            NotificationStage::Failed,
            json!({
                "stage": record.state,
                "reason": reason,
            }),
        );
        self.stats.failed += 1;
        self.finalized.insert(record.request_id.clone(), now);
    }

    /// Sweep when at least `sweep_interval_seconds` passed since the last sweep.
    ///
    /// # Errors
    /// Returns [`TrackerError::Store`] when the record store fails.
    pub fn tick(&mut self, now: OffsetDateTime) -> Result<Option<Vec<String>>, TrackerError> {
        let interval = time::Duration::seconds(
            i64::try_from(self.config.sweep_interval_seconds).unwrap_or(i64::MAX),
        );
        let due = match self.last_sweep {
            Some(last) => now - last >= interval,
            None => true,
        };
        if !due {
            return Ok(None);
        }
        self.sweep(now).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use score_relay_core::default_rules;
    use score_relay_tracker::InMemoryRecordStore;

    fn at(seconds: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(seconds)
    }

    fn coordinator() -> Coordinator<InMemoryRecordStore, RecordingDispatcher> {
        match Coordinator::new(
            CoordinatorConfig::default(),
            default_rules(),
            Tracker::in_memory(),
            RecordingDispatcher::new(),
        ) {
            Ok(coordinator) => coordinator,
            Err(err) => panic!("expected default config to be valid: {err}"),
        }
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let config = CoordinatorConfig {
            stale_after_seconds: 0,
            ..CoordinatorConfig::default()
        };
        let built = Coordinator::new(
            config,
            default_rules(),
            Tracker::in_memory(),
            RecordingDispatcher::new(),
        );
        assert!(built.is_err());
    }

    #[test]
    fn tick_respects_sweep_interval() {
        let mut coordinator = coordinator();
        assert!(matches!(coordinator.tick(at(0)), Ok(Some(_))));
        assert!(matches!(coordinator.tick(at(59)), Ok(None)));
        assert!(matches!(coordinator.tick(at(60)), Ok(Some(_))));
    }

    #[test]
    fn tombstones_expire_after_stale_threshold() {
        let mut coordinator = coordinator();
        let request = InboundMessage::ScoreRequest(ScoreRequest {
            entity_id: "0xabc".to_string(),
            request_id: "A".to_string(),
            originator: "caller".to_string(),
        });
        assert!(coordinator.handle(request, at(0)).is_ok());
        let failure = InboundMessage::MetricsFailed(MetricsFailure {
            request_id: "A".to_string(),
            entity_id: "0xabc".to_string(),
            error: "collector offline".to_string(),
        });
        assert_eq!(
            coordinator.handle(failure, at(1)),
            Ok(Disposition::Advanced(RequestState::Failed))
        );
        assert!(coordinator.is_finalized("A"));

        assert!(coordinator.sweep(at(200)).is_ok());
        assert!(coordinator.is_finalized("A"));
        assert!(coordinator.sweep(at(302)).is_ok());
        assert!(!coordinator.is_finalized("A"));
    }
}
