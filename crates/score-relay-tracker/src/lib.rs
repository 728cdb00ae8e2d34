#![forbid(unsafe_code)]

//! Registry of in-flight scoring requests.
//!
//! [`Tracker`] is the only writer of [`RequestRecord`] values. It enforces the
//! forward-only lifecycle from [`RequestState::can_transition_to`] and keeps the
//! reasoning result write-once. Storage is pluggable through [`RecordStore`].

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use score_relay_core::{EntityMetrics, ReasoningResult, RequestState};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TrackerError {
    #[error("request {0} is already tracked")]
    DuplicateRequest(String),
    #[error("request {0} is not tracked")]
    UnknownRequest(String),
    #[error("illegal transition for request {request_id}: {from} -> {to}")]
    IllegalTransition {
        request_id: String,
        from: RequestState,
        to: RequestState,
    },
    #[error("record store failure: {0}")]
    Store(String),
}

fn store_error(err: &anyhow::Error) -> TrackerError {
    TrackerError::Store(format!("{err:#}"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestRecord {
    pub request_id: String,
    pub entity_id: String,
    /// Opaque return address for notifications.
    pub originator: String,
    pub state: RequestState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub metrics: Option<EntityMetrics>,
    pub result: Option<ReasoningResult>,
    pub ledger_reference: Option<String>,
    pub failure: Option<String>,
    /// Synthesized from a reply whose request was not tracked.
    pub recovered: bool,
}

impl RequestRecord {
    #[must_use]
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        now - self.created_at
    }

    fn apply(&mut self, payload: StagePayload) {
        match payload {
            StagePayload::Empty => {}
            StagePayload::Scored { metrics, result } => {
                // Reasoning is immutable once recorded.
                if self.result.is_none() {
                    self.metrics = Some(metrics);
                    self.result = Some(*result);
                }
            }
            StagePayload::LedgerReceipt { reference } => {
                self.ledger_reference = reference;
            }
            StagePayload::Failure { reason } => {
                self.failure = Some(reason);
            }
        }
    }
}

/// Data attached to a record when it enters a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StagePayload {
    Empty,
    Scored {
        metrics: EntityMetrics,
        result: Box<ReasoningResult>,
    },
    LedgerReceipt {
        reference: Option<String>,
    },
    Failure {
        reason: String,
    },
}

impl StagePayload {
    #[must_use]
    pub fn scored(metrics: EntityMetrics, result: ReasoningResult) -> Self {
        Self::Scored {
            metrics,
            result: Box::new(result),
        }
    }

    #[must_use]
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }
}

/// Seed for a record synthesized mid-lifecycle from an unexpected reply.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredRequest {
    pub request_id: String,
    pub entity_id: String,
    pub originator: String,
    pub state: RequestState,
    pub payload: StagePayload,
}

pub trait RecordStore {
    #[allow(clippy::missing_errors_doc)]
    fn get(&self, request_id: &str) -> Result<Option<RequestRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert(&mut self, record: &RequestRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn replace(&mut self, record: &RequestRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn remove(&mut self, request_id: &str) -> Result<Option<RequestRecord>>;

    /// All live records ordered by creation time, then request id.
    #[allow(clippy::missing_errors_doc)]
    fn list(&self) -> Result<Vec<RequestRecord>>;
}

/// Volatile store; state is lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: BTreeMap<String, RequestRecord>,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn get(&self, request_id: &str) -> Result<Option<RequestRecord>> {
        Ok(self.records.get(request_id).cloned())
    }

    fn insert(&mut self, record: &RequestRecord) -> Result<()> {
        if self.records.contains_key(&record.request_id) {
            bail!("record {} already exists", record.request_id);
        }
        self.records
            .insert(record.request_id.clone(), record.clone());
        Ok(())
    }

    fn replace(&mut self, record: &RequestRecord) -> Result<()> {
        match self.records.get_mut(&record.request_id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => bail!("record {} does not exist", record.request_id),
        }
    }

    fn remove(&mut self, request_id: &str) -> Result<Option<RequestRecord>> {
        Ok(self.records.remove(request_id))
    }

    fn list(&self) -> Result<Vec<RequestRecord>> {
        let mut out = self.records.values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        Ok(out)
    }
}

#[derive(Debug)]
pub struct Tracker<S: RecordStore = InMemoryRecordStore> {
    store: S,
}

impl Tracker<InMemoryRecordStore> {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(InMemoryRecordStore::new())
    }
}

impl<S: RecordStore> Tracker<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Starts tracking a request in `RECEIVED`.
    ///
    /// # Errors
    /// Returns [`TrackerError::DuplicateRequest`] when the id is already live;
    /// the existing record is left untouched.
    pub fn create(
        &mut self,
        request_id: &str,
        entity_id: &str,
        originator: &str,
        now: OffsetDateTime,
    ) -> Result<RequestRecord, TrackerError> {
        if self.get(request_id)?.is_some() {
            return Err(TrackerError::DuplicateRequest(request_id.to_string()));
        }

        let record = RequestRecord {
            request_id: request_id.to_string(),
            entity_id: entity_id.to_string(),
            originator: originator.to_string(),
            state: RequestState::Received,
            created_at: now,
            updated_at: now,
            metrics: None,
            result: None,
            ledger_reference: None,
            failure: None,
            recovered: false,
        };
        self.store.insert(&record).map_err(|err| store_error(&err))?;
        debug!(request_id, state = %record.state, "request tracked");
        Ok(record)
    }

    /// Inserts a record directly at a mid-lifecycle state.
    ///
    /// # Errors
    /// Returns [`TrackerError::DuplicateRequest`] when the id is already live.
    pub fn recover(
        &mut self,
        seed: RecoveredRequest,
        now: OffsetDateTime,
    ) -> Result<RequestRecord, TrackerError> {
        if self.get(&seed.request_id)?.is_some() {
            return Err(TrackerError::DuplicateRequest(seed.request_id));
        }

        let mut record = RequestRecord {
            request_id: seed.request_id,
            entity_id: seed.entity_id,
            originator: seed.originator,
            state: seed.state,
            created_at: now,
            updated_at: now,
            metrics: None,
            result: None,
            ledger_reference: None,
            failure: None,
            recovered: true,
        };
        record.apply(seed.payload);
        self.store.insert(&record).map_err(|err| store_error(&err))?;
        debug!(request_id = %record.request_id, state = %record.state, "request recovered");
        Ok(record)
    }

    /// # Errors
    /// Returns [`TrackerError::Store`] when the backend fails.
    pub fn get(&self, request_id: &str) -> Result<Option<RequestRecord>, TrackerError> {
        self.store.get(request_id).map_err(|err| store_error(&err))
    }

    /// # Errors
    /// Returns [`TrackerError::Store`] when the backend fails.
    pub fn list(&self) -> Result<Vec<RequestRecord>, TrackerError> {
        self.store.list().map_err(|err| store_error(&err))
    }

    /// Moves a record one legal step forward and attaches the stage payload.
    ///
    /// # Errors
    /// Returns [`TrackerError::UnknownRequest`] when the id is not tracked and
    /// [`TrackerError::IllegalTransition`] when `next` does not follow the
    /// current state. The record is unchanged on error.
    pub fn transition(
        &mut self,
        request_id: &str,
        next: RequestState,
        payload: StagePayload,
        now: OffsetDateTime,
    ) -> Result<RequestRecord, TrackerError> {
        let Some(mut record) = self.get(request_id)? else {
            return Err(TrackerError::UnknownRequest(request_id.to_string()));
        };

        if !record.state.can_transition_to(next) {
            return Err(TrackerError::IllegalTransition {
                request_id: request_id.to_string(),
                from: record.state,
                to: next,
            });
        }

        let from = record.state;
        record.state = next;
        record.updated_at = now;
        record.apply(payload);
        self.store
            .replace(&record)
            .map_err(|err| store_error(&err))?;
        debug!(request_id, from = %from, to = %next, "request transitioned");
        Ok(record)
    }

    /// Removes a record; absent ids are a no-op.
    ///
    /// # Errors
    /// Returns [`TrackerError::Store`] when the backend fails.
    pub fn evict(&mut self, request_id: &str) -> Result<Option<RequestRecord>, TrackerError> {
        self.store
            .remove(request_id)
            .map_err(|err| store_error(&err))
    }

    /// Evicts every record older than `max_age`, whatever its state.
    ///
    /// # Errors
    /// Returns [`TrackerError::Store`] when the backend fails.
    pub fn sweep_records(
        &mut self,
        now: OffsetDateTime,
        max_age: Duration,
    ) -> Result<Vec<RequestRecord>, TrackerError> {
        let stale = self
            .list()?
            .into_iter()
            .filter(|record| record.age(now) > max_age)
            .collect::<Vec<_>>();

        let mut evicted = Vec::with_capacity(stale.len());
        for record in stale {
            if let Some(removed) = self.evict(&record.request_id)? {
                evicted.push(removed);
            }
        }
        Ok(evicted)
    }

    /// Same as [`Tracker::sweep_records`], returning only the evicted ids.
    ///
    /// # Errors
    /// Returns [`TrackerError::Store`] when the backend fails.
    pub fn sweep(
        &mut self,
        now: OffsetDateTime,
        max_age: Duration,
    ) -> Result<Vec<String>, TrackerError> {
        Ok(self
            .sweep_records(now, max_age)?
            .into_iter()
            .map(|record| record.request_id)
            .collect())
    }
}
