#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use score_relay_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, EntityMetrics, ReasoningResult, RequestState,
};
use score_relay_tracker::{RecordStore, RequestRecord};
use time::OffsetDateTime;

const TRACKER_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS request_records (
  request_id TEXT PRIMARY KEY,
  entity_id TEXT NOT NULL,
  originator TEXT NOT NULL,
  state TEXT NOT NULL CHECK (state IN ('RECEIVED','ANALYZING','SCORED','LEDGER_PENDING','COMPLETED','FAILED')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  metrics_json TEXT,
  result_json TEXT,
  ledger_reference TEXT,
  failure TEXT,
  recovered INTEGER NOT NULL CHECK (recovered IN (0,1))
);

CREATE INDEX IF NOT EXISTS idx_request_records_state ON request_records(state);
";

const SELECT_COLUMNS: &str = "request_id, entity_id, originator, state, created_at, updated_at,
    metrics_json, result_json, ledger_reference, failure, recovered";

/// Durable tracker backend. Records survive restarts, so replies for requests
/// created before a restart are correlated instead of recovered.
pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    /// Open or create a `SQLite` tracker database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Opens the database and applies pending migrations.
    ///
    /// # Errors
    /// Returns an error if opening or migrating fails.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    /// # Errors
    /// Returns an error if the schema cannot be applied or recorded.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply tracker schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![TRACKER_SCHEMA_VERSION, now],
            )
            .context("failed to record tracker migration")?;

        Ok(())
    }

    /// # Errors
    /// Returns an error if the migrations table cannot be read.
    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to read schema version")
    }
}

impl RecordStore for SqliteRecordStore {
    fn get(&self, request_id: &str) -> Result<Option<RequestRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM request_records WHERE request_id = ?1"),
                params![request_id],
                read_raw_row,
            )
            .optional()
            .with_context(|| format!("failed to load request {request_id}"))?;

        raw.map(RawRecord::decode).transpose()
    }

    fn insert(&mut self, record: &RequestRecord) -> Result<()> {
        let encoded = EncodedRecord::encode(record)?;
        self.conn
            .execute(
                "INSERT INTO request_records(
                    request_id, entity_id, originator, state, created_at, updated_at,
                    metrics_json, result_json, ledger_reference, failure, recovered
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.request_id,
                    record.entity_id,
                    record.originator,
                    record.state.as_str(),
                    encoded.created_at,
                    encoded.updated_at,
                    encoded.metrics_json,
                    encoded.result_json,
                    record.ledger_reference,
                    record.failure,
                    bool_to_sql(record.recovered),
                ],
            )
            .with_context(|| format!("failed to insert request {}", record.request_id))?;
        Ok(())
    }

    fn replace(&mut self, record: &RequestRecord) -> Result<()> {
        let encoded = EncodedRecord::encode(record)?;
        let changed = self
            .conn
            .execute(
                "UPDATE request_records SET
                    entity_id = ?2, originator = ?3, state = ?4, created_at = ?5,
                    updated_at = ?6, metrics_json = ?7, result_json = ?8,
                    ledger_reference = ?9, failure = ?10, recovered = ?11
                 WHERE request_id = ?1",
                params![
                    record.request_id,
                    record.entity_id,
                    record.originator,
                    record.state.as_str(),
                    encoded.created_at,
                    encoded.updated_at,
                    encoded.metrics_json,
                    encoded.result_json,
                    record.ledger_reference,
                    record.failure,
                    bool_to_sql(record.recovered),
                ],
            )
            .with_context(|| format!("failed to update request {}", record.request_id))?;

        if changed == 0 {
            bail!("record {} does not exist", record.request_id);
        }
        Ok(())
    }

    fn remove(&mut self, request_id: &str) -> Result<Option<RequestRecord>> {
        let existing = self.get(request_id)?;
        if existing.is_some() {
            self.conn
                .execute(
                    "DELETE FROM request_records WHERE request_id = ?1",
                    params![request_id],
                )
                .with_context(|| format!("failed to delete request {request_id}"))?;
        }
        Ok(existing)
    }

    fn list(&self) -> Result<Vec<RequestRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {SELECT_COLUMNS} FROM request_records"))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_raw_row(row)?.decode()?);
        }

        // RFC3339 text does not sort chronologically once fractional seconds vary.
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        Ok(out)
    }
}

struct EncodedRecord {
    created_at: String,
    updated_at: String,
    metrics_json: Option<String>,
    result_json: Option<String>,
}

impl EncodedRecord {
    fn encode(record: &RequestRecord) -> Result<Self> {
        Ok(Self {
            created_at: rfc3339(record.created_at)?,
            updated_at: rfc3339(record.updated_at)?,
            metrics_json: record
                .metrics
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to encode metrics payload")?,
            result_json: record
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to encode reasoning payload")?,
        })
    }
}

struct RawRecord {
    request_id: String,
    entity_id: String,
    originator: String,
    state: String,
    created_at: String,
    updated_at: String,
    metrics_json: Option<String>,
    result_json: Option<String>,
    ledger_reference: Option<String>,
    failure: Option<String>,
    recovered: i64,
}

fn read_raw_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        request_id: row.get(0)?,
        entity_id: row.get(1)?,
        originator: row.get(2)?,
        state: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        metrics_json: row.get(6)?,
        result_json: row.get(7)?,
        ledger_reference: row.get(8)?,
        failure: row.get(9)?,
        recovered: row.get(10)?,
    })
}

impl RawRecord {
    fn decode(self) -> Result<RequestRecord> {
        let state = RequestState::parse(&self.state)
            .ok_or_else(|| anyhow!("unknown request state: {}", self.state))?;
        let metrics = self
            .metrics_json
            .as_deref()
            .map(serde_json::from_str::<EntityMetrics>)
            .transpose()
            .with_context(|| format!("invalid metrics payload for {}", self.request_id))?;
        let result = self
            .result_json
            .as_deref()
            .map(serde_json::from_str::<ReasoningResult>)
            .transpose()
            .with_context(|| format!("invalid reasoning payload for {}", self.request_id))?;

        Ok(RequestRecord {
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            request_id: self.request_id,
            entity_id: self.entity_id,
            originator: self.originator,
            state,
            metrics,
            result,
            ledger_reference: self.ledger_reference,
            failure: self.failure,
            recovered: sql_to_bool(self.recovered),
        })
    }
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err))
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    parse_rfc3339_utc(value).map_err(|err| anyhow!(err))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn sql_to_bool(value: i64) -> bool {
    value != 0
}
