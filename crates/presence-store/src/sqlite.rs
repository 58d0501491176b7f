//! SQLite-backed repository.
//!
//! One writer connection behind a mutex plus, for file databases, a read-only
//! connection in WAL mode so reports never wait on an in-flight mark. The
//! at-most-one-mark rule is enforced by a partial unique index; marking is a
//! single `INSERT .. ON CONFLICT DO NOTHING` followed, only on conflict, by a
//! read of the winning row inside the same transaction.

use crate::codec::{CodecError, TemplateCodec};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use presence_core::repository::{AttendanceFilter, Repository};
use presence_core::{
    AttendanceRecord, AttendanceStatus, EnrolledVector, Error, FeatureVector, Identity, IdentityId,
    IdentitySummary, MarkOutcome, PeriodKey, Result,
};
use rusqlite::{
    params, Connection, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// Full nanosecond precision, so a stored record reads back equal to the one
/// returned when it was marked. Fixed width keeps text order equal to time order.
const OCCURRED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9f";
const OCCURRED_AT_PARSE: &str = "%Y-%m-%dT%H:%M:%S%.f";
const TIME_OF_DAY_FORMAT: &str = "%H:%M:%S%.9f";
const RECORD_COLUMNS: &str = "id, identity_id, period, occurred_at, confidence, status";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("template: {0}")]
    Codec(#[from] CodecError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rejected(Error),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Rejected(inner) => inner,
            other => {
                tracing::error!(error = %other, "storage failure");
                Error::StorageUnavailable(other.to_string())
            }
        }
    }
}

pub struct SqliteRepository {
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
    codec: TemplateCodec,
    path: Option<PathBuf>,
}

impl SqliteRepository {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>, codec: TemplateCodec) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize(&writer)?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(BUSY_TIMEOUT)?;

        tracing::info!(
            path = %path.display(),
            encrypted = codec.is_sealed(),
            "attendance store opened"
        );
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
            codec,
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database; reads share the writer connection.
    pub fn open_in_memory(codec: TemplateCodec) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(&conn)?;
        Ok(Self {
            writer: Mutex::new(conn),
            reader: None,
            codec,
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn initialize(conn: &Connection) -> Result<(), StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T> {
        let mut conn = self.writer.lock();
        Ok(in_transaction(&mut conn, TransactionBehavior::Immediate, f)?)
    }

    fn read<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>) -> Result<T> {
        let value = match &self.reader {
            Some(reader) => in_transaction(&mut reader.lock(), TransactionBehavior::Deferred, f),
            None => in_transaction(&mut self.writer.lock(), TransactionBehavior::Deferred, f),
        };
        Ok(value?)
    }
}

fn in_transaction<T>(
    conn: &mut Connection,
    behavior: TransactionBehavior,
    f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let tx = conn.transaction_with_behavior(behavior)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

impl Repository for SqliteRepository {
    fn create_identity(
        &self,
        id: &IdentityId,
        display_name: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        self.write(|tx| {
            let inserted = tx.execute(
                "INSERT INTO identities (id, display_name, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (id) DO NOTHING",
                params![id.as_str(), display_name, format_utc(created_at)],
            )?;
            if inserted == 0 {
                return Err(StoreError::Rejected(Error::DuplicateIdentity(id.to_string())));
            }
            Ok(())
        })
    }

    fn contains_identity(&self, id: &IdentityId) -> Result<bool> {
        self.read(|tx| identity_exists(tx, id))
    }

    fn identity(&self, id: &IdentityId) -> Result<Option<IdentitySummary>> {
        self.read(|tx| {
            let row = tx
                .query_row(
                    &summary_sql("WHERE i.id = ?1"),
                    [id.as_str()],
                    SummaryRow::from_row,
                )
                .optional()?;
            row.map(SummaryRow::into_summary).transpose()
        })
    }

    fn identities(&self) -> Result<Vec<IdentitySummary>> {
        self.read(|tx| {
            let mut stmt = tx.prepare(&summary_sql(""))?;
            let rows = stmt
                .query_map([], SummaryRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(SummaryRow::into_summary).collect()
        })
    }

    fn rename_identity(&self, id: &IdentityId, display_name: &str) -> Result<()> {
        self.write(|tx| {
            let updated = tx.execute(
                "UPDATE identities SET display_name = ?2 WHERE id = ?1",
                params![id.as_str(), display_name],
            )?;
            if updated == 0 {
                return Err(StoreError::Rejected(Error::UnknownIdentity(id.to_string())));
            }
            Ok(())
        })
    }

    fn get_snapshot(&self) -> Result<Vec<Identity>> {
        self.read(|tx| {
            let mut identities: BTreeMap<String, Identity> = BTreeMap::new();

            let mut stmt =
                tx.prepare("SELECT id, display_name, created_at FROM identities ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (id, display_name, created_at) in rows {
                let identity = Identity {
                    id: parse_identity_id(&id)?,
                    display_name,
                    created_at: parse_utc(&created_at)?,
                    vectors: Vec::new(),
                };
                identities.insert(id, identity);
            }

            let mut stmt = tx.prepare(
                "SELECT identity_id, version, dimension, vector, enrolled_at
                 FROM templates ORDER BY identity_id, version",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (identity_id, version, dimension, blob, enrolled_at) in rows {
                let vector = self
                    .codec
                    .decode(&blob, &template_context(&identity_id, version))?;
                if vector.dimension() as i64 != dimension {
                    return Err(StoreError::Corrupt(format!(
                        "template {identity_id}:{version} decodes to {} values, row says {dimension}",
                        vector.dimension()
                    )));
                }
                let identity = identities.get_mut(&identity_id).ok_or_else(|| {
                    StoreError::Corrupt(format!("template for missing identity {identity_id}"))
                })?;
                identity.vectors.push(EnrolledVector {
                    version,
                    vector,
                    enrolled_at: parse_utc(&enrolled_at)?,
                });
            }

            Ok(identities.into_values().collect())
        })
    }

    fn enroll(
        &self,
        id: &IdentityId,
        vector: &FeatureVector,
        enrolled_at: DateTime<Utc>,
    ) -> Result<EnrolledVector> {
        self.write(|tx| {
            let last: Option<u32> = tx
                .query_row(
                    "SELECT last_version FROM identities WHERE id = ?1",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(last) = last else {
                return Err(StoreError::Rejected(Error::UnknownIdentity(id.to_string())));
            };

            let version = last + 1;
            let blob = self
                .codec
                .encode(vector, &template_context(id.as_str(), version))?;
            tx.execute(
                "UPDATE identities SET last_version = ?2 WHERE id = ?1",
                params![id.as_str(), version],
            )?;
            tx.execute(
                "INSERT INTO templates (identity_id, version, dimension, vector, enrolled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.as_str(),
                    version,
                    vector.dimension() as i64,
                    blob,
                    format_utc(enrolled_at)
                ],
            )?;
            Ok(EnrolledVector {
                version,
                vector: vector.clone(),
                enrolled_at,
            })
        })
    }

    fn remove_vectors(&self, id: &IdentityId) -> Result<usize> {
        self.write(|tx| {
            if !identity_exists(tx, id)? {
                return Err(StoreError::Rejected(Error::UnknownIdentity(id.to_string())));
            }
            Ok(tx.execute("DELETE FROM templates WHERE identity_id = ?1", [id.as_str()])?)
        })
    }

    fn mark_if_absent(&self, candidate: AttendanceRecord) -> Result<MarkOutcome> {
        self.write(|tx| {
            if !identity_exists(tx, &candidate.identity_id)? {
                return Err(StoreError::Rejected(Error::UnknownIdentity(
                    candidate.identity_id.to_string(),
                )));
            }

            let inserted = insert_record(
                tx,
                &candidate,
                "INSERT INTO attendance (id, identity_id, period, occurred_at, time_of_day, confidence, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT DO NOTHING",
            )?;
            if inserted == 1 {
                return Ok(MarkOutcome::Marked(candidate));
            }

            let existing = tx.query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM attendance
                     WHERE identity_id = ?1 AND period = ?2 AND status = 'marked'"
                ),
                params![candidate.identity_id.as_str(), candidate.period.to_string()],
                RecordRow::from_row,
            )?;
            Ok(MarkOutcome::AlreadyMarked(existing.into_record()?))
        })
    }

    fn append_suppressed(&self, record: AttendanceRecord) -> Result<()> {
        self.write(|tx| {
            if !identity_exists(tx, &record.identity_id)? {
                return Err(StoreError::Rejected(Error::UnknownIdentity(
                    record.identity_id.to_string(),
                )));
            }
            insert_record(
                tx,
                &record,
                "INSERT INTO attendance (id, identity_id, period, occurred_at, time_of_day, confidence, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            Ok(())
        })
    }

    fn query_range(&self, filter: &AttendanceFilter) -> Result<Vec<AttendanceRecord>> {
        self.read(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM attendance
                 WHERE (?1 IS NULL OR period >= ?1)
                   AND (?2 IS NULL OR period <= ?2)
                   AND (?3 IS NULL OR identity_id = ?3)
                   AND (?4 IS NULL OR status = ?4)
                 ORDER BY period, time_of_day, identity_id, id"
            ))?;
            let rows = stmt
                .query_map(
                    params![
                        filter.start.map(|p| p.to_string()),
                        filter.end.map(|p| p.to_string()),
                        filter.identity.as_ref().map(|id| id.as_str()),
                        filter.status.map(|s| s.as_str()),
                    ],
                    RecordRow::from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(RecordRow::into_record).collect()
        })
    }
}

fn identity_exists(conn: &Connection, id: &IdentityId) -> Result<bool, StoreError> {
    Ok(conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM identities WHERE id = ?1)",
        [id.as_str()],
        |row| row.get(0),
    )?)
}

fn insert_record(
    conn: &Connection,
    record: &AttendanceRecord,
    sql: &str,
) -> Result<usize, StoreError> {
    Ok(conn.execute(
        sql,
        params![
            record.id.to_string(),
            record.identity_id.as_str(),
            record.period.to_string(),
            record.occurred_at.format(OCCURRED_AT_FORMAT).to_string(),
            record.time_of_day().format(TIME_OF_DAY_FORMAT).to_string(),
            f64::from(record.confidence),
            record.status.as_str(),
        ],
    )?)
}

fn summary_sql(filter: &str) -> String {
    format!(
        "SELECT i.id, i.display_name, i.created_at, COUNT(t.version), MAX(t.enrolled_at)
         FROM identities i LEFT JOIN templates t ON t.identity_id = i.id
         {filter}
         GROUP BY i.id ORDER BY i.id"
    )
}

fn template_context(identity_id: &str, version: u32) -> Vec<u8> {
    format!("{identity_id}:{version}").into_bytes()
}

/// Fixed-width UTC timestamps so text order equals time order.
fn format_utc(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_utc(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt("timestamp", e))
}

fn parse_identity_id(raw: &str) -> Result<IdentityId, StoreError> {
    IdentityId::parse(raw).map_err(|e| corrupt("identity id", e))
}

fn corrupt(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {err}"))
}

struct SummaryRow {
    id: String,
    display_name: String,
    created_at: String,
    vector_count: i64,
    last_enrolled_at: Option<String>,
}

impl SummaryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            display_name: row.get(1)?,
            created_at: row.get(2)?,
            vector_count: row.get(3)?,
            last_enrolled_at: row.get(4)?,
        })
    }

    fn into_summary(self) -> Result<IdentitySummary, StoreError> {
        Ok(IdentitySummary {
            id: parse_identity_id(&self.id)?,
            display_name: self.display_name,
            created_at: parse_utc(&self.created_at)?,
            vector_count: usize::try_from(self.vector_count).map_err(|e| corrupt("vector count", e))?,
            last_enrolled_at: self.last_enrolled_at.as_deref().map(parse_utc).transpose()?,
        })
    }
}

struct RecordRow {
    id: String,
    identity_id: String,
    period: String,
    occurred_at: String,
    confidence: f64,
    status: String,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identity_id: row.get(1)?,
            period: row.get(2)?,
            occurred_at: row.get(3)?,
            confidence: row.get(4)?,
            status: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<AttendanceRecord, StoreError> {
        Ok(AttendanceRecord {
            id: Uuid::parse_str(&self.id).map_err(|e| corrupt("record id", e))?,
            identity_id: parse_identity_id(&self.identity_id)?,
            period: self
                .period
                .parse::<PeriodKey>()
                .map_err(|e| corrupt("period", e))?,
            occurred_at: NaiveDateTime::parse_from_str(&self.occurred_at, OCCURRED_AT_PARSE)
                .map_err(|e| corrupt("occurred_at", e))?,
            confidence: self.confidence as f32,
            status: AttendanceStatus::parse(&self.status)
                .ok_or_else(|| corrupt("status", &self.status))?,
        })
    }
}
