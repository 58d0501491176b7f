use crate::engine::{EngineError, EngineHandle};
use chrono::{DateTime, Local, NaiveDateTime};
use presence_core::{Error, FeatureVector, IdentityId, PeriodKey};
use serde::Serialize;
use std::time::{Duration, Instant};
use zbus::interface;

pub const BUS_NAME: &str = "org.presence.Attendance1";
pub const OBJECT_PATH: &str = "/org/presence/Attendance1";

/// D-Bus interface for the presence attendance daemon.
///
/// Bus name: org.presence.Attendance1
/// Object path: /org/presence/Attendance1
///
/// Structured replies are JSON strings. Errors carry the core error kind as
/// a `kind: message` prefix.
pub struct AttendanceService {
    engine: EngineHandle,
    frame_deadline: Option<Duration>,
    started: Instant,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, frame_deadline: Option<Duration>) -> Self {
        Self {
            engine,
            frame_deadline,
            started: Instant::now(),
        }
    }
}

#[interface(name = "org.presence.Attendance1")]
impl AttendanceService {
    /// Register a new identity with no vectors.
    async fn create_identity(&self, id: &str, display_name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(id, "create_identity requested");
        let id = self
            .engine
            .create_identity(id.to_string(), display_name.to_string())
            .await
            .map_err(to_fdo)?;
        Ok(id.to_string())
    }

    /// Change an identity's display name; returns the updated summary.
    async fn rename_identity(&self, id: &str, display_name: &str) -> zbus::fdo::Result<String> {
        let id = parse_id(id)?;
        tracing::info!(identity = %id, "rename_identity requested");
        let summary = self
            .engine
            .rename_identity(id, display_name.to_string())
            .await
            .map_err(to_fdo)?;
        to_json(&summary)
    }

    /// Enroll one feature vector, given as a JSON array of numbers.
    async fn enroll(&self, id: &str, vector_json: &str) -> zbus::fdo::Result<String> {
        let id = parse_id(id)?;
        let values: Vec<f32> = serde_json::from_str(vector_json)
            .map_err(|e| invalid(format!("vector must be a JSON array of numbers: {e}")))?;
        tracing::info!(identity = %id, dimension = values.len(), "enroll requested");
        let enrolled = self
            .engine
            .enroll(id.clone(), FeatureVector::new(values))
            .await
            .map_err(to_fdo)?;
        to_json(&serde_json::json!({
            "identity_id": id,
            "version": enrolled.version,
            "enrolled_at": enrolled.enrolled_at,
        }))
    }

    /// Delete every vector of an identity; attendance history is kept.
    async fn remove(&self, id: &str) -> zbus::fdo::Result<u32> {
        let id = parse_id(id)?;
        tracing::info!(identity = %id, "remove requested");
        let removed = self.engine.remove(id).await.map_err(to_fdo)?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    /// Recognize one frame of detected faces.
    ///
    /// `vectors_json` is a JSON array of vectors, one per face in detection
    /// order. `occurred_at` is local wall-clock time (RFC 3339 or
    /// `YYYY-MM-DD HH:MM:SS`); empty means now.
    async fn process_frame(&self, vectors_json: &str, occurred_at: &str) -> zbus::fdo::Result<String> {
        let deadline = self.frame_deadline.map(|d| Instant::now() + d);
        let faces: Vec<Vec<f32>> = serde_json::from_str(vectors_json).map_err(|e| {
            invalid(format!("vectors must be a JSON array of number arrays: {e}"))
        })?;
        let occurred_at = parse_occurred_at(occurred_at)?;
        let vectors = faces.into_iter().map(FeatureVector::new).collect();

        let results = self
            .engine
            .process_frame(vectors, occurred_at, deadline)
            .await
            .map_err(to_fdo)?;
        to_json(&results)
    }

    /// Attendance records with `start <= period <= end` (`YYYY-MM-DD`).
    async fn attendance(&self, start: &str, end: &str) -> zbus::fdo::Result<String> {
        let records = self
            .engine
            .attendance(parse_period(start)?, parse_period(end)?)
            .await
            .map_err(to_fdo)?;
        to_json(&records)
    }

    /// Every record of one identity.
    async fn history(&self, id: &str) -> zbus::fdo::Result<String> {
        let records = self.engine.history(parse_id(id)?).await.map_err(to_fdo)?;
        to_json(&records)
    }

    /// Present/absent counts for one period; empty means today.
    async fn summary(&self, period: &str) -> zbus::fdo::Result<String> {
        let summary = self
            .engine
            .summary(parse_period(period)?)
            .await
            .map_err(to_fdo)?;
        to_json(&summary)
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.engine.identities().await.map_err(to_fdo)?;
        to_json(&identities)
    }

    /// Rebuild the registry snapshot from storage.
    async fn reload(&self) -> zbus::fdo::Result<String> {
        tracing::info!("reload requested");
        let report = self.engine.reload().await.map_err(to_fdo)?;
        to_json(&report)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started.elapsed().as_secs(),
            "frame_deadline_ms": self.frame_deadline.map(|d| d.as_millis() as u64),
            "engine": status,
        }))
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn invalid(message: String) -> zbus::fdo::Error {
    zbus::fdo::Error::InvalidArgs(format!("invalid-argument: {message}"))
}

fn parse_id(raw: &str) -> zbus::fdo::Result<IdentityId> {
    IdentityId::parse(raw).map_err(|e| to_fdo(e.into()))
}

fn parse_period(raw: &str) -> zbus::fdo::Result<PeriodKey> {
    if raw.trim().is_empty() {
        return Ok(PeriodKey::containing(Local::now().naive_local()));
    }
    raw.parse()
        .map_err(|e| invalid(format!("period {raw:?} is not YYYY-MM-DD: {e}")))
}

fn parse_occurred_at(raw: &str) -> zbus::fdo::Result<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Local::now().naive_local());
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Local).naive_local());
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| invalid(format!("timestamp {raw:?} is not RFC 3339 or YYYY-MM-DD HH:MM:SS")))
}

/// Map engine errors onto standard D-Bus errors, keeping the core kind visible.
fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    let err = match err {
        EngineError::Core(err) => err,
        other => return zbus::fdo::Error::Failed(other.to_string()),
    };
    let message = format!("{}: {err}", err.kind());
    match err {
        Error::DimensionMismatch { .. } | Error::InvalidVector(_) | Error::InvalidIdentity(_) => {
            zbus::fdo::Error::InvalidArgs(message)
        }
        Error::DuplicateIdentity(_) => zbus::fdo::Error::FileExists(message),
        Error::UnknownIdentity(_) => zbus::fdo::Error::UnknownObject(message),
        Error::Timeout { .. } => zbus::fdo::Error::TimedOut(message),
        Error::StorageUnavailable(_) => zbus::fdo::Error::IOError(message),
        Error::Extraction(_) => zbus::fdo::Error::Failed(message),
    }
}
