use crate::error::{Error, Result};
use crate::vector::FeatureVector;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const IDENTITY_ID_MAX_LEN: usize = 32;
const DISPLAY_NAME_MIN_LEN: usize = 2;
const DISPLAY_NAME_MAX_LEN: usize = 100;

/// Stable identifier of an enrolled person. Ordered lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    /// Validate and normalize a raw identifier (trimmed, `[A-Za-z0-9_-]{1,32}`).
    pub fn parse(raw: &str) -> Result<Self> {
        let cleaned = raw.trim();
        if cleaned.is_empty() {
            return Err(Error::InvalidIdentity("identity id is required".into()));
        }
        if cleaned.len() > IDENTITY_ID_MAX_LEN {
            return Err(Error::InvalidIdentity(format!(
                "identity id must be at most {IDENTITY_ID_MAX_LEN} characters"
            )));
        }
        if !cleaned
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::InvalidIdentity(
                "identity id may contain only letters, numbers, hyphens and underscores".into(),
            ));
        }
        Ok(Self(cleaned.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdentityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Validate a display name: 2–100 characters of letters, spaces, hyphens, apostrophes.
pub fn validate_display_name(raw: &str) -> Result<String> {
    let cleaned = raw.trim();
    let len = cleaned.chars().count();
    if len == 0 {
        return Err(Error::InvalidIdentity("display name is required".into()));
    }
    if !(DISPLAY_NAME_MIN_LEN..=DISPLAY_NAME_MAX_LEN).contains(&len) {
        return Err(Error::InvalidIdentity(format!(
            "display name must be between {DISPLAY_NAME_MIN_LEN} and {DISPLAY_NAME_MAX_LEN} characters"
        )));
    }
    if !cleaned
        .chars()
        .all(|c| c.is_alphabetic() || c == ' ' || c == '-' || c == '\'')
    {
        return Err(Error::InvalidIdentity(
            "display name may contain only letters, spaces, hyphens and apostrophes".into(),
        ));
    }
    Ok(cleaned.to_string())
}

/// Attendance deduplication window: one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeriodKey(NaiveDate);

impl PeriodKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Period containing the given wall-clock instant.
    pub fn containing(at: NaiveDateTime) -> Self {
        Self(at.date())
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for PeriodKey {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map(Self)
    }
}

/// One versioned feature vector of an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledVector {
    /// Per-identity version, starting at 1 and never reused.
    pub version: u32,
    pub vector: FeatureVector,
    pub enrolled_at: DateTime<Utc>,
}

/// A registered person with all of their enrolled vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub vectors: Vec<EnrolledVector>,
}

/// Identity metadata without vectors, for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: IdentityId,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub vector_count: usize,
    pub last_enrolled_at: Option<DateTime<Utc>>,
}

impl From<&Identity> for IdentitySummary {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            created_at: identity.created_at,
            vector_count: identity.vectors.len(),
            last_enrolled_at: identity.vectors.iter().map(|v| v.enrolled_at).max(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttendanceStatus {
    Marked,
    DuplicateSuppressed,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Marked => "marked",
            AttendanceStatus::DuplicateSuppressed => "duplicate-suppressed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "marked" => Some(AttendanceStatus::Marked),
            "duplicate-suppressed" => Some(AttendanceStatus::DuplicateSuppressed),
            _ => None,
        }
    }
}

/// One confirmed presence event. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub identity_id: IdentityId,
    pub period: PeriodKey,
    pub occurred_at: NaiveDateTime,
    /// Match confidence in [0, 1].
    pub confidence: f32,
    pub status: AttendanceStatus,
}

impl AttendanceRecord {
    pub fn new(
        identity_id: IdentityId,
        period: PeriodKey,
        occurred_at: NaiveDateTime,
        confidence: f32,
        status: AttendanceStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity_id,
            period,
            occurred_at,
            confidence,
            status,
        }
    }

    pub fn time_of_day(&self) -> NaiveTime {
        self.occurred_at.time()
    }
}

/// Sort records by (period, time of day, identity id), record id last for a total order.
pub fn sort_records(records: &mut [AttendanceRecord]) {
    records.sort_by(|a, b| {
        a.period
            .cmp(&b.period)
            .then_with(|| a.time_of_day().cmp(&b.time_of_day()))
            .then_with(|| a.identity_id.cmp(&b.identity_id))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Result of an insert-if-absent attempt on the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "record", rename_all = "kebab-case")]
pub enum MarkOutcome {
    /// This call created the period's `marked` record.
    Marked(AttendanceRecord),
    /// A `marked` record already existed; it is returned unchanged.
    AlreadyMarked(AttendanceRecord),
}

impl MarkOutcome {
    pub fn record(&self) -> &AttendanceRecord {
        match self {
            MarkOutcome::Marked(r) | MarkOutcome::AlreadyMarked(r) => r,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, MarkOutcome::Marked(_))
    }
}
