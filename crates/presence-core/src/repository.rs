//! Persistence boundary for the registry and the ledger.
//!
//! The core only relies on two storage guarantees: `mark_if_absent` is a single
//! atomic insert-if-absent keyed by (identity, period), and `get_snapshot`
//! returns a consistent view. [`MemoryRepository`] provides both in-process;
//! durable backends live in other crates.

use crate::error::{Error, Result};
use crate::types::{
    sort_records, AttendanceRecord, AttendanceStatus, EnrolledVector, Identity, IdentityId,
    IdentitySummary, MarkOutcome, PeriodKey,
};
use crate::vector::FeatureVector;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Selection over the attendance log. All set criteria must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttendanceFilter {
    pub start: Option<PeriodKey>,
    pub end: Option<PeriodKey>,
    pub identity: Option<IdentityId>,
    pub status: Option<AttendanceStatus>,
}

impl AttendanceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a single period.
    pub fn period(self, period: PeriodKey) -> Self {
        self.period_range(period, period)
    }

    /// Restrict to an inclusive period range.
    pub fn period_range(mut self, start: PeriodKey, end: PeriodKey) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn identity(mut self, id: IdentityId) -> Self {
        self.identity = Some(id);
        self
    }

    pub fn status(mut self, status: AttendanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        self.start.map_or(true, |s| record.period >= s)
            && self.end.map_or(true, |e| record.period <= e)
            && self.identity.as_ref().map_or(true, |id| &record.identity_id == id)
            && self.status.map_or(true, |s| record.status == s)
    }
}

/// Storage operations required by the registry and the ledger.
pub trait Repository: Send + Sync {
    /// Create an identity with no vectors. Fails with `DuplicateIdentity` if the id was ever used.
    fn create_identity(
        &self,
        id: &IdentityId,
        display_name: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Whether the identity was created (with or without vectors).
    fn contains_identity(&self, id: &IdentityId) -> Result<bool>;

    fn identity(&self, id: &IdentityId) -> Result<Option<IdentitySummary>>;

    fn identities(&self) -> Result<Vec<IdentitySummary>>;

    /// Replace the display name of an existing identity.
    fn rename_identity(&self, id: &IdentityId, display_name: &str) -> Result<()>;

    /// All identities with their vectors, ordered by id.
    fn get_snapshot(&self) -> Result<Vec<Identity>>;

    /// Append a vector to an existing identity and assign it the next version.
    fn enroll(
        &self,
        id: &IdentityId,
        vector: &FeatureVector,
        enrolled_at: DateTime<Utc>,
    ) -> Result<EnrolledVector>;

    /// Delete every vector of the identity. Returns how many were removed.
    fn remove_vectors(&self, id: &IdentityId) -> Result<usize>;

    /// Atomically store `candidate` unless a `marked` record exists for its
    /// (identity, period); in that case return the existing record untouched.
    fn mark_if_absent(&self, candidate: AttendanceRecord) -> Result<MarkOutcome>;

    /// Append a `duplicate-suppressed` audit record.
    fn append_suppressed(&self, record: AttendanceRecord) -> Result<()>;

    /// Records matching `filter`, sorted by (period, time of day, identity id).
    fn query_range(&self, filter: &AttendanceFilter) -> Result<Vec<AttendanceRecord>>;
}

#[derive(Default)]
struct KeyHistory {
    marked: Option<AttendanceRecord>,
    suppressed: Vec<AttendanceRecord>,
}

struct IdentityEntry {
    identity: Identity,
    /// Highest version ever assigned; survives vector removal.
    last_version: u32,
}

/// In-process repository.
///
/// Identities sit behind a reader-writer lock (writes are rare). Attendance is
/// sharded by (identity, period) in a `DashMap`, so marking one key only
/// contends with readers of the same shard.
#[derive(Default)]
pub struct MemoryRepository {
    identities: RwLock<BTreeMap<IdentityId, IdentityEntry>>,
    attendance: DashMap<(IdentityId, PeriodKey), KeyHistory>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for MemoryRepository {
    fn create_identity(
        &self,
        id: &IdentityId,
        display_name: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut identities = self.identities.write();
        if identities.contains_key(id) {
            return Err(Error::DuplicateIdentity(id.to_string()));
        }
        identities.insert(
            id.clone(),
            IdentityEntry {
                identity: Identity {
                    id: id.clone(),
                    display_name: display_name.to_string(),
                    created_at,
                    vectors: Vec::new(),
                },
                last_version: 0,
            },
        );
        Ok(())
    }

    fn contains_identity(&self, id: &IdentityId) -> Result<bool> {
        Ok(self.identities.read().contains_key(id))
    }

    fn identity(&self, id: &IdentityId) -> Result<Option<IdentitySummary>> {
        Ok(self
            .identities
            .read()
            .get(id)
            .map(|e| IdentitySummary::from(&e.identity)))
    }

    fn identities(&self) -> Result<Vec<IdentitySummary>> {
        Ok(self
            .identities
            .read()
            .values()
            .map(|e| IdentitySummary::from(&e.identity))
            .collect())
    }

    fn rename_identity(&self, id: &IdentityId, display_name: &str) -> Result<()> {
        let mut identities = self.identities.write();
        let entry = identities
            .get_mut(id)
            .ok_or_else(|| Error::UnknownIdentity(id.to_string()))?;
        entry.identity.display_name = display_name.to_string();
        Ok(())
    }

    fn get_snapshot(&self) -> Result<Vec<Identity>> {
        Ok(self
            .identities
            .read()
            .values()
            .map(|e| e.identity.clone())
            .collect())
    }

    fn enroll(
        &self,
        id: &IdentityId,
        vector: &FeatureVector,
        enrolled_at: DateTime<Utc>,
    ) -> Result<EnrolledVector> {
        let mut identities = self.identities.write();
        let entry = identities
            .get_mut(id)
            .ok_or_else(|| Error::UnknownIdentity(id.to_string()))?;
        entry.last_version += 1;
        let enrolled = EnrolledVector {
            version: entry.last_version,
            vector: vector.clone(),
            enrolled_at,
        };
        entry.identity.vectors.push(enrolled.clone());
        Ok(enrolled)
    }

    fn remove_vectors(&self, id: &IdentityId) -> Result<usize> {
        let mut identities = self.identities.write();
        let entry = identities
            .get_mut(id)
            .ok_or_else(|| Error::UnknownIdentity(id.to_string()))?;
        Ok(std::mem::take(&mut entry.identity.vectors).len())
    }

    fn mark_if_absent(&self, candidate: AttendanceRecord) -> Result<MarkOutcome> {
        if !self.contains_identity(&candidate.identity_id)? {
            return Err(Error::UnknownIdentity(candidate.identity_id.to_string()));
        }
        let key = (candidate.identity_id.clone(), candidate.period);
        // The entry guard holds the shard write lock: check and insert are one step.
        let mut entry = self.attendance.entry(key).or_default();
        if let Some(existing) = &entry.marked {
            return Ok(MarkOutcome::AlreadyMarked(existing.clone()));
        }
        entry.marked = Some(candidate.clone());
        Ok(MarkOutcome::Marked(candidate))
    }

    fn append_suppressed(&self, record: AttendanceRecord) -> Result<()> {
        debug_assert_eq!(record.status, AttendanceStatus::DuplicateSuppressed);
        let key = (record.identity_id.clone(), record.period);
        self.attendance.entry(key).or_default().suppressed.push(record);
        Ok(())
    }

    fn query_range(&self, filter: &AttendanceFilter) -> Result<Vec<AttendanceRecord>> {
        let mut records: Vec<AttendanceRecord> = Vec::new();
        for entry in self.attendance.iter() {
            let history = entry.value();
            records.extend(
                history
                    .marked
                    .iter()
                    .chain(history.suppressed.iter())
                    .filter(|r| filter.matches(r))
                    .cloned(),
            );
        }
        sort_records(&mut records);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn id(s: &str) -> IdentityId {
        IdentityId::parse(s).unwrap()
    }

    fn period(s: &str) -> PeriodKey {
        s.parse().unwrap()
    }

    fn record(who: &str, day: &str, time: &str) -> AttendanceRecord {
        let at = NaiveDateTime::parse_from_str(&format!("{day} {time}"), "%Y-%m-%d %H:%M:%S").unwrap();
        AttendanceRecord::new(id(who), period(day), at, 0.8, AttendanceStatus::Marked)
    }

    fn repo_with(ids: &[&str]) -> MemoryRepository {
        let repo = MemoryRepository::new();
        for who in ids {
            repo.create_identity(&id(who), "Test Person", Utc::now()).unwrap();
        }
        repo
    }

    #[test]
    fn test_create_identity_twice_is_duplicate() {
        let repo = repo_with(&["S1"]);
        let err = repo.create_identity(&id("S1"), "Other", Utc::now()).unwrap_err();
        assert_eq!(err, Error::DuplicateIdentity("S1".into()));
    }

    #[test]
    fn test_enroll_versions_continue_after_removal() {
        let repo = repo_with(&["S1"]);
        let v = FeatureVector::new(vec![1.0, 0.0]);
        assert_eq!(repo.enroll(&id("S1"), &v, Utc::now()).unwrap().version, 1);
        assert_eq!(repo.enroll(&id("S1"), &v, Utc::now()).unwrap().version, 2);
        assert_eq!(repo.remove_vectors(&id("S1")).unwrap(), 2);
        assert_eq!(repo.enroll(&id("S1"), &v, Utc::now()).unwrap().version, 3);
    }

    #[test]
    fn test_enroll_unknown_identity() {
        let repo = MemoryRepository::new();
        let err = repo
            .enroll(&id("ghost"), &FeatureVector::new(vec![1.0]), Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), "unknown-identity");
    }

    #[test]
    fn test_mark_if_absent_returns_existing_record() {
        let repo = repo_with(&["S1"]);
        let first = repo.mark_if_absent(record("S1", "2024-05-01", "09:00:00")).unwrap();
        let second = repo.mark_if_absent(record("S1", "2024-05-01", "09:02:00")).unwrap();
        assert!(first.is_new());
        assert_eq!(second, MarkOutcome::AlreadyMarked(first.record().clone()));
        assert_eq!(repo.query_range(&AttendanceFilter::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_mark_if_absent_requires_created_identity() {
        let repo = MemoryRepository::new();
        let err = repo.mark_if_absent(record("S9", "2024-05-01", "09:00:00")).unwrap_err();
        assert_eq!(err, Error::UnknownIdentity("S9".into()));
    }

    #[test]
    fn test_query_range_filters_and_sorts() {
        let repo = repo_with(&["A", "B"]);
        repo.mark_if_absent(record("B", "2024-05-02", "08:00:00")).unwrap();
        repo.mark_if_absent(record("A", "2024-05-01", "10:00:00")).unwrap();
        repo.mark_if_absent(record("B", "2024-05-01", "09:00:00")).unwrap();
        repo.mark_if_absent(record("A", "2024-05-03", "07:00:00")).unwrap();

        let filter = AttendanceFilter::new().period_range(period("2024-05-01"), period("2024-05-02"));
        let got: Vec<String> = repo
            .query_range(&filter)
            .unwrap()
            .iter()
            .map(|r| format!("{} {}", r.period, r.identity_id))
            .collect();
        assert_eq!(got, vec!["2024-05-01 B", "2024-05-01 A", "2024-05-02 B"]);

        let only_a = AttendanceFilter::new().identity(id("A"));
        assert_eq!(repo.query_range(&only_a).unwrap().len(), 2);
    }

    #[test]
    fn test_suppressed_records_are_filterable_by_status() {
        let repo = repo_with(&["S1"]);
        repo.mark_if_absent(record("S1", "2024-05-01", "09:00:00")).unwrap();
        let mut dup = record("S1", "2024-05-01", "09:02:00");
        dup.status = AttendanceStatus::DuplicateSuppressed;
        repo.append_suppressed(dup).unwrap();

        let all = repo.query_range(&AttendanceFilter::new()).unwrap();
        assert_eq!(all.len(), 2);
        let marked = repo
            .query_range(&AttendanceFilter::new().status(AttendanceStatus::Marked))
            .unwrap();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].status, AttendanceStatus::Marked);
    }
}
