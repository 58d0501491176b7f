//! Recognition session coordinator: one frame in, one result per face out.

use crate::error::{Error, Result};
use crate::extract::FeatureExtractor;
use crate::ledger::Ledger;
use crate::matcher::{EuclideanMatcher, MatchOutcome, Matcher};
use crate::registry::Registry;
use crate::types::{AttendanceRecord, IdentityId, MarkOutcome, PeriodKey};
use crate::vector::FeatureVector;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// What happened to the ledger for one face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum FaceOutcome {
    Marked { record: AttendanceRecord },
    AlreadyMarked { record: AttendanceRecord },
    /// The face matched nobody; the ledger was not touched.
    NotAttempted,
    /// Matching or marking this face failed. Sibling faces are unaffected.
    Failed { kind: String, message: String },
}

/// Per-face result of one recognition cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    /// Position of the face in the detected sequence.
    pub face_index: usize,
    pub identity_id: Option<IdentityId>,
    pub display_name: Option<String>,
    pub confidence: f32,
    /// Distance to the matched (or nearest) identity, when known.
    pub distance: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tied_with: Vec<IdentityId>,
    pub outcome: FaceOutcome,
}

impl RecognitionResult {
    pub fn is_recognized(&self) -> bool {
        self.identity_id.is_some()
    }

    /// Human-readable status for display.
    pub fn status_message(&self) -> String {
        match &self.outcome {
            FaceOutcome::Marked { .. } => "marked".to_string(),
            FaceOutcome::AlreadyMarked { .. } => "already marked today".to_string(),
            FaceOutcome::NotAttempted => "not recognized".to_string(),
            FaceOutcome::Failed { kind, .. } => format!("error: {kind}"),
        }
    }

    fn failed(face_index: usize, err: &Error) -> Self {
        Self {
            face_index,
            identity_id: None,
            display_name: None,
            confidence: 0.0,
            distance: None,
            tied_with: Vec::new(),
            outcome: FaceOutcome::Failed {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        }
    }
}

pub struct SessionCoordinator {
    registry: Arc<Registry>,
    ledger: Arc<Ledger>,
    matcher: Box<dyn Matcher>,
    threshold: f32,
}

impl SessionCoordinator {
    pub fn new(registry: Arc<Registry>, ledger: Arc<Ledger>, threshold: f32) -> Self {
        Self {
            registry,
            ledger,
            matcher: Box::new(EuclideanMatcher),
            threshold,
        }
    }

    pub fn with_matcher(mut self, matcher: impl Matcher + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Match every detected vector and mark each resolved identity.
    ///
    /// All faces are matched against one snapshot before any mark is
    /// attempted. A `Timeout` while matching fails the whole frame and leaves
    /// the ledger untouched. Any other error is reported on its own face.
    pub fn process_frame(
        &self,
        detected: &[FeatureVector],
        occurred_at: NaiveDateTime,
        period: PeriodKey,
        deadline: Option<Instant>,
    ) -> Result<Vec<RecognitionResult>> {
        let snapshot = self.registry.snapshot();

        let mut matches = Vec::with_capacity(detected.len());
        for vector in detected {
            match self.matcher.compare(vector, &snapshot, self.threshold, deadline) {
                Err(err @ Error::Timeout { .. }) => {
                    tracing::warn!(faces = detected.len(), error = %err, "frame abandoned");
                    return Err(err);
                }
                other => matches.push(other),
            }
        }

        let results: Vec<RecognitionResult> = matches
            .into_iter()
            .enumerate()
            .map(|(face_index, outcome)| self.resolve_face(face_index, outcome, occurred_at, period))
            .collect();

        tracing::debug!(
            faces = results.len(),
            recognized = results.iter().filter(|r| r.is_recognized()).count(),
            generation = snapshot.generation(),
            period = %period,
            "frame processed"
        );
        Ok(results)
    }

    /// Run `image` through `extractor`, then [`process_frame`](Self::process_frame).
    pub fn process_image<E: FeatureExtractor>(
        &self,
        extractor: &E,
        image: &E::Image,
        occurred_at: NaiveDateTime,
        period: PeriodKey,
        deadline: Option<Instant>,
    ) -> Result<Vec<RecognitionResult>> {
        let detected = extractor.extract(image)?;
        self.process_frame(&detected, occurred_at, period, deadline)
    }

    fn resolve_face(
        &self,
        face_index: usize,
        outcome: Result<MatchOutcome>,
        occurred_at: NaiveDateTime,
        period: PeriodKey,
    ) -> RecognitionResult {
        let matched = match outcome {
            Ok(MatchOutcome::Matched(m)) => m,
            Ok(MatchOutcome::Unmatched { nearest_distance }) => {
                return RecognitionResult {
                    face_index,
                    identity_id: None,
                    display_name: None,
                    confidence: 0.0,
                    distance: nearest_distance,
                    tied_with: Vec::new(),
                    outcome: FaceOutcome::NotAttempted,
                };
            }
            Err(err) => {
                tracing::warn!(face = face_index, error = %err, "face match failed");
                return RecognitionResult::failed(face_index, &err);
            }
        };

        let outcome = match self
            .ledger
            .mark(&matched.identity_id, period, occurred_at, matched.confidence)
        {
            Ok(MarkOutcome::Marked(record)) => FaceOutcome::Marked { record },
            Ok(MarkOutcome::AlreadyMarked(record)) => FaceOutcome::AlreadyMarked { record },
            Err(err) => {
                tracing::warn!(
                    face = face_index,
                    identity = %matched.identity_id,
                    error = %err,
                    "attendance mark failed"
                );
                FaceOutcome::Failed {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                }
            }
        };

        RecognitionResult {
            face_index,
            identity_id: Some(matched.identity_id),
            display_name: Some(matched.display_name),
            confidence: matched.confidence,
            distance: Some(matched.distance),
            tied_with: matched.tied_with,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{AttendanceFilter, MemoryRepository, Repository};
    use crate::types::{AttendanceStatus, EnrolledVector, Identity, IdentitySummary};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn day(s: &str) -> PeriodKey {
        s.parse().unwrap()
    }

    fn v(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    fn coordinator_over(repo: Arc<dyn Repository>) -> SessionCoordinator {
        let registry = Arc::new(Registry::open(repo.clone(), 3).unwrap());
        let ledger = Arc::new(Ledger::new(repo));
        SessionCoordinator::new(registry, ledger, 0.5)
    }

    /// Registry with S1 enrolled at [1, 0, 0].
    fn coordinator() -> SessionCoordinator {
        let coord = coordinator_over(Arc::new(MemoryRepository::new()));
        let s1 = coord.registry().create_identity("S1", "Ada Lovelace").unwrap();
        coord.registry().enroll(&s1, v(&[1.0, 0.0, 0.0])).unwrap();
        coord
    }

    #[test]
    fn test_daily_scenario_marks_once_per_day() {
        let coord = coordinator();
        let frame = vec![v(&[1.0, 0.0, 0.0])];

        let first = coord
            .process_frame(&frame, at("2024-09-02", "09:00:00"), day("2024-09-02"), None)
            .unwrap();
        let FaceOutcome::Marked { record: original } = &first[0].outcome else {
            panic!("expected Marked, got {:?}", first[0].outcome);
        };
        assert_eq!(first[0].status_message(), "marked");

        let again = coord
            .process_frame(&frame, at("2024-09-02", "09:02:00"), day("2024-09-02"), None)
            .unwrap();
        assert_eq!(again[0].outcome, FaceOutcome::AlreadyMarked { record: original.clone() });
        assert_eq!(again[0].status_message(), "already marked today");

        let next_day = coord
            .process_frame(&frame, at("2024-09-03", "09:00:00"), day("2024-09-03"), None)
            .unwrap();
        let FaceOutcome::Marked { record } = &next_day[0].outcome else {
            panic!("expected a new Marked record on the next day");
        };
        assert_ne!(record.id, original.id);
    }

    #[test]
    fn test_known_and_unknown_faces_in_one_frame() {
        let coord = coordinator();
        let frame = vec![v(&[0.99, 0.05, 0.0]), v(&[0.0, 0.0, 1.0])];
        let results = coord
            .process_frame(&frame, at("2024-09-02", "09:00:00"), day("2024-09-02"), None)
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].identity_id.as_ref().map(IdentityId::as_str), Some("S1"));
        assert!(matches!(results[0].outcome, FaceOutcome::Marked { .. }));
        assert_eq!(results[1].identity_id, None);
        assert_eq!(results[1].outcome, FaceOutcome::NotAttempted);
        assert_eq!(results[1].status_message(), "not recognized");
    }

    #[test]
    fn test_bad_face_does_not_abort_siblings() {
        let coord = coordinator();
        let frame = vec![v(&[1.0, 0.0]), v(&[1.0, 0.0, 0.0])];
        let results = coord
            .process_frame(&frame, at("2024-09-02", "09:00:00"), day("2024-09-02"), None)
            .unwrap();

        assert_eq!(results[0].status_message(), "error: dimension-mismatch");
        assert!(matches!(results[1].outcome, FaceOutcome::Marked { .. }));
    }

    #[test]
    fn test_empty_frame_yields_no_results() {
        let coord = coordinator();
        let results = coord
            .process_frame(&[], at("2024-09-02", "09:00:00"), day("2024-09-02"), None)
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_timeout_fails_whole_frame_without_marking() {
        let coord = coordinator();
        let frame = vec![v(&[1.0, 0.0, 0.0]), v(&[1.0, 0.0, 0.0])];
        let err = coord
            .process_frame(
                &frame,
                at("2024-09-02", "09:00:00"),
                day("2024-09-02"),
                Some(Instant::now()),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(err.is_retryable());
        assert!(coord
            .ledger()
            .query(day("2024-09-02"), day("2024-09-02"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_removed_identity_is_no_longer_recognized_but_history_remains() {
        let coord = coordinator();
        let s1 = IdentityId::parse("S1").unwrap();
        let frame = vec![v(&[1.0, 0.0, 0.0])];
        coord
            .process_frame(&frame, at("2024-09-02", "09:00:00"), day("2024-09-02"), None)
            .unwrap();

        coord.registry().remove(&s1).unwrap();
        let results = coord
            .process_frame(&frame, at("2024-09-03", "09:00:00"), day("2024-09-03"), None)
            .unwrap();
        assert_eq!(results[0].outcome, FaceOutcome::NotAttempted);
        assert_eq!(coord.ledger().query_by_identity(&s1).unwrap().len(), 1);
    }

    struct FixedExtractor(Vec<FeatureVector>);

    impl FeatureExtractor for FixedExtractor {
        type Image = [u8];

        fn extract(&self, image: &[u8]) -> Result<Vec<FeatureVector>> {
            if image.is_empty() {
                return Err(Error::Extraction("empty image".into()));
            }
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_process_image_routes_through_extractor() {
        let coord = coordinator();
        let extractor = FixedExtractor(vec![v(&[1.0, 0.0, 0.0])]);
        let results = coord
            .process_image(&extractor, &[1, 2, 3], at("2024-09-02", "09:00:00"), day("2024-09-02"), None)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_recognized());

        let err = coord
            .process_image(&extractor, &[], at("2024-09-02", "09:00:00"), day("2024-09-02"), None)
            .unwrap_err();
        assert_eq!(err.kind(), "extraction");
    }

    /// Repository whose marks fail after the first N calls.
    struct FlakyRepository {
        inner: MemoryRepository,
        marks_left: AtomicUsize,
    }

    impl Repository for FlakyRepository {
        fn create_identity(&self, id: &IdentityId, name: &str, at: DateTime<Utc>) -> Result<()> {
            self.inner.create_identity(id, name, at)
        }
        fn contains_identity(&self, id: &IdentityId) -> Result<bool> {
            self.inner.contains_identity(id)
        }
        fn identity(&self, id: &IdentityId) -> Result<Option<IdentitySummary>> {
            self.inner.identity(id)
        }
        fn identities(&self) -> Result<Vec<IdentitySummary>> {
            self.inner.identities()
        }
        fn get_snapshot(&self) -> Result<Vec<Identity>> {
            self.inner.get_snapshot()
        }
        fn enroll(&self, id: &IdentityId, v: &FeatureVector, at: DateTime<Utc>) -> Result<EnrolledVector> {
            self.inner.enroll(id, v, at)
        }
        fn remove_vectors(&self, id: &IdentityId) -> Result<usize> {
            self.inner.remove_vectors(id)
        }
        fn rename_identity(&self, id: &IdentityId, name: &str) -> Result<()> {
            self.inner.rename_identity(id, name)
        }
        fn mark_if_absent(&self, candidate: AttendanceRecord) -> Result<MarkOutcome> {
            let left = self.marks_left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(Error::StorageUnavailable("disk unplugged".into()));
            }
            self.marks_left.store(left - 1, Ordering::SeqCst);
            self.inner.mark_if_absent(candidate)
        }
        fn append_suppressed(&self, record: AttendanceRecord) -> Result<()> {
            self.inner.append_suppressed(record)
        }
        fn query_range(&self, filter: &AttendanceFilter) -> Result<Vec<AttendanceRecord>> {
            self.inner.query_range(filter)
        }
    }

    #[test]
    fn test_storage_failure_is_isolated_per_face() {
        let repo = Arc::new(FlakyRepository {
            inner: MemoryRepository::new(),
            marks_left: AtomicUsize::new(1),
        });
        let coord = coordinator_over(repo);
        let a = coord.registry().create_identity("A", "Ada Lovelace").unwrap();
        let b = coord.registry().create_identity("B", "Bob Babbage").unwrap();
        coord.registry().enroll(&a, v(&[1.0, 0.0, 0.0])).unwrap();
        coord.registry().enroll(&b, v(&[0.0, 1.0, 0.0])).unwrap();

        let frame = vec![v(&[1.0, 0.0, 0.0]), v(&[0.0, 1.0, 0.0])];
        let results = coord
            .process_frame(&frame, at("2024-09-02", "09:00:00"), day("2024-09-02"), None)
            .unwrap();

        assert!(matches!(results[0].outcome, FaceOutcome::Marked { .. }));
        assert_eq!(results[1].identity_id.as_ref().map(IdentityId::as_str), Some("B"));
        assert_eq!(results[1].status_message(), "error: storage-unavailable");

        let marked = coord
            .ledger()
            .filter(&AttendanceFilter::new().status(AttendanceStatus::Marked))
            .unwrap();
        assert_eq!(marked.len(), 1);
    }

    #[test]
    fn test_results_serialize_with_status_tag() {
        let coord = coordinator();
        let results = coord
            .process_frame(&[v(&[0.0, 0.0, 1.0])], at("2024-09-02", "09:00:00"), day("2024-09-02"), None)
            .unwrap();
        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json[0]["outcome"]["status"], "not-attempted");
    }
}
