//! Nearest-identity matching over a registry snapshot.

use crate::error::{Error, Result};
use crate::registry::{check_vector, IdentityTemplates, RegistrySnapshot};
use crate::types::IdentityId;
use crate::vector::FeatureVector;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Default maximum distance for a match (normalized Euclidean, inclusive).
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Distances closer than this are considered tied.
pub const TIE_EPSILON: f32 = 1e-6;

/// How many template comparisons run between deadline checks.
const DEADLINE_CHECK_INTERVAL: usize = 64;

/// A resolved identity for one query vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub identity_id: IdentityId,
    pub display_name: String,
    /// Best distance over the identity's templates.
    pub distance: f32,
    /// `1 - distance / threshold`, clamped to [0, 1].
    pub confidence: f32,
    /// Other identities within `TIE_EPSILON` of the minimum distance. The
    /// smallest id wins a tie; a non-empty list flags the match as ambiguous.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tied_with: Vec<IdentityId>,
}

impl Match {
    pub fn is_ambiguous(&self) -> bool {
        !self.tied_with.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum MatchOutcome {
    Matched(Match),
    Unmatched {
        /// Distance to the closest identity, if any were enrolled.
        nearest_distance: Option<f32>,
    },
}

impl MatchOutcome {
    pub fn matched(&self) -> Option<&Match> {
        match self {
            MatchOutcome::Matched(m) => Some(m),
            MatchOutcome::Unmatched { .. } => None,
        }
    }
}

/// Strategy for resolving a query vector against a registry snapshot.
pub trait Matcher: Send + Sync {
    /// Resolve `query` against `snapshot`.
    ///
    /// Fails with `DimensionMismatch` if the query length differs from the
    /// snapshot dimension, with `InvalidVector` if it holds NaN or infinite
    /// components, and with `Timeout` if `deadline` passes mid-scan.
    fn compare(
        &self,
        query: &FeatureVector,
        snapshot: &RegistrySnapshot,
        threshold: f32,
        deadline: Option<Instant>,
    ) -> Result<MatchOutcome>;
}

/// Euclidean matcher over L2-normalized vectors.
///
/// Every template of every identity is visited; an identity scores the minimum
/// distance over its own templates (best-of, not averaged).
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        query: &FeatureVector,
        snapshot: &RegistrySnapshot,
        threshold: f32,
        deadline: Option<Instant>,
    ) -> Result<MatchOutcome> {
        check_vector(snapshot.dimension(), query)?;
        let started = Instant::now();
        check_deadline(deadline, started)?;

        let query = query.normalized();
        let mut scores: Vec<(&IdentityTemplates, f32)> = Vec::with_capacity(snapshot.len());
        let mut compared = 0usize;

        for templates in snapshot.iter() {
            let mut identity_best = f32::INFINITY;
            for template in &templates.vectors {
                identity_best = identity_best.min(query.distance(template));
                compared += 1;
                if compared % DEADLINE_CHECK_INTERVAL == 0 {
                    check_deadline(deadline, started)?;
                }
            }
            scores.push((templates, identity_best));
        }
        check_deadline(deadline, started)?;

        let Some(found) = nearest(&scores) else {
            return Ok(MatchOutcome::Unmatched { nearest_distance: None });
        };

        if found.minimum > threshold {
            return Ok(MatchOutcome::Unmatched {
                nearest_distance: Some(found.minimum),
            });
        }

        let winner = found.winner;
        let distance = found.distance;
        let tied_with: Vec<IdentityId> = found.tied_with.iter().map(|t| t.id.clone()).collect();
        if !tied_with.is_empty() {
            tracing::warn!(
                identity = %winner.id,
                tied = ?tied_with,
                distance,
                "ambiguous match resolved to smallest identity id"
            );
        }

        Ok(MatchOutcome::Matched(Match {
            identity_id: winner.id.clone(),
            display_name: winner.display_name.clone(),
            distance,
            confidence: confidence(distance, threshold),
            tied_with,
        }))
    }
}

/// Winner of a scan: the smallest id among identities within `TIE_EPSILON`
/// of the overall minimum distance.
struct Nearest<'a> {
    winner: &'a IdentityTemplates,
    /// The winner's own best distance.
    distance: f32,
    /// Lowest distance over all identities.
    minimum: f32,
    tied_with: Vec<&'a IdentityTemplates>,
}

fn nearest<'a>(scores: &[(&'a IdentityTemplates, f32)]) -> Option<Nearest<'a>> {
    let minimum = scores.iter().map(|(_, d)| *d).min_by(f32::total_cmp)?;
    let mut within: Vec<(&IdentityTemplates, f32)> = scores
        .iter()
        .filter(|(_, d)| *d - minimum <= TIE_EPSILON)
        .copied()
        .collect();
    within.sort_by(|a, b| a.0.id.cmp(&b.0.id));

    let mut within = within.into_iter();
    let (winner, distance) = within.next()?;
    Some(Nearest {
        winner,
        distance,
        minimum,
        tied_with: within.map(|(t, _)| t).collect(),
    })
}

/// Monotonically decreasing map from distance to [0, 1].
pub fn confidence(distance: f32, threshold: f32) -> f32 {
    if threshold <= 0.0 {
        return if distance <= 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - distance / threshold).clamp(0.0, 1.0)
}

fn check_deadline(deadline: Option<Instant>, started: Instant) -> Result<()> {
    match deadline {
        Some(d) if Instant::now() >= d => Err(Error::Timeout {
            elapsed: started.elapsed(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnrolledVector, Identity};
    use chrono::Utc;

    fn identity(id: &str, vectors: &[&[f32]]) -> Identity {
        Identity {
            id: IdentityId::parse(id).unwrap(),
            display_name: format!("Person {id}"),
            created_at: Utc::now(),
            vectors: vectors
                .iter()
                .enumerate()
                .map(|(i, v)| EnrolledVector {
                    version: i as u32 + 1,
                    vector: FeatureVector::new(v.to_vec()),
                    enrolled_at: Utc::now(),
                })
                .collect(),
        }
    }

    fn snapshot(identities: Vec<Identity>) -> RegistrySnapshot {
        let dim = identities[0].vectors[0].vector.dimension();
        RegistrySnapshot::from_identities(dim, identities).unwrap()
    }

    fn q(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    #[test]
    fn test_empty_snapshot_is_unmatched() {
        let snap = RegistrySnapshot::empty(3);
        let outcome = EuclideanMatcher.compare(&q(&[1.0, 0.0, 0.0]), &snap, 10.0, None).unwrap();
        assert_eq!(outcome, MatchOutcome::Unmatched { nearest_distance: None });
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let snap = snapshot(vec![identity("A", &[&[1.0, 0.0, 0.0]])]);
        let err = EuclideanMatcher.compare(&q(&[1.0, 0.0]), &snap, 0.5, None).unwrap_err();
        assert_eq!(err, Error::DimensionMismatch { expected: 3, actual: 2 });
    }

    #[test]
    fn test_non_finite_query_is_rejected() {
        let snap = snapshot(vec![identity("A", &[&[1.0, 0.0, 0.0]])]);
        let err = EuclideanMatcher
            .compare(&q(&[f32::NAN, 0.0, 0.0]), &snap, 0.5, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidVector(_)));
    }

    #[test]
    fn test_resolves_to_closer_identity() {
        let snap = snapshot(vec![
            identity("A", &[&[1.0, 0.0, 0.0]]),
            identity("B", &[&[0.0, 1.0, 0.0]]),
        ]);
        // Close to A (distance ~0.1), far from B (~1.35).
        let outcome = EuclideanMatcher.compare(&q(&[1.0, 0.1, 0.0]), &snap, 0.5, None).unwrap();
        let m = outcome.matched().expect("should match A");
        assert_eq!(m.identity_id.as_str(), "A");
        assert!(!m.is_ambiguous());
        assert!(m.confidence > 0.0 && m.confidence <= 1.0);
    }

    #[test]
    fn test_identity_scores_best_of_its_vectors() {
        let snap = snapshot(vec![
            identity("A", &[&[0.0, 0.0, 1.0], &[1.0, 0.0, 0.0]]),
            identity("B", &[&[0.7, 0.7, 0.0]]),
        ]);
        // Averaging A's vectors would lose to B; best-of picks A.
        let outcome = EuclideanMatcher.compare(&q(&[1.0, 0.05, 0.0]), &snap, 0.5, None).unwrap();
        assert_eq!(outcome.matched().unwrap().identity_id.as_str(), "A");
    }

    #[test]
    fn test_exact_match_has_full_confidence() {
        let snap = snapshot(vec![identity("S1", &[&[0.2, 0.4, 0.4]])]);
        let outcome = EuclideanMatcher.compare(&q(&[0.2, 0.4, 0.4]), &snap, 0.5, None).unwrap();
        let m = outcome.matched().unwrap();
        assert!(m.distance < 1e-6);
        assert!((m.confidence - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let snap = snapshot(vec![identity("A", &[&[1.0, 0.0]])]);
        let query = q(&[0.8, 0.6]);
        let distance = query.normalized().distance(&FeatureVector::new(vec![1.0, 0.0]));

        let at = EuclideanMatcher.compare(&query, &snap, distance, None).unwrap();
        let m = at.matched().expect("distance == threshold must match");
        assert_eq!(m.confidence, 0.0);

        let below = EuclideanMatcher.compare(&query, &snap, distance - 1e-4, None).unwrap();
        assert!(matches!(below, MatchOutcome::Unmatched { nearest_distance: Some(_) }));
    }

    #[test]
    fn test_tie_goes_to_smallest_id_and_is_flagged() {
        // Both at exactly the same distance from the query.
        let snap = snapshot(vec![
            identity("B", &[&[0.0, 1.0]]),
            identity("A", &[&[1.0, 0.0]]),
            identity("C", &[&[-1.0, 0.0]]),
        ]);
        let query = q(&[1.0, 1.0]);
        let outcome = EuclideanMatcher.compare(&query, &snap, 1.0, None).unwrap();
        let m = outcome.matched().unwrap();
        assert_eq!(m.identity_id.as_str(), "A");
        assert_eq!(m.tied_with, vec![IdentityId::parse("B").unwrap()]);
        assert!(m.is_ambiguous());
    }

    fn templates(id: &str) -> IdentityTemplates {
        IdentityTemplates {
            id: IdentityId::parse(id).unwrap(),
            display_name: format!("Person {id}"),
            vectors: Vec::new(),
        }
    }

    #[test]
    fn test_tie_window_is_anchored_at_the_minimum() {
        let (a, b, c) = (templates("A"), templates("B"), templates("C"));
        // B is within epsilon of both A and C, but A and C are not within
        // epsilon of each other.
        let with_a = [(&a, 0.3), (&b, 0.299_999_2), (&c, 0.299_998_4)];
        let without_a = [(&b, 0.299_999_2), (&c, 0.299_998_4)];

        for scores in [&with_a[..], &without_a[..]] {
            let n = nearest(scores).unwrap();
            assert_eq!(n.winner.id.as_str(), "B");
            assert_eq!(n.distance, 0.299_999_2);
            assert_eq!(n.minimum, 0.299_998_4);
            let tied: Vec<&str> = n.tied_with.iter().map(|t| t.id.as_str()).collect();
            assert_eq!(tied, vec!["C"]);
        }
    }

    #[test]
    fn test_nearest_ignores_scan_order() {
        let (a, b, c) = (templates("A"), templates("B"), templates("C"));
        let forward = [(&a, 0.4), (&b, 0.2), (&c, 0.2 + TIE_EPSILON / 2.0)];
        let reversed = [(&c, 0.2 + TIE_EPSILON / 2.0), (&b, 0.2), (&a, 0.4)];
        for scores in [&forward[..], &reversed[..]] {
            let n = nearest(scores).unwrap();
            assert_eq!(n.winner.id.as_str(), "B");
            assert_eq!(n.tied_with.len(), 1);
            assert_eq!(n.tied_with[0].id.as_str(), "C");
        }
        assert!(nearest(&[]).is_none());
    }

    #[test]
    fn test_scaled_query_matches_same_identity() {
        let snap = snapshot(vec![identity("A", &[&[3.0, 4.0]])]);
        let outcome = EuclideanMatcher.compare(&q(&[0.3, 0.4]), &snap, 0.01, None).unwrap();
        assert!(outcome.matched().is_some());
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let snap = snapshot(vec![identity("A", &[&[1.0, 0.0]])]);
        let deadline = Instant::now();
        let err = EuclideanMatcher.compare(&q(&[1.0, 0.0]), &snap, 0.5, Some(deadline)).unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_confidence_is_monotonic() {
        assert_eq!(confidence(0.0, 0.5), 1.0);
        assert!(confidence(0.1, 0.5) > confidence(0.2, 0.5));
        assert_eq!(confidence(0.6, 0.5), 0.0);
        assert_eq!(confidence(0.0, 0.0), 1.0);
    }
}
