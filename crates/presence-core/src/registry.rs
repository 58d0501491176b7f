//! Encoding registry: enrolled feature vectors per identity.
//!
//! Readers take an immutable [`RegistrySnapshot`] through an `ArcSwap`, so a
//! recognition cycle never blocks on enrollment and never sees a half-written
//! vector. Writers are serialized, persist through the repository first, then
//! publish a fresh snapshot that shares unchanged identities with the old one.

use crate::error::{Error, Result};
use crate::extract::FeatureExtractor;
use crate::repository::Repository;
use crate::types::{validate_display_name, EnrolledVector, Identity, IdentityId, IdentitySummary};
use crate::vector::FeatureVector;
use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Normalized templates of one identity, as seen by the matcher.
#[derive(Debug, Clone)]
pub struct IdentityTemplates {
    pub id: IdentityId,
    pub display_name: String,
    /// L2-normalized vectors, in enrollment order. Never empty.
    pub vectors: Vec<FeatureVector>,
}

/// Immutable point-in-time view of the registry.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    generation: u64,
    dimension: usize,
    identities: BTreeMap<IdentityId, Arc<IdentityTemplates>>,
}

impl RegistrySnapshot {
    pub fn empty(dimension: usize) -> Self {
        Self {
            generation: 0,
            dimension,
            identities: BTreeMap::new(),
        }
    }

    /// Build a snapshot from repository contents, validating dimensionality.
    ///
    /// Identities without vectors are left out: they cannot be matched.
    pub fn from_identities(dimension: usize, identities: Vec<Identity>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for identity in identities {
            if identity.vectors.is_empty() {
                continue;
            }
            let mut vectors = Vec::with_capacity(identity.vectors.len());
            for enrolled in &identity.vectors {
                check_vector(dimension, &enrolled.vector)?;
                vectors.push(enrolled.vector.normalized());
            }
            map.insert(
                identity.id.clone(),
                Arc::new(IdentityTemplates {
                    id: identity.id,
                    display_name: identity.display_name,
                    vectors,
                }),
            );
        }
        Ok(Self {
            generation: 0,
            dimension,
            identities: map,
        })
    }

    /// Monotonic counter bumped on every publish.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of identities that can be matched.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn vector_count(&self) -> usize {
        self.identities.values().map(|t| t.vectors.len()).sum()
    }

    pub fn get(&self, id: &IdentityId) -> Option<&IdentityTemplates> {
        self.identities.get(id).map(Arc::as_ref)
    }

    /// Identities in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &IdentityTemplates> {
        self.identities.values().map(Arc::as_ref)
    }
}

/// A vector must have `expected` components, all finite.
pub(crate) fn check_vector(expected: usize, vector: &FeatureVector) -> Result<()> {
    if vector.dimension() != expected {
        return Err(Error::DimensionMismatch {
            expected,
            actual: vector.dimension(),
        });
    }
    if let Some(index) = vector.values().iter().position(|x| !x.is_finite()) {
        return Err(Error::InvalidVector(format!(
            "component {index} is {}",
            vector.values()[index]
        )));
    }
    Ok(())
}

pub struct Registry {
    repo: Arc<dyn Repository>,
    dimension: usize,
    current: ArcSwap<RegistrySnapshot>,
    writer: Mutex<()>,
}

impl Registry {
    /// Open the registry over `repo`, loading the initial snapshot.
    ///
    /// Fails with `DimensionMismatch` if any stored vector does not have
    /// `dimension` components: that is a configuration error.
    pub fn open(repo: Arc<dyn Repository>, dimension: usize) -> Result<Self> {
        let snapshot = RegistrySnapshot::from_identities(dimension, repo.get_snapshot()?)?;
        tracing::info!(
            identities = snapshot.len(),
            vectors = snapshot.vector_count(),
            dimension,
            "registry loaded"
        );
        Ok(Self {
            repo,
            dimension,
            current: ArcSwap::from_pointee(snapshot),
            writer: Mutex::new(()),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Current snapshot. Lock-free; safe to hold across a whole recognition cycle.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    /// Register a new identity with no vectors yet.
    pub fn create_identity(&self, raw_id: &str, display_name: &str) -> Result<IdentityId> {
        let id = IdentityId::parse(raw_id)?;
        let name = validate_display_name(display_name)?;
        self.repo.create_identity(&id, &name, Utc::now())?;
        tracing::info!(identity = %id, name = %name, "identity created");
        Ok(id)
    }

    pub fn identities(&self) -> Result<Vec<IdentitySummary>> {
        self.repo.identities()
    }

    /// Change the display name of an existing identity.
    ///
    /// Matches made after this call carry the new name; the ledger stores
    /// only ids, so history needs no rewrite.
    pub fn rename_identity(&self, id: &IdentityId, display_name: &str) -> Result<IdentitySummary> {
        let name = validate_display_name(display_name)?;

        let _guard = self.writer.lock();
        self.repo.rename_identity(id, &name)?;

        let previous = self.current.load_full();
        if let Some(templates) = previous.get(id) {
            let mut next = RegistrySnapshot::clone(&previous);
            next.identities.insert(
                id.clone(),
                Arc::new(IdentityTemplates {
                    display_name: name.clone(),
                    ..templates.clone()
                }),
            );
            self.publish(next, previous.generation);
        }

        tracing::info!(identity = %id, name = %name, "identity renamed");
        self.repo
            .identity(id)?
            .ok_or_else(|| Error::UnknownIdentity(id.to_string()))
    }

    /// Append a feature vector to an existing identity.
    pub fn enroll(&self, id: &IdentityId, vector: FeatureVector) -> Result<EnrolledVector> {
        check_vector(self.dimension, &vector)?;

        let _guard = self.writer.lock();
        let identity = self
            .repo
            .identity(id)?
            .ok_or_else(|| Error::UnknownIdentity(id.to_string()))?;
        let enrolled = self.repo.enroll(id, &vector, Utc::now())?;

        let previous = self.current.load_full();
        let mut next = RegistrySnapshot::clone(&previous);
        let mut vectors = previous
            .get(id)
            .map(|t| t.vectors.clone())
            .unwrap_or_default();
        vectors.push(vector.normalized());
        next.identities.insert(
            id.clone(),
            Arc::new(IdentityTemplates {
                id: id.clone(),
                display_name: identity.display_name,
                vectors,
            }),
        );
        self.publish(next, previous.generation);

        tracing::info!(identity = %id, version = enrolled.version, "vector enrolled");
        Ok(enrolled)
    }

    /// Enroll the first face `extractor` finds in `image`.
    pub fn enroll_image<E: FeatureExtractor>(
        &self,
        id: &IdentityId,
        extractor: &E,
        image: &E::Image,
    ) -> Result<EnrolledVector> {
        let mut faces = extractor.extract(image)?.into_iter();
        let first = faces
            .next()
            .ok_or_else(|| Error::Extraction("no face detected in the image".into()))?;
        let ignored = faces.count();
        if ignored > 0 {
            tracing::debug!(identity = %id, ignored, "extra faces ignored during enrollment");
        }
        self.enroll(id, first)
    }

    /// Delete every vector of the identity. Past attendance is untouched.
    pub fn remove(&self, id: &IdentityId) -> Result<usize> {
        let _guard = self.writer.lock();
        let removed = self.repo.remove_vectors(id)?;

        let previous = self.current.load_full();
        if previous.get(id).is_some() {
            let mut next = RegistrySnapshot::clone(&previous);
            next.identities.remove(id);
            self.publish(next, previous.generation);
        }

        tracing::info!(identity = %id, removed, "identity vectors removed");
        Ok(removed)
    }

    /// Rebuild the snapshot from the repository.
    pub fn reload(&self) -> Result<Arc<RegistrySnapshot>> {
        let _guard = self.writer.lock();
        let next = RegistrySnapshot::from_identities(self.dimension, self.repo.get_snapshot()?)?;
        let generation = self.current.load().generation;
        self.publish(next, generation);
        Ok(self.snapshot())
    }

    fn publish(&self, mut next: RegistrySnapshot, previous_generation: u64) {
        next.generation = previous_generation + 1;
        tracing::debug!(
            generation = next.generation,
            identities = next.len(),
            "registry snapshot published"
        );
        self.current.store(Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    fn registry(dimension: usize) -> Registry {
        Registry::open(Arc::new(MemoryRepository::new()), dimension).unwrap()
    }

    struct Faces(Vec<FeatureVector>);

    impl FeatureExtractor for Faces {
        type Image = str;

        fn extract(&self, _image: &str) -> Result<Vec<FeatureVector>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_enroll_image_takes_first_face() {
        let reg = registry(2);
        let id = reg.create_identity("S1", "Ada Lovelace").unwrap();
        let two_faces = Faces(vec![
            FeatureVector::new(vec![0.0, 3.0]),
            FeatureVector::new(vec![1.0, 0.0]),
        ]);
        let enrolled = reg.enroll_image(&id, &two_faces, "photo.jpg").unwrap();
        assert_eq!(enrolled.vector.values(), &[0.0, 3.0]);

        let err = reg.enroll_image(&id, &Faces(Vec::new()), "blank.jpg").unwrap_err();
        assert_eq!(err.kind(), "extraction");
        assert_eq!(reg.snapshot().get(&id).unwrap().vectors.len(), 1);
    }

    #[test]
    fn test_enroll_requires_created_identity() {
        let reg = registry(2);
        let ghost = IdentityId::parse("ghost").unwrap();
        let err = reg.enroll(&ghost, FeatureVector::new(vec![1.0, 0.0])).unwrap_err();
        assert_eq!(err, Error::UnknownIdentity("ghost".into()));
    }

    #[test]
    fn test_enroll_rejects_wrong_dimension() {
        let reg = registry(3);
        let id = reg.create_identity("S1", "Ada Lovelace").unwrap();
        let err = reg.enroll(&id, FeatureVector::new(vec![1.0, 0.0])).unwrap_err();
        assert_eq!(err, Error::DimensionMismatch { expected: 3, actual: 2 });
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn test_identity_without_vectors_is_not_matchable() {
        let reg = registry(2);
        reg.create_identity("S1", "Ada Lovelace").unwrap();
        assert!(reg.snapshot().is_empty());
        assert_eq!(reg.identities().unwrap().len(), 1);
    }

    #[test]
    fn test_old_snapshot_is_unaffected_by_enrollment() {
        let reg = registry(2);
        let id = reg.create_identity("S1", "Ada Lovelace").unwrap();
        reg.enroll(&id, FeatureVector::new(vec![1.0, 0.0])).unwrap();

        let before = reg.snapshot();
        reg.enroll(&id, FeatureVector::new(vec![0.0, 2.0])).unwrap();
        let after = reg.snapshot();

        assert_eq!(before.get(&id).unwrap().vectors.len(), 1);
        assert_eq!(after.get(&id).unwrap().vectors.len(), 2);
        assert!(after.generation() > before.generation());
        // Stored normalized.
        assert_eq!(after.get(&id).unwrap().vectors[1].values(), &[0.0, 1.0]);
    }

    #[test]
    fn test_remove_drops_identity_from_snapshot() {
        let reg = registry(2);
        let id = reg.create_identity("S1", "Ada Lovelace").unwrap();
        reg.enroll(&id, FeatureVector::new(vec![1.0, 0.0])).unwrap();
        reg.enroll(&id, FeatureVector::new(vec![0.0, 1.0])).unwrap();

        assert_eq!(reg.remove(&id).unwrap(), 2);
        assert!(reg.snapshot().get(&id).is_none());
        // Identity itself survives; its id cannot be reused.
        assert!(reg.create_identity("S1", "Someone Else").is_err());
    }

    #[test]
    fn test_rename_republishes_snapshot_with_new_name() {
        let reg = registry(2);
        let id = reg.create_identity("S1", "Ada Lovelace").unwrap();
        reg.enroll(&id, FeatureVector::new(vec![1.0, 0.0])).unwrap();
        let before = reg.snapshot();

        let summary = reg.rename_identity(&id, "  Ada King ").unwrap();
        assert_eq!(summary.display_name, "Ada King");
        assert_eq!(summary.vector_count, 1);

        let after = reg.snapshot();
        assert_eq!(after.get(&id).unwrap().display_name, "Ada King");
        assert_eq!(after.get(&id).unwrap().vectors.len(), 1);
        assert_eq!(after.generation(), before.generation() + 1);
        assert_eq!(before.get(&id).unwrap().display_name, "Ada Lovelace");
    }

    #[test]
    fn test_rename_validates_and_requires_identity() {
        let reg = registry(2);
        let id = reg.create_identity("S1", "Ada Lovelace").unwrap();
        assert_eq!(reg.rename_identity(&id, "X").unwrap_err().kind(), "invalid-identity");

        let ghost = IdentityId::parse("ghost").unwrap();
        assert_eq!(
            reg.rename_identity(&ghost, "Grace Hopper").unwrap_err(),
            Error::UnknownIdentity("ghost".into())
        );
        // No vectors yet: the name changes without touching the snapshot.
        let generation = reg.snapshot().generation();
        reg.rename_identity(&id, "Ada King").unwrap();
        assert_eq!(reg.snapshot().generation(), generation);
        assert_eq!(reg.identities().unwrap()[0].display_name, "Ada King");
    }

    #[test]
    fn test_enroll_rejects_non_finite_components() {
        let reg = registry(3);
        let id = reg.create_identity("S1", "Ada Lovelace").unwrap();
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let err = reg.enroll(&id, FeatureVector::new(vec![0.1, bad, 0.2])).unwrap_err();
            assert_eq!(err.kind(), "invalid-vector");
        }
        assert!(reg.snapshot().is_empty());
        assert_eq!(reg.identities().unwrap()[0].vector_count, 0);
    }

    #[test]
    fn test_open_rejects_heterogeneous_dimensions() {
        let repo = Arc::new(MemoryRepository::new());
        let id = IdentityId::parse("S1").unwrap();
        repo.create_identity(&id, "Ada Lovelace", Utc::now()).unwrap();
        repo.enroll(&id, &FeatureVector::new(vec![1.0, 0.0, 0.0]), Utc::now()).unwrap();

        let err = Registry::open(repo, 2).err().unwrap();
        assert_eq!(err, Error::DimensionMismatch { expected: 2, actual: 3 });
    }

    #[test]
    fn test_reload_picks_up_repository_changes() {
        let repo = Arc::new(MemoryRepository::new());
        let reg = Registry::open(repo.clone(), 2).unwrap();
        let id = IdentityId::parse("S1").unwrap();
        repo.create_identity(&id, "Ada Lovelace", Utc::now()).unwrap();
        repo.enroll(&id, &FeatureVector::new(vec![0.0, 1.0]), Utc::now()).unwrap();

        assert!(reg.snapshot().is_empty());
        let snapshot = reg.reload().unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_concurrent_readers_see_whole_vectors() {
        let reg = Arc::new(registry(4));
        let id = reg.create_identity("S1", "Ada Lovelace").unwrap();
        reg.enroll(&id, FeatureVector::new(vec![1.0, 0.0, 0.0, 0.0])).unwrap();

        std::thread::scope(|s| {
            let writer = reg.clone();
            let wid = id.clone();
            s.spawn(move || {
                for i in 0..50 {
                    let v = FeatureVector::new(vec![0.0, 1.0 + i as f32, 0.0, 0.0]);
                    writer.enroll(&wid, v).unwrap();
                }
            });
            for _ in 0..4 {
                let reader = reg.clone();
                let rid = id.clone();
                s.spawn(move || {
                    for _ in 0..200 {
                        let snap = reader.snapshot();
                        let t = snap.get(&rid).unwrap();
                        assert!(t.vectors.iter().all(|v| v.dimension() == 4));
                    }
                });
            }
        });

        assert_eq!(reg.snapshot().get(&id).unwrap().vectors.len(), 51);
    }
}
