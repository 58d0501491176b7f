//! Boundary to the external face feature extractor.

use crate::error::Result;
use crate::vector::FeatureVector;

/// Detects faces in an image and encodes each as a feature vector.
///
/// Implementations wrap a detector/encoder model; the core treats them as
/// opaque. An image with no faces yields an empty vector, not an error.
pub trait FeatureExtractor: Send + Sync {
    type Image: ?Sized;

    /// One vector per detected face, in detection order.
    fn extract(&self, image: &Self::Image) -> Result<Vec<FeatureVector>>;
}
