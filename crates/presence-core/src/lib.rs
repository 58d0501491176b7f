//! presence-core: Face match and attendance ledger engine.
//!
//! Matches extracted face feature vectors against an encoding registry and
//! records each recognized identity at most once per attendance period.

pub mod error;
pub mod extract;
pub mod ledger;
pub mod matcher;
pub mod registry;
pub mod repository;
pub mod session;
pub mod types;
pub mod vector;

pub use error::{Error, Result};
pub use extract::FeatureExtractor;
pub use ledger::{AttendanceSummary, Ledger};
pub use matcher::{EuclideanMatcher, Match, MatchOutcome, Matcher, DEFAULT_THRESHOLD, TIE_EPSILON};
pub use registry::{IdentityTemplates, Registry, RegistrySnapshot};
pub use repository::{AttendanceFilter, MemoryRepository, Repository};
pub use session::{FaceOutcome, RecognitionResult, SessionCoordinator};
pub use types::{
    AttendanceRecord, AttendanceStatus, EnrolledVector, Identity, IdentityId, IdentitySummary,
    MarkOutcome, PeriodKey,
};
pub use vector::{FeatureVector, DEFAULT_DIMENSION};
