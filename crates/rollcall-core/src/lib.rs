//! rollcall-core — Face-recognition attendance engine.
//!
//! Trains an LBPH classifier from labelled face samples, classifies faces
//! found by an SCRFD detector, and runs recognition sessions that mark each
//! recognised student present at most once.

pub mod artifacts;
pub mod classifier;
pub mod detector;
pub mod directory;
pub mod enroll;
pub mod labels;
pub mod lbph;
pub mod marker;
pub mod session;
pub mod training;
pub mod types;

pub use artifacts::{ArtifactError, ModelArtifacts};
pub use classifier::{accept, ClassifierError, FaceRegion, FrameClassifier, RegionOutcome};
pub use detector::{DetectorConfig, DetectorError, FaceDetector, ScrfdDetector};
pub use directory::{AttendanceLedger, MemoryStore, StoreError, StudentDirectory};
pub use enroll::{capture_samples, CapturePlan, EnrollError, EnrollReport};
pub use labels::{LabelMapping, LabelStore, LabelStoreError, Resolved};
pub use lbph::{LbphError, LbphModel, LbphParams};
pub use marker::{AttendanceMarker, MarkerError};
pub use session::{
    Notification, NotificationReceiver, RecognitionSession, SessionConfig, SessionError,
    SessionSnapshot, SessionTarget,
};
pub use training::{
    scan_sample_dir, Sample, SampleGroup, Trainer, TrainingError, TrainingOutcome, TrainingReport,
};
pub use types::{
    AttendanceRecord, BoundingBox, ClassSlotId, FacultyId, Prediction, SessionId, SessionSummary,
    StudentId, StudentRecord,
};
