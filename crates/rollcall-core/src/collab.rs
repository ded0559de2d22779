//! External collaborators of the capture workflow.
//!
//! All calls are blocking. The daemon runs extraction and persistence off
//! the session thread so that a "start over" can supersede them.

use crate::aggregate::AttendanceEntry;
use crate::types::{FeatureVector, Image, Student, Subject};
use chrono::NaiveDate;
use thiserror::Error;

/// Opaque handle to an active capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("no camera device: {0}")]
    NoDevice(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("unknown capture stream {0:?}")]
    UnknownStream(StreamHandle),
}

/// Camera access.
pub trait ImageCapture: Send + Sync {
    fn start(&self) -> Result<StreamHandle, CaptureError>;
    fn stop(&self, stream: StreamHandle);
    fn capture(&self, stream: StreamHandle) -> Result<Image, CaptureError>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("face recognition models are not loaded yet")]
    NotReady,
    #[error("feature extraction failed: {0}")]
    Failed(String),
}

/// Face detection plus descriptor extraction. Idempotent for a given image.
pub trait FeatureExtractor: Send + Sync {
    fn detect_faces(&self, image: &Image) -> Result<Vec<FeatureVector>, ExtractError>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("attendance record not created: {0}")]
    Record(String),
    #[error("attendance entries not saved: {0}")]
    Entries(String),
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Source of subjects and their enrolled students (with templates embedded).
pub trait RosterSource: Send + Sync {
    fn subject(&self, subject_id: &str) -> Result<Option<Subject>, StoreError>;
    fn enrolled_students(&self, subject_id: &str) -> Result<Vec<Student>, StoreError>;
}

/// Persistence of confirmed attendance.
pub trait AttendanceStore: Send + Sync {
    fn create_attendance_record(
        &self,
        subject_id: &str,
        date: NaiveDate,
        marked_by: &str,
    ) -> Result<String, StoreError>;

    fn create_attendance_entries(
        &self,
        record_id: &str,
        entries: &[AttendanceEntry],
    ) -> Result<(), StoreError>;
}
