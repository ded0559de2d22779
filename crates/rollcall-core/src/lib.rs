//! rollcall-core: attendance from a single classroom photo.
//!
//! Matches face feature vectors detected in a captured image against the
//! templates of a subject's enrolled students, and sequences one
//! attendance-taking interaction through an explicit state machine.
//! Image capture, feature extraction and storage are collaborators
//! defined in [`collab`]; nothing in this crate performs I/O.

pub mod aggregate;
pub mod collab;
pub mod enrollment;
pub mod matcher;
pub mod session;
pub mod types;

pub use aggregate::{AttendanceDecision, AttendanceEntry, AttendanceStatus, AttendanceSummary};
pub use collab::{AttendanceStore, FeatureExtractor, ImageCapture, RosterSource};
pub use enrollment::Roster;
pub use matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use session::{CaptureSession, Generation, SessionError, SessionPhase, SessionSnapshot};
pub use types::{EnrolledTemplate, FeatureVector, Image, Role, Student, Subject, User};
