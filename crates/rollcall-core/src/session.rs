//! Capture session state machine.
//!
//! One session covers one subject on one date:
//!
//! ```text
//! Idle -> SubjectSelected -> Capturing -> Captured -> Matching -> Reviewed -> Confirmed -> Persisted
//! ```
//!
//! Each state carries exactly the data it needs, so there is no image before
//! `Captured` and no decision before `Reviewed`. Opening and closing the
//! camera happen inline. Frame grabs, extraction and persistence are handed
//! out as jobs tagged with the
//! [`Generation`] they were started under; every transition advances the
//! generation, so an outcome arriving after "start over" no longer matches
//! and is dropped.

use crate::aggregate::{
    self, AttendanceDecision, AttendanceStatus, AttendanceSummary, PersistRequest,
};
use crate::collab::{CaptureError, ExtractError, ImageCapture, StoreError, StreamHandle};
use crate::enrollment::Roster;
use crate::matcher::{EuclideanMatcher, MatchResult, Matcher};
use crate::types::{FeatureVector, Image, Student, Subject};
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Monotonic token identifying the session state an async job was started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    pub fn value(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    SubjectSelected,
    Capturing,
    Captured,
    Matching,
    Reviewed,
    Confirmed,
    Persisted,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::SubjectSelected => "subject_selected",
            SessionPhase::Capturing => "capturing",
            SessionPhase::Captured => "captured",
            SessionPhase::Matching => "matching",
            SessionPhase::Reviewed => "reviewed",
            SessionPhase::Confirmed => "confirmed",
            SessionPhase::Persisted => "persisted",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("cannot {event} while {phase}")]
    InvalidTransition {
        phase: SessionPhase,
        event: &'static str,
    },
    #[error("no enrolled students in this subject have a face template")]
    NoEligibleTemplates,
    #[error("camera unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("no faces detected in the captured image")]
    NoFacesDetected,
    #[error("face recognition models are still loading")]
    ModelLoading,
    #[error("feature extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("saving attendance failed: {0}")]
    PersistenceFailed(String),
    #[error("session was started over before the result arrived")]
    Superseded,
}

impl From<CaptureError> for SessionError {
    fn from(e: CaptureError) -> Self {
        SessionError::CaptureUnavailable(e.to_string())
    }
}

impl From<ExtractError> for SessionError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::NotReady => SessionError::ModelLoading,
            ExtractError::Failed(msg) => SessionError::ExtractionFailed(msg),
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::PersistenceFailed(e.to_string())
    }
}

/// Subject, date and roster snapshot fixed at selection time.
#[derive(Debug, Clone)]
pub struct Selection {
    subject: Subject,
    date: NaiveDate,
    roster: Roster,
}

impl Selection {
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }
}

/// Outcome of matching, shown to the user before confirmation.
#[derive(Debug, Clone)]
pub struct Review {
    pub faces_detected: usize,
    pub matched: MatchResult,
    pub decision: AttendanceDecision,
    pub summary: AttendanceSummary,
}

/// A frame grab on an open stream.
#[derive(Debug, Clone, Copy)]
pub struct CaptureJob {
    pub generation: Generation,
    pub stream: StreamHandle,
}

/// Extraction work for the captured image.
#[derive(Debug, Clone)]
pub struct MatchJob {
    pub generation: Generation,
    pub image: Arc<Image>,
}

/// Persistence work for a confirmed decision.
#[derive(Debug, Clone)]
pub struct PersistJob {
    pub generation: Generation,
    pub request: PersistRequest,
}

enum State {
    Idle,
    SubjectSelected {
        selection: Selection,
    },
    Capturing {
        selection: Selection,
        stream: StreamHandle,
        /// A [`CaptureJob`] for this stream is in flight.
        grabbing: bool,
    },
    Captured {
        selection: Selection,
        image: Arc<Image>,
    },
    Matching {
        selection: Selection,
        image: Arc<Image>,
    },
    Reviewed {
        selection: Selection,
        image: Arc<Image>,
        review: Review,
    },
    Confirmed {
        selection: Selection,
        image: Arc<Image>,
        review: Review,
    },
    Persisted {
        selection: Selection,
        review: Review,
        record_id: String,
    },
}

impl State {
    fn phase(&self) -> SessionPhase {
        match self {
            State::Idle => SessionPhase::Idle,
            State::SubjectSelected { .. } => SessionPhase::SubjectSelected,
            State::Capturing { .. } => SessionPhase::Capturing,
            State::Captured { .. } => SessionPhase::Captured,
            State::Matching { .. } => SessionPhase::Matching,
            State::Reviewed { .. } => SessionPhase::Reviewed,
            State::Confirmed { .. } => SessionPhase::Confirmed,
            State::Persisted { .. } => SessionPhase::Persisted,
        }
    }

    fn selection(&self) -> Option<&Selection> {
        match self {
            State::Idle => None,
            State::SubjectSelected { selection }
            | State::Capturing { selection, .. }
            | State::Captured { selection, .. }
            | State::Matching { selection, .. }
            | State::Reviewed { selection, .. }
            | State::Confirmed { selection, .. }
            | State::Persisted { selection, .. } => Some(selection),
        }
    }

    fn review(&self) -> Option<&Review> {
        match self {
            State::Reviewed { review, .. }
            | State::Confirmed { review, .. }
            | State::Persisted { review, .. } => Some(review),
            _ => None,
        }
    }
}

/// One attendance-taking interaction.
pub struct CaptureSession {
    state: State,
    generation: Generation,
    threshold: f32,
}

impl CaptureSession {
    pub fn new(threshold: f32) -> Self {
        Self {
            state: State::Idle,
            generation: Generation(0),
            threshold,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.state.selection()
    }

    pub fn review(&self) -> Option<&Review> {
        self.state.review()
    }

    pub fn record_id(&self) -> Option<&str> {
        match &self.state {
            State::Persisted { record_id, .. } => Some(record_id),
            _ => None,
        }
    }

    /// Idle -> SubjectSelected. Takes the roster snapshot for the session.
    pub fn select_subject(
        &mut self,
        subject: Subject,
        date: NaiveDate,
        students: Vec<Student>,
    ) -> Result<(), SessionError> {
        match self.take() {
            State::Idle => {
                let roster = Roster::snapshot(students);
                tracing::info!(
                    subject = %subject.id,
                    %date,
                    students = roster.students().len(),
                    templates = roster.templates().len(),
                    "subject selected"
                );
                self.enter(
                    SessionPhase::Idle,
                    State::SubjectSelected {
                        selection: Selection {
                            subject,
                            date,
                            roster,
                        },
                    },
                );
                Ok(())
            }
            other => Err(self.reject(other, "select a subject")),
        }
    }

    /// SubjectSelected -> Capturing, if anyone on the roster can be recognized
    /// and the camera opens. Otherwise the session stays in SubjectSelected.
    pub fn start_capture(&mut self, camera: &dyn ImageCapture) -> Result<(), SessionError> {
        match self.take() {
            State::SubjectSelected { selection } => {
                if !selection.roster.can_start_capture() {
                    self.state = State::SubjectSelected { selection };
                    return Err(SessionError::NoEligibleTemplates);
                }
                match camera.start() {
                    Ok(stream) => {
                        self.enter(
                            SessionPhase::SubjectSelected,
                            State::Capturing {
                                selection,
                                stream,
                                grabbing: false,
                            },
                        );
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "camera start failed");
                        self.state = State::SubjectSelected { selection };
                        Err(e.into())
                    }
                }
            }
            other => Err(self.reject(other, "start capture")),
        }
    }

    /// Capturing -> Captured, grabbing the frame inline.
    ///
    /// Equivalent to [`begin_capture`](Self::begin_capture), `camera.capture`
    /// and [`capture_finished`](Self::capture_finished) in one call.
    pub fn capture_image(&mut self, camera: &dyn ImageCapture) -> Result<(), SessionError> {
        let job = self.begin_capture()?;
        let outcome = camera.capture(job.stream);
        self.capture_finished(job.generation, outcome, camera)
    }

    /// Hands out the frame grab for the open stream. The session stays in
    /// Capturing (so it can still be cancelled) until the outcome is applied.
    pub fn begin_capture(&mut self) -> Result<CaptureJob, SessionError> {
        match &mut self.state {
            State::Capturing {
                stream, grabbing, ..
            } if !*grabbing => {
                *grabbing = true;
                Ok(CaptureJob {
                    generation: self.generation,
                    stream: *stream,
                })
            }
            _ => {
                let state = self.take();
                Err(self.reject(state, "capture an image"))
            }
        }
    }

    /// Applies a frame grab outcome. The stream is stopped whether or not the
    /// frame was read; a failed read returns to SubjectSelected. An outcome
    /// from an older generation is dropped with [`SessionError::Superseded`].
    pub fn capture_finished(
        &mut self,
        generation: Generation,
        outcome: Result<Image, CaptureError>,
        camera: &dyn ImageCapture,
    ) -> Result<(), SessionError> {
        match self.take() {
            State::Capturing {
                selection,
                stream,
                grabbing: true,
            } if generation == self.generation => {
                camera.stop(stream);
                match outcome {
                    Ok(image) => {
                        tracing::debug!(
                            width = image.width,
                            height = image.height,
                            "image captured"
                        );
                        self.enter(
                            SessionPhase::Capturing,
                            State::Captured {
                                selection,
                                image: Arc::new(image),
                            },
                        );
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "frame capture failed");
                        self.enter(SessionPhase::Capturing, State::SubjectSelected { selection });
                        Err(e.into())
                    }
                }
            }
            other => {
                self.state = other;
                tracing::debug!(
                    result = generation.value(),
                    current = self.generation.value(),
                    "dropping superseded frame"
                );
                Err(SessionError::Superseded)
            }
        }
    }

    /// Capturing -> SubjectSelected without taking a photo.
    pub fn cancel_capture(&mut self, camera: &dyn ImageCapture) -> Result<(), SessionError> {
        match self.take() {
            State::Capturing {
                selection, stream, ..
            } => {
                camera.stop(stream);
                self.enter(SessionPhase::Capturing, State::SubjectSelected { selection });
                Ok(())
            }
            other => Err(self.reject(other, "cancel capture")),
        }
    }

    /// Captured -> Matching. The returned job must be run through the
    /// feature extractor and its outcome passed to [`matching_finished`](Self::matching_finished).
    pub fn begin_matching(&mut self) -> Result<MatchJob, SessionError> {
        match self.take() {
            State::Captured { selection, image } => {
                let job_image = Arc::clone(&image);
                self.enter(SessionPhase::Captured, State::Matching { selection, image });
                Ok(MatchJob {
                    generation: self.generation,
                    image: job_image,
                })
            }
            other => Err(self.reject(other, "begin matching")),
        }
    }

    /// Applies an extraction outcome.
    ///
    /// Matching -> Reviewed on success. No faces, a model still loading, or an
    /// extractor failure return to Captured so the user can retry or retake.
    /// An outcome from an older generation is dropped with [`SessionError::Superseded`].
    pub fn matching_finished(
        &mut self,
        generation: Generation,
        outcome: Result<Vec<FeatureVector>, ExtractError>,
    ) -> Result<(), SessionError> {
        match self.take() {
            State::Matching { selection, image } if generation == self.generation => {
                self.apply_extraction(selection, image, outcome)
            }
            other => {
                self.state = other;
                tracing::debug!(
                    result = generation.value(),
                    current = self.generation.value(),
                    "dropping superseded extraction result"
                );
                Err(SessionError::Superseded)
            }
        }
    }

    fn apply_extraction(
        &mut self,
        selection: Selection,
        image: Arc<Image>,
        outcome: Result<Vec<FeatureVector>, ExtractError>,
    ) -> Result<(), SessionError> {
        match outcome {
            Ok(faces) if faces.is_empty() => {
                self.enter(SessionPhase::Matching, State::Captured { selection, image });
                Err(SessionError::NoFacesDetected)
            }
            Ok(faces) => {
                let matched = EuclideanMatcher.find_present(
                    &faces,
                    selection.roster.templates(),
                    self.threshold,
                );
                let decision = aggregate::decide(selection.roster.students(), &matched);
                let summary = aggregate::summarize(&decision);
                tracing::info!(
                    faces = faces.len(),
                    present = summary.present_count,
                    total = summary.total_count,
                    "matching complete"
                );
                let review = Review {
                    faces_detected: faces.len(),
                    matched,
                    decision,
                    summary,
                };
                self.enter(
                    SessionPhase::Matching,
                    State::Reviewed {
                        selection,
                        image,
                        review,
                    },
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "feature extraction failed");
                self.enter(SessionPhase::Matching, State::Captured { selection, image });
                Err(e.into())
            }
        }
    }

    /// Captured | Reviewed -> Capturing. Discards the image and any decision.
    pub fn retake(&mut self, camera: &dyn ImageCapture) -> Result<(), SessionError> {
        let from = self.phase();
        match self.take() {
            State::Captured { selection, .. } | State::Reviewed { selection, .. } => {
                match camera.start() {
                    Ok(stream) => {
                        self.enter(
                            from,
                            State::Capturing {
                                selection,
                                stream,
                                grabbing: false,
                            },
                        );
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "camera restart failed");
                        self.enter(from, State::SubjectSelected { selection });
                        Err(e.into())
                    }
                }
            }
            other => Err(self.reject(other, "retake")),
        }
    }

    /// Reviewed -> Confirmed. The returned job is the only way attendance
    /// reaches the store.
    pub fn confirm(&mut self, marked_by: &str) -> Result<PersistJob, SessionError> {
        match self.take() {
            State::Reviewed {
                selection,
                image,
                review,
            } => {
                let request = PersistRequest {
                    subject_id: selection.subject.id.clone(),
                    date: selection.date,
                    marked_by: marked_by.to_string(),
                    entries: aggregate::to_persistable_entries(&review.decision),
                };
                self.enter(
                    SessionPhase::Reviewed,
                    State::Confirmed {
                        selection,
                        image,
                        review,
                    },
                );
                Ok(PersistJob {
                    generation: self.generation,
                    request,
                })
            }
            other => Err(self.reject(other, "confirm")),
        }
    }

    /// Confirmed -> Persisted on success, returning the generation the reset
    /// timer must present. A failure returns to Reviewed with the decision
    /// intact so confirm can be retried without matching again.
    pub fn persistence_finished(
        &mut self,
        generation: Generation,
        outcome: Result<String, StoreError>,
    ) -> Result<Generation, SessionError> {
        match self.take() {
            State::Confirmed {
                selection,
                image,
                review,
            } if generation == self.generation => match outcome {
                Ok(record_id) => {
                    self.enter(
                        SessionPhase::Confirmed,
                        State::Persisted {
                            selection,
                            review,
                            record_id,
                        },
                    );
                    Ok(self.generation)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "attendance not saved");
                    self.enter(
                        SessionPhase::Confirmed,
                        State::Reviewed {
                            selection,
                            image,
                            review,
                        },
                    );
                    Err(e.into())
                }
            },
            other => {
                self.state = other;
                tracing::debug!(
                    result = generation.value(),
                    current = self.generation.value(),
                    "dropping superseded persistence result"
                );
                Err(SessionError::Superseded)
            }
        }
    }

    /// Persisted -> Idle when the reset timer for this generation elapses.
    pub fn reset_elapsed(&mut self, generation: Generation) -> bool {
        if generation != self.generation || self.phase() != SessionPhase::Persisted {
            return false;
        }
        self.enter(SessionPhase::Persisted, State::Idle);
        true
    }

    /// Any -> Idle. Stops an active capture stream and supersedes in-flight jobs.
    pub fn start_over(&mut self, camera: &dyn ImageCapture) {
        let previous = self.take();
        let from = previous.phase();
        if let State::Capturing { stream, .. } = previous {
            camera.stop(stream);
        }
        self.enter(from, State::Idle);
    }

    pub fn active_stream(&self) -> Option<StreamHandle> {
        match &self.state {
            State::Capturing { stream, .. } => Some(*stream),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let selection = self.selection();
        let review = self.review();

        let students = selection
            .map(|sel| {
                sel.roster
                    .students()
                    .iter()
                    .map(|s| StudentRow {
                        id: s.id.clone(),
                        name: s.name.clone(),
                        roll_number: s.roll_number.clone(),
                        has_template: sel.roster.has_template(&s.id),
                        status: review.and_then(|r| r.decision.status_of(&s.id)),
                    })
                    .collect()
            })
            .unwrap_or_default();

        SessionSnapshot {
            phase: self.phase(),
            generation: self.generation,
            subject: selection.map(|s| s.subject.clone()),
            date: selection.map(|s| s.date),
            can_start_capture: selection.map(|s| s.roster.can_start_capture()),
            students,
            faces_detected: review.map(|r| r.faces_detected),
            summary: review.map(|r| r.summary),
            record_id: self.record_id().map(str::to_string),
            notice: None,
        }
    }

    fn take(&mut self) -> State {
        std::mem::replace(&mut self.state, State::Idle)
    }

    fn enter(&mut self, from: SessionPhase, state: State) {
        self.generation = self.generation.next();
        self.state = state;
        tracing::debug!(
            from = %from,
            to = %self.state.phase(),
            generation = self.generation.value(),
            "session transition"
        );
    }

    /// Restores `state` untouched and reports the attempted event as invalid.
    fn reject(&mut self, state: State, event: &'static str) -> SessionError {
        let phase = state.phase();
        self.state = state;
        SessionError::InvalidTransition { phase, event }
    }
}

/// Serializable view of a session for clients.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub generation: Generation,
    pub subject: Option<Subject>,
    pub date: Option<NaiveDate>,
    pub can_start_capture: Option<bool>,
    pub students: Vec<StudentRow>,
    pub faces_detected: Option<usize>,
    pub summary: Option<AttendanceSummary>,
    pub record_id: Option<String>,
    /// Most recent recoverable condition, if any.
    pub notice: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentRow {
    pub id: String,
    pub name: String,
    pub roll_number: String,
    pub has_template: bool,
    pub status: Option<AttendanceStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCamera {
        fail_start: Mutex<Option<CaptureError>>,
        fail_capture: Mutex<Option<CaptureError>>,
        next: AtomicU64,
        open: Mutex<Vec<StreamHandle>>,
    }

    impl ImageCapture for FakeCamera {
        fn start(&self) -> Result<StreamHandle, CaptureError> {
            if let Some(e) = self.fail_start.lock().unwrap().clone() {
                return Err(e);
            }
            let stream = StreamHandle(self.next.fetch_add(1, Ordering::SeqCst));
            self.open.lock().unwrap().push(stream);
            Ok(stream)
        }

        fn stop(&self, stream: StreamHandle) {
            self.open.lock().unwrap().retain(|s| *s != stream);
        }

        fn capture(&self, _stream: StreamHandle) -> Result<Image, CaptureError> {
            if let Some(e) = self.fail_capture.lock().unwrap().clone() {
                return Err(e);
            }
            Ok(Image {
                pixels: vec![128; 16],
                width: 4,
                height: 4,
            })
        }
    }

    impl FakeCamera {
        fn open_streams(&self) -> usize {
            self.open.lock().unwrap().len()
        }
    }

    fn subject() -> Subject {
        Subject {
            id: "math101".into(),
            name: "Calculus".into(),
            code: "MATH101".into(),
            department: "Mathematics".into(),
            professor_id: "prof-1".into(),
        }
    }

    fn student(id: &str, encoding: Option<Vec<f32>>) -> Student {
        Student {
            id: id.into(),
            name: format!("Student {id}"),
            roll_number: format!("R-{id}"),
            email: format!("{id}@example.edu"),
            department: "Mathematics".into(),
            face_encoding: encoding.map(FeatureVector::new),
        }
    }

    /// s1 sits 0.2 from the photographed face, s2 0.9 away, s3 has no template.
    fn roster() -> Vec<Student> {
        vec![
            student("s1", Some(vec![0.2, 0.0])),
            student("s2", Some(vec![0.0, 0.9])),
            student("s3", None),
        ]
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 2).unwrap()
    }

    fn face() -> FeatureVector {
        FeatureVector::new(vec![0.0, 0.0])
    }

    /// Drives a fresh session to Matching and returns the pending job.
    fn to_matching(session: &mut CaptureSession, camera: &FakeCamera) -> MatchJob {
        session.select_subject(subject(), date(), roster()).unwrap();
        session.start_capture(camera).unwrap();
        session.capture_image(camera).unwrap();
        session.begin_matching().unwrap()
    }

    fn to_reviewed(session: &mut CaptureSession, camera: &FakeCamera) {
        let job = to_matching(session, camera);
        session.matching_finished(job.generation, Ok(vec![face()])).unwrap();
    }

    #[test]
    fn test_full_flow_reaches_persisted() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        assert_eq!(session.phase(), SessionPhase::Idle);

        session.select_subject(subject(), date(), roster()).unwrap();
        assert_eq!(session.phase(), SessionPhase::SubjectSelected);

        session.start_capture(&camera).unwrap();
        assert_eq!(session.phase(), SessionPhase::Capturing);
        assert_eq!(camera.open_streams(), 1);

        session.capture_image(&camera).unwrap();
        assert_eq!(session.phase(), SessionPhase::Captured);
        assert_eq!(camera.open_streams(), 0, "stream must be stopped after capture");

        let job = session.begin_matching().unwrap();
        assert_eq!(session.phase(), SessionPhase::Matching);
        assert_eq!(job.image.width, 4);

        session.matching_finished(job.generation, Ok(vec![face()])).unwrap();
        assert_eq!(session.phase(), SessionPhase::Reviewed);

        let review = session.review().unwrap();
        assert_eq!(review.decision.status_of("s1"), Some(AttendanceStatus::Present));
        assert_eq!(review.decision.status_of("s2"), Some(AttendanceStatus::Absent));
        assert_eq!(review.decision.status_of("s3"), Some(AttendanceStatus::Absent));
        assert_eq!(review.summary.present_percentage, 33);

        let persist = session.confirm("prof-1").unwrap();
        assert_eq!(session.phase(), SessionPhase::Confirmed);
        assert_eq!(persist.request.entries.len(), 3);
        assert_eq!(persist.request.subject_id, "math101");
        assert_eq!(persist.request.marked_by, "prof-1");
        assert_eq!(persist.request.date, date());

        let timer = session
            .persistence_finished(persist.generation, Ok("rec-9".into()))
            .unwrap();
        assert_eq!(session.phase(), SessionPhase::Persisted);
        assert_eq!(session.record_id(), Some("rec-9"));

        assert!(session.reset_elapsed(timer));
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.selection().is_none());
    }

    #[test]
    fn test_capture_refused_without_templates() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        session
            .select_subject(
                subject(),
                date(),
                vec![student("s3", None), student("s4", Some(vec![]))],
            )
            .unwrap();
        let generation = session.generation();

        assert_eq!(session.start_capture(&camera), Err(SessionError::NoEligibleTemplates));
        assert_eq!(session.phase(), SessionPhase::SubjectSelected);
        assert_eq!(session.generation(), generation);
        assert_eq!(camera.open_streams(), 0);

        // With capture blocked, confirm is unreachable.
        assert!(matches!(
            session.confirm("prof-1"),
            Err(SessionError::InvalidTransition { phase: SessionPhase::SubjectSelected, .. })
        ));
    }

    #[test]
    fn test_camera_unavailable_stays_subject_selected() {
        let camera = FakeCamera::default();
        *camera.fail_start.lock().unwrap() =
            Some(CaptureError::PermissionDenied("/dev/video0".into()));
        let mut session = CaptureSession::new(0.6);
        session.select_subject(subject(), date(), roster()).unwrap();

        let err = session.start_capture(&camera).unwrap_err();
        assert!(matches!(err, SessionError::CaptureUnavailable(_)));
        assert_eq!(session.phase(), SessionPhase::SubjectSelected);

        *camera.fail_start.lock().unwrap() = None;
        session.start_capture(&camera).unwrap();
        assert_eq!(session.phase(), SessionPhase::Capturing);
    }

    #[test]
    fn test_frame_read_failure_releases_stream() {
        let camera = FakeCamera::default();
        *camera.fail_capture.lock().unwrap() = Some(CaptureError::CaptureFailed("EIO".into()));
        let mut session = CaptureSession::new(0.6);
        session.select_subject(subject(), date(), roster()).unwrap();
        session.start_capture(&camera).unwrap();

        assert!(session.capture_image(&camera).is_err());
        assert_eq!(session.phase(), SessionPhase::SubjectSelected);
        assert_eq!(camera.open_streams(), 0);
    }

    fn frame() -> Image {
        Image {
            pixels: vec![90; 4],
            width: 2,
            height: 2,
        }
    }

    #[test]
    fn test_capture_job_applied_stops_stream() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        session.select_subject(subject(), date(), roster()).unwrap();
        session.start_capture(&camera).unwrap();

        let job = session.begin_capture().unwrap();
        assert_eq!(Some(job.stream), session.active_stream());
        assert_eq!(session.phase(), SessionPhase::Capturing);
        assert!(
            session.begin_capture().is_err(),
            "only one grab per stream may be in flight"
        );

        session.capture_finished(job.generation, Ok(frame()), &camera).unwrap();
        assert_eq!(session.phase(), SessionPhase::Captured);
        assert_eq!(camera.open_streams(), 0);
    }

    #[test]
    fn test_late_frame_after_cancel_is_dropped() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        session.select_subject(subject(), date(), roster()).unwrap();
        session.start_capture(&camera).unwrap();
        let job = session.begin_capture().unwrap();

        // Cancelled while the grab is still running.
        session.cancel_capture(&camera).unwrap();
        assert_eq!(camera.open_streams(), 0);

        assert_eq!(
            session.capture_finished(job.generation, Ok(frame()), &camera),
            Err(SessionError::Superseded)
        );
        assert_eq!(session.phase(), SessionPhase::SubjectSelected);

        // A fresh stream after start over ignores the old grab too.
        session.start_capture(&camera).unwrap();
        assert_eq!(
            session.capture_finished(job.generation, Ok(frame()), &camera),
            Err(SessionError::Superseded)
        );
        assert_eq!(session.phase(), SessionPhase::Capturing);
        assert_eq!(camera.open_streams(), 1);
    }

    #[test]
    fn test_cancel_capture_returns_to_subject_selected() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        session.select_subject(subject(), date(), roster()).unwrap();
        session.start_capture(&camera).unwrap();

        session.cancel_capture(&camera).unwrap();
        assert_eq!(session.phase(), SessionPhase::SubjectSelected);
        assert_eq!(camera.open_streams(), 0);
    }

    #[test]
    fn test_no_faces_returns_to_captured() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        let job = to_matching(&mut session, &camera);

        assert_eq!(
            session.matching_finished(job.generation, Ok(vec![])),
            Err(SessionError::NoFacesDetected)
        );
        assert_eq!(session.phase(), SessionPhase::Captured);

        // Matching can be retried on the same image, or the photo retaken.
        let job = session.begin_matching().unwrap();
        session.matching_finished(job.generation, Ok(vec![face()])).unwrap();
        assert_eq!(session.phase(), SessionPhase::Reviewed);
    }

    #[test]
    fn test_model_not_ready_surfaces_loading() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        let job = to_matching(&mut session, &camera);

        assert_eq!(
            session.matching_finished(job.generation, Err(ExtractError::NotReady)),
            Err(SessionError::ModelLoading)
        );
        assert_eq!(session.phase(), SessionPhase::Captured);
    }

    #[test]
    fn test_extraction_failure_returns_to_captured() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        let job = to_matching(&mut session, &camera);

        let err = session
            .matching_finished(job.generation, Err(ExtractError::Failed("bad png".into())))
            .unwrap_err();
        assert_eq!(err, SessionError::ExtractionFailed("bad png".into()));
        assert_eq!(session.phase(), SessionPhase::Captured);
        session.retake(&camera).unwrap();
        assert_eq!(session.phase(), SessionPhase::Capturing);
    }

    #[test]
    fn test_start_over_discards_late_match_result() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        let job = to_matching(&mut session, &camera);

        session.start_over(&camera);
        assert_eq!(session.phase(), SessionPhase::Idle);

        assert_eq!(
            session.matching_finished(job.generation, Ok(vec![face()])),
            Err(SessionError::Superseded)
        );
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.review().is_none());
    }

    #[test]
    fn test_late_match_result_from_previous_session_is_dropped() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        let stale = to_matching(&mut session, &camera);
        session.start_over(&camera);

        // A new session reaches Matching again before the old result lands.
        let fresh = to_matching(&mut session, &camera);
        assert_ne!(stale.generation, fresh.generation);
        assert_eq!(
            session.matching_finished(stale.generation, Ok(vec![face()])),
            Err(SessionError::Superseded)
        );
        assert_eq!(session.phase(), SessionPhase::Matching);

        session.matching_finished(fresh.generation, Ok(vec![face()])).unwrap();
        assert_eq!(session.phase(), SessionPhase::Reviewed);
    }

    #[test]
    fn test_persistence_failure_allows_retry_without_rematching() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        to_reviewed(&mut session, &camera);

        let job = session.confirm("prof-1").unwrap();
        let err = session
            .persistence_finished(job.generation, Err(StoreError::Entries("constraint".into())))
            .unwrap_err();
        assert!(matches!(err, SessionError::PersistenceFailed(_)));
        assert_eq!(session.phase(), SessionPhase::Reviewed);
        assert_eq!(session.review().unwrap().summary.present_count, 1);

        let retry = session.confirm("prof-1").unwrap();
        assert_eq!(retry.request.entries, job.request.entries);
        session
            .persistence_finished(retry.generation, Ok("rec-2".into()))
            .unwrap();
        assert_eq!(session.phase(), SessionPhase::Persisted);
    }

    #[test]
    fn test_start_over_discards_late_persistence_result() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        to_reviewed(&mut session, &camera);
        let job = session.confirm("prof-1").unwrap();

        session.start_over(&camera);
        assert_eq!(
            session.persistence_finished(job.generation, Ok("rec-3".into())),
            Err(SessionError::Superseded)
        );
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_retake_discards_review() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        to_reviewed(&mut session, &camera);

        session.retake(&camera).unwrap();
        assert_eq!(session.phase(), SessionPhase::Capturing);
        assert!(session.review().is_none());
        assert_eq!(camera.open_streams(), 1);

        // Roster snapshot survives the retake.
        assert_eq!(session.selection().unwrap().roster().students().len(), 3);
    }

    #[test]
    fn test_start_over_stops_active_stream() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        session.select_subject(subject(), date(), roster()).unwrap();
        session.start_capture(&camera).unwrap();
        assert!(session.active_stream().is_some());

        session.start_over(&camera);
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert_eq!(camera.open_streams(), 0);
    }

    #[test]
    fn test_reset_timer_from_old_generation_ignored() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        to_reviewed(&mut session, &camera);
        let job = session.confirm("prof-1").unwrap();
        let timer = session.persistence_finished(job.generation, Ok("rec".into())).unwrap();

        session.start_over(&camera);
        session.select_subject(subject(), date(), roster()).unwrap();

        assert!(!session.reset_elapsed(timer));
        assert_eq!(session.phase(), SessionPhase::SubjectSelected);
    }

    #[test]
    fn test_no_matching_before_capture() {
        let mut session = CaptureSession::new(0.6);
        assert!(session.begin_matching().is_err());
        session.select_subject(subject(), date(), roster()).unwrap();
        assert_eq!(
            session.begin_matching().unwrap_err(),
            SessionError::InvalidTransition {
                phase: SessionPhase::SubjectSelected,
                event: "begin matching",
            }
        );
        assert_eq!(session.phase(), SessionPhase::SubjectSelected);
    }

    #[test]
    fn test_select_subject_twice_rejected() {
        let mut session = CaptureSession::new(0.6);
        session.select_subject(subject(), date(), roster()).unwrap();
        assert!(session.select_subject(subject(), date(), vec![]).is_err());
        assert_eq!(session.selection().unwrap().roster().students().len(), 3);
    }

    #[test]
    fn test_snapshot_reports_rows_and_summary() {
        let camera = FakeCamera::default();
        let mut session = CaptureSession::new(0.6);
        to_reviewed(&mut session, &camera);

        let snap = session.snapshot();
        assert_eq!(snap.phase, SessionPhase::Reviewed);
        assert_eq!(snap.students.len(), 3);
        assert!(snap.students[0].has_template);
        assert!(!snap.students[2].has_template);
        assert_eq!(snap.students[0].status, Some(AttendanceStatus::Present));
        assert_eq!(snap.faces_detected, Some(1));

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["phase"], "reviewed");
        assert_eq!(json["summary"]["present_percentage"], 33);
        assert_eq!(json["students"][1]["status"], "absent");
    }
}
