use chrono::NaiveDate;
use rollcall_core::aggregate;
use rollcall_core::collab::{
    AttendanceStore, CaptureError, ExtractError, FeatureExtractor, ImageCapture, RosterSource,
    StoreError,
};
use rollcall_core::session::{CaptureJob, MatchJob, PersistJob};
use rollcall_core::{
    CaptureSession, FeatureVector, Generation, Image, SessionError, SessionSnapshot,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("unknown subject: {0}")]
    UnknownSubject(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

type Reply = oneshot::Sender<Result<SessionSnapshot, EngineError>>;

/// Messages handled by the engine thread: requests from D-Bus handlers plus
/// outcomes posted back by background jobs and the reset timer.
enum EngineRequest {
    SelectSubject {
        subject_id: String,
        date: NaiveDate,
        reply: Reply,
    },
    StartCapture {
        reply: Reply,
    },
    Capture {
        reply: Reply,
    },
    CancelCapture {
        reply: Reply,
    },
    Recognize {
        reply: Reply,
    },
    Retake {
        reply: Reply,
    },
    Confirm {
        marked_by: String,
        reply: Reply,
    },
    StartOver {
        reply: Reply,
    },
    Status {
        reply: Reply,
    },
    CaptureDone {
        generation: Generation,
        outcome: Result<Image, CaptureError>,
    },
    MatchingDone {
        generation: Generation,
        outcome: Result<Vec<FeatureVector>, ExtractError>,
    },
    PersistDone {
        generation: Generation,
        outcome: Result<String, StoreError>,
    },
    ResetElapsed {
        generation: Generation,
    },
}

/// External systems the session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub camera: Arc<dyn ImageCapture>,
    pub extractor: Arc<dyn FeatureExtractor>,
    pub roster: Arc<dyn RosterSource>,
    pub store: Arc<dyn AttendanceStore>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request(
        &self,
        build: impl FnOnce(Reply) -> EngineRequest,
    ) -> Result<SessionSnapshot, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Fix the subject and date and snapshot the enrolled roster.
    pub async fn select_subject(
        &self,
        subject_id: String,
        date: NaiveDate,
    ) -> Result<SessionSnapshot, EngineError> {
        self.request(|reply| EngineRequest::SelectSubject {
            subject_id,
            date,
            reply,
        })
        .await
    }

    pub async fn start_capture(&self) -> Result<SessionSnapshot, EngineError> {
        self.request(|reply| EngineRequest::StartCapture { reply }).await
    }

    /// Grab a frame from the open stream. Resolves once the frame is in, or
    /// with [`SessionError::Superseded`] if capture is cancelled first.
    pub async fn capture(&self) -> Result<SessionSnapshot, EngineError> {
        self.request(|reply| EngineRequest::Capture { reply }).await
    }

    pub async fn cancel_capture(&self) -> Result<SessionSnapshot, EngineError> {
        self.request(|reply| EngineRequest::CancelCapture { reply }).await
    }

    /// Run feature extraction and matching on the captured image.
    ///
    /// Resolves once the result is applied, or with
    /// [`SessionError::Superseded`] if the session is started over first.
    pub async fn recognize(&self) -> Result<SessionSnapshot, EngineError> {
        self.request(|reply| EngineRequest::Recognize { reply }).await
    }

    pub async fn retake(&self) -> Result<SessionSnapshot, EngineError> {
        self.request(|reply| EngineRequest::Retake { reply }).await
    }

    /// Persist the reviewed decision. Resolves once the store answers.
    pub async fn confirm(&self, marked_by: String) -> Result<SessionSnapshot, EngineError> {
        self.request(|reply| EngineRequest::Confirm { marked_by, reply })
            .await
    }

    pub async fn start_over(&self) -> Result<SessionSnapshot, EngineError> {
        self.request(|reply| EngineRequest::StartOver { reply }).await
    }

    pub async fn status(&self) -> Result<SessionSnapshot, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Spawn the session engine on a dedicated OS thread.
///
/// Must be called from within a Tokio runtime: frame grabs, extraction and
/// persistence run on its blocking pool and the post-save reset timer on its scheduler.
pub fn spawn_engine(
    collaborators: Collaborators,
    match_threshold: f32,
    reset_delay: Duration,
) -> std::io::Result<EngineHandle> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    let mut engine = Engine {
        session: CaptureSession::new(match_threshold),
        collaborators,
        rt: Handle::current(),
        outbox: tx.downgrade(),
        reset_delay,
        reset_timer: None,
        pending_capture: None,
        pending_recognize: None,
        pending_confirm: None,
        notice: None,
    };

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(
                threshold = match_threshold,
                reset_delay_ms = reset_delay.as_millis() as u64,
                "engine thread started"
            );
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            engine.shutdown();
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

struct Engine {
    session: CaptureSession,
    collaborators: Collaborators,
    rt: Handle,
    /// Weak so the loop ends once every [`EngineHandle`] is dropped.
    outbox: mpsc::WeakSender<EngineRequest>,
    reset_delay: Duration,
    reset_timer: Option<JoinHandle<()>>,
    pending_capture: Option<Reply>,
    pending_recognize: Option<Reply>,
    pending_confirm: Option<Reply>,
    /// Last recoverable condition, shown to the client until the next success.
    notice: Option<String>,
}

impl Engine {
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::SelectSubject {
                subject_id,
                date,
                reply,
            } => {
                let result = self.select_subject(&subject_id, date);
                self.answer(reply, result);
            }
            EngineRequest::StartCapture { reply } => {
                let result = self
                    .session
                    .start_capture(self.collaborators.camera.as_ref())
                    .map_err(EngineError::from);
                self.answer(reply, result);
            }
            EngineRequest::Capture { reply } => match self.session.begin_capture() {
                Ok(job) => {
                    self.pending_capture = Some(reply);
                    self.run_capture(job);
                }
                Err(e) => self.answer(reply, Err(e.into())),
            },
            EngineRequest::CancelCapture { reply } => {
                let result = self
                    .session
                    .cancel_capture(self.collaborators.camera.as_ref())
                    .map_err(EngineError::from);
                if result.is_ok() {
                    self.supersede_pending();
                }
                self.answer(reply, result);
            }
            EngineRequest::Recognize { reply } => match self.session.begin_matching() {
                Ok(job) => {
                    self.pending_recognize = Some(reply);
                    self.run_extraction(job);
                }
                Err(e) => self.answer(reply, Err(e.into())),
            },
            EngineRequest::Retake { reply } => {
                let result = self
                    .session
                    .retake(self.collaborators.camera.as_ref())
                    .map_err(EngineError::from);
                self.answer(reply, result);
            }
            EngineRequest::Confirm { marked_by, reply } => match self.session.confirm(&marked_by) {
                Ok(job) => {
                    self.pending_confirm = Some(reply);
                    self.run_persistence(job);
                }
                Err(e) => self.answer(reply, Err(e.into())),
            },
            EngineRequest::StartOver { reply } => {
                self.start_over();
                self.answer(reply, Ok(()));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            EngineRequest::CaptureDone {
                generation,
                outcome,
            } => {
                let camera = Arc::clone(&self.collaborators.camera);
                match self
                    .session
                    .capture_finished(generation, outcome, camera.as_ref())
                {
                    Err(SessionError::Superseded) => {}
                    result => {
                        if let Some(reply) = self.pending_capture.take() {
                            self.answer(reply, result.map_err(EngineError::from));
                        } else {
                            self.record(&result.map_err(EngineError::from));
                        }
                    }
                }
            }
            EngineRequest::MatchingDone {
                generation,
                outcome,
            } => match self.session.matching_finished(generation, outcome) {
                Err(SessionError::Superseded) => {}
                result => {
                    if let Some(reply) = self.pending_recognize.take() {
                        self.answer(reply, result.map_err(EngineError::from));
                    } else {
                        self.record(&result.map_err(EngineError::from));
                    }
                }
            },
            EngineRequest::PersistDone {
                generation,
                outcome,
            } => match self.session.persistence_finished(generation, outcome) {
                Err(SessionError::Superseded) => {}
                result => {
                    let result = match result {
                        Ok(timer) => {
                            tracing::info!(
                                record = self.session.record_id().unwrap_or_default(),
                                "attendance saved"
                            );
                            self.schedule_reset(timer);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    };
                    if let Some(reply) = self.pending_confirm.take() {
                        self.answer(reply, result.map_err(EngineError::from));
                    } else {
                        self.record(&result.map_err(EngineError::from));
                    }
                }
            },
            EngineRequest::ResetElapsed { generation } => {
                if self.session.reset_elapsed(generation) {
                    self.reset_timer = None;
                    self.notice = None;
                    tracing::info!("session reset after save");
                }
            }
        }
    }

    fn select_subject(&mut self, subject_id: &str, date: NaiveDate) -> Result<(), EngineError> {
        let subject = self
            .collaborators
            .roster
            .subject(subject_id)?
            .ok_or_else(|| EngineError::UnknownSubject(subject_id.to_string()))?;
        let students = self.collaborators.roster.enrolled_students(subject_id)?;
        self.session.select_subject(subject, date, students)?;
        Ok(())
    }

    fn start_over(&mut self) {
        self.session.start_over(self.collaborators.camera.as_ref());
        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
        self.supersede_pending();
        self.notice = None;
        tracing::info!(generation = self.session.generation().value(), "session started over");
    }

    /// Answers every deferred caller with [`SessionError::Superseded`].
    fn supersede_pending(&mut self) {
        let pending = [
            self.pending_capture.take(),
            self.pending_recognize.take(),
            self.pending_confirm.take(),
        ];
        for reply in pending.into_iter().flatten() {
            let _ = reply.send(Err(SessionError::Superseded.into()));
        }
    }

    fn run_capture(&self, job: CaptureJob) {
        let Some(outbox) = self.outbox.upgrade() else {
            return;
        };
        let camera = Arc::clone(&self.collaborators.camera);
        self.rt.spawn_blocking(move || {
            let outcome = camera.capture(job.stream);
            let _ = outbox.blocking_send(EngineRequest::CaptureDone {
                generation: job.generation,
                outcome,
            });
        });
    }

    fn run_extraction(&self, job: MatchJob) {
        let Some(outbox) = self.outbox.upgrade() else {
            return;
        };
        let extractor = Arc::clone(&self.collaborators.extractor);
        self.rt.spawn_blocking(move || {
            let outcome = extractor.detect_faces(&job.image);
            let _ = outbox.blocking_send(EngineRequest::MatchingDone {
                generation: job.generation,
                outcome,
            });
        });
    }

    fn run_persistence(&self, job: PersistJob) {
        let Some(outbox) = self.outbox.upgrade() else {
            return;
        };
        let store = Arc::clone(&self.collaborators.store);
        self.rt.spawn_blocking(move || {
            let outcome = aggregate::submit(store.as_ref(), &job.request);
            let _ = outbox.blocking_send(EngineRequest::PersistDone {
                generation: job.generation,
                outcome,
            });
        });
    }

    fn schedule_reset(&mut self, generation: Generation) {
        let Some(outbox) = self.outbox.upgrade() else {
            return;
        };
        let delay = self.reset_delay;
        if let Some(previous) = self.reset_timer.take() {
            previous.abort();
        }
        self.reset_timer = Some(self.rt.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = outbox.send(EngineRequest::ResetElapsed { generation }).await;
        }));
    }

    fn record(&mut self, result: &Result<(), EngineError>) {
        match result {
            Ok(()) => self.notice = None,
            Err(e) => self.notice = Some(e.to_string()),
        }
    }

    fn answer(&mut self, reply: Reply, result: Result<(), EngineError>) {
        self.record(&result);
        let _ = reply.send(result.map(|()| self.snapshot()));
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = self.session.snapshot();
        snapshot.notice = self.notice.clone();
        snapshot
    }

    fn shutdown(&mut self) {
        if let Some(stream) = self.session.active_stream() {
            self.collaborators.camera.stop(stream);
        }
        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
    }
}
