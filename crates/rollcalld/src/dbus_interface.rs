use crate::engine::{EngineError, EngineHandle};
use crate::extractor;
use crate::operator::Operator;
use crate::store::{Store, TemplateUpdate};
use rollcall_core::{FeatureExtractor, Role, SessionSnapshot, User};
use std::path::PathBuf;
use std::sync::Arc;
use zbus::fdo;
use zbus::interface;

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Every method returns a JSON document. Session methods return the session
/// snapshot after the step was applied.
pub struct AttendanceService {
    pub engine: EngineHandle,
    pub store: Arc<Store>,
    pub operator: Arc<Operator>,
    pub extractor: Arc<dyn FeatureExtractor>,
}

fn failed(e: impl std::fmt::Display) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

fn to_json(value: &impl serde::Serialize) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

fn session_reply(result: Result<SessionSnapshot, EngineError>) -> fdo::Result<String> {
    match result {
        Ok(snapshot) => to_json(&snapshot),
        Err(e) => {
            tracing::debug!(error = %e, "session step refused");
            Err(failed(e))
        }
    }
}

/// Run blocking store or extractor work off the async executor.
async fn blocking<T, E>(f: impl FnOnce() -> Result<T, E> + Send + 'static) -> fdo::Result<T>
where
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(failed)?
        .map_err(failed)
}

impl AttendanceService {
    fn signed_in(&self) -> fdo::Result<User> {
        self.operator
            .current()
            .ok_or_else(|| fdo::Error::AccessDenied("not signed in".into()))
    }

    /// The signed-in user, provided they may see `subject_id`.
    async fn subject_access(&self, subject_id: &str) -> fdo::Result<User> {
        let user = self.signed_in()?;
        let store = Arc::clone(&self.store);
        let (who, id) = (user.clone(), subject_id.to_string());
        let visible = blocking(move || store.can_view_subject(&who, &id)).await?;
        if !visible {
            return Err(fdo::Error::AccessDenied(format!(
                "subject {subject_id} is not assigned to you"
            )));
        }
        Ok(user)
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Sign in with email and password, abandoning any session left by the
    /// previous operator. Returns the user.
    async fn login(&self, email: &str, password: &str) -> fdo::Result<String> {
        tracing::info!(email, "login requested");
        let (store, operator) = (Arc::clone(&self.store), Arc::clone(&self.operator));
        let email = email.to_string();
        let password = password.to_string();
        let user = blocking(move || operator.sign_in(&store, &email, &password)).await?;
        self.engine.start_over().await.map_err(failed)?;
        to_json(&user)
    }

    /// Sign out and abandon any session in progress.
    async fn logout(&self) -> fdo::Result<String> {
        let operator = Arc::clone(&self.operator);
        blocking(move || operator.sign_out()).await?;
        session_reply(self.engine.start_over().await)
    }

    /// Subjects the signed-in user may take attendance for.
    async fn list_subjects(&self) -> fdo::Result<String> {
        let user = self.signed_in()?;
        let store = Arc::clone(&self.store);
        let subjects = blocking(move || store.subjects_for(&user)).await?;
        to_json(&subjects)
    }

    /// Begin a session for `subject_id` dated today (UTC).
    async fn select_subject(&self, subject_id: &str) -> fdo::Result<String> {
        self.subject_access(subject_id).await?;
        let today = chrono::Utc::now().date_naive();
        session_reply(self.engine.select_subject(subject_id.to_string(), today).await)
    }

    async fn start_capture(&self) -> fdo::Result<String> {
        session_reply(self.engine.start_capture().await)
    }

    async fn capture(&self) -> fdo::Result<String> {
        session_reply(self.engine.capture().await)
    }

    async fn cancel_capture(&self) -> fdo::Result<String> {
        session_reply(self.engine.cancel_capture().await)
    }

    /// Detect faces in the captured image and match them against the roster.
    async fn recognize(&self) -> fdo::Result<String> {
        session_reply(self.engine.recognize().await)
    }

    async fn retake(&self) -> fdo::Result<String> {
        session_reply(self.engine.retake().await)
    }

    /// Save the reviewed attendance, marked by the signed-in user.
    async fn confirm(&self) -> fdo::Result<String> {
        let user = self.signed_in()?;
        session_reply(self.engine.confirm(user.id).await)
    }

    async fn start_over(&self) -> fdo::Result<String> {
        session_reply(self.engine.start_over().await)
    }

    /// Return daemon status: version, operator and session snapshot.
    async fn status(&self) -> fdo::Result<String> {
        let session = self.engine.status().await.map_err(failed)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "operator": self.operator.current(),
            "session": session,
        })
        .to_string())
    }

    /// Store the face template found in the image at `image_path` for a student.
    ///
    /// The first detected face is used. Admin only.
    async fn enroll_face(&self, student_id: &str, image_path: &str) -> fdo::Result<String> {
        let user = self.signed_in()?;
        if user.role != Role::Admin {
            return Err(fdo::Error::AccessDenied("only admins can enroll faces".into()));
        }
        tracing::info!(student = student_id, image = image_path, "enroll requested");

        let path = PathBuf::from(image_path);
        let image = blocking(move || extractor::load_grayscale(&path)).await?;

        let engine_extractor = Arc::clone(&self.extractor);
        let faces = blocking(move || engine_extractor.detect_faces(&image)).await?;
        let template = faces
            .into_iter()
            .next()
            .ok_or_else(|| fdo::Error::Failed("no face detected in the image".into()))?;

        let store = Arc::clone(&self.store);
        let id = student_id.to_string();
        let dimensions = template.len();
        match blocking(move || store.set_face_template(&id, &template)).await? {
            TemplateUpdate::Stored => {}
            TemplateUpdate::UnknownStudent => {
                return Err(fdo::Error::Failed(format!("unknown student: {student_id}")));
            }
            TemplateUpdate::DimensionMismatch { expected, actual } => {
                tracing::warn!(student = student_id, expected, actual, "template length mismatch");
                return Err(fdo::Error::Failed(format!(
                    "extractor produced {actual} values but stored templates have {expected}"
                )));
            }
        }
        tracing::info!(student = student_id, dimensions, "face template stored");
        Ok(serde_json::json!({ "student_id": student_id, "dimensions": dimensions }).to_string())
    }

    /// Saved attendance records for a subject, newest first.
    async fn history(&self, subject_id: &str) -> fdo::Result<String> {
        self.subject_access(subject_id).await?;
        let store = Arc::clone(&self.store);
        let id = subject_id.to_string();
        let records = blocking(move || store.attendance_history(&id)).await?;
        to_json(&records)
    }

    /// One saved record with the status of every student on it.
    async fn record_detail(&self, record_id: &str) -> fdo::Result<String> {
        self.signed_in()?;
        let store = Arc::clone(&self.store);
        let id = record_id.to_string();
        let detail = blocking(move || store.record_detail(&id))
            .await?
            .ok_or_else(|| fdo::Error::Failed(format!("unknown record: {record_id}")))?;
        self.subject_access(&detail.record.subject_id).await?;
        to_json(&detail)
    }
}
