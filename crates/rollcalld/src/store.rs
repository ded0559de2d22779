//! SQLite record store: roster source and attendance persistence.

use chrono::{NaiveDate, Utc};
use rollcall_core::collab::{AttendanceStore, RosterSource, StoreError};
use rollcall_core::{
    AttendanceEntry, AttendanceStatus, FeatureVector, Role, Student, Subject, User,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA_VERSION: i32 = 1;

/// One saved attendance record with its tallies.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub id: String,
    pub subject_id: String,
    pub date: String,
    pub marked_by: String,
    pub created_at: String,
    pub present_count: u32,
    pub total_count: u32,
}

/// A saved record with one row per roster student.
#[derive(Debug, Clone, Serialize)]
pub struct RecordDetail {
    #[serde(flatten)]
    pub record: RecordSummary,
    pub entries: Vec<RecordEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordEntry {
    pub student_id: String,
    pub name: String,
    pub roll_number: String,
    pub status: AttendanceStatus,
}

/// Outcome of [`Store::set_face_template`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateUpdate {
    Stored,
    UnknownStudent,
    /// Other students' templates have `expected` values; the new one has `actual`.
    DimensionMismatch { expected: usize, actual: usize },
}

const RECORD_SUMMARY_SELECT: &str =
    "SELECT r.id, r.subject_id, r.date, r.marked_by, r.created_at,
            COALESCE(SUM(CASE WHEN e.status = 'present' THEN 1 ELSE 0 END), 0),
            COUNT(e.id)
     FROM attendance_records r
     LEFT JOIN attendance_entries e ON e.attendance_record_id = r.id";

pub struct Store {
    conn: Mutex<Connection>,
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(Self::init(conn)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(mut conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON").map_err(backend)?;
        migrate(&mut conn).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subjects the user may take attendance for: all of them for admins,
    /// only their own for professors.
    pub fn subjects_for(&self, user: &User) -> Result<Vec<Subject>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, code, department, professor_id FROM subjects
                 WHERE ?1 = 'admin' OR professor_id = ?2
                 ORDER BY code",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![user.role.as_str(), user.id], row_to_subject)
            .map_err(backend)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }

    /// Whether the user may see `subject_id`: admins see every subject,
    /// professors only their own. Unknown subjects are never visible.
    pub fn can_view_subject(&self, user: &User, subject_id: &str) -> Result<bool, StoreError> {
        self.conn()
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM subjects
                               WHERE id = ?1 AND (?2 = 'admin' OR professor_id = ?3))",
                params![subject_id, user.role.as_str(), user.id],
                |row| row.get(0),
            )
            .map_err(backend)
    }

    /// User with the given email plus their stored password hash.
    pub fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<(User, Option<String>)>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, name, email, role, department, password_hash FROM users WHERE email = ?1",
                params![email],
                |row| {
                    let role: String = row.get(3)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        role,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(backend)?;

        let Some((id, name, email, role, department, password_hash)) = row else {
            return Ok(None);
        };
        let role = Role::parse(&role)
            .ok_or_else(|| StoreError::Backend(format!("user {id} has unknown role {role:?}")))?;
        Ok(Some((
            User {
                id,
                name,
                email,
                role,
                department,
            },
            password_hash,
        )))
    }

    /// Replace a student's face template.
    ///
    /// The new template must have as many values as the templates already
    /// stored for other students, otherwise matching would compare vectors
    /// of different lengths.
    pub fn set_face_template(
        &self,
        student_id: &str,
        vector: &FeatureVector,
    ) -> Result<TemplateUpdate, StoreError> {
        let encoded = serde_json::to_string(vector)
            .map_err(|e| StoreError::Backend(format!("encode template: {e}")))?;
        let conn = self.conn();

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM students WHERE id = ?1)",
                params![student_id],
                |row| row.get(0),
            )
            .map_err(backend)?;
        if !exists {
            return Ok(TemplateUpdate::UnknownStudent);
        }

        if let Some(expected) = stored_dimension(&conn, student_id)? {
            if expected != vector.len() {
                return Ok(TemplateUpdate::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        conn.execute(
            "UPDATE students SET face_encoding = ?1 WHERE id = ?2",
            params![encoded, student_id],
        )
        .map_err(backend)?;
        Ok(TemplateUpdate::Stored)
    }

    /// Saved records for a subject, newest first.
    pub fn attendance_history(&self, subject_id: &str) -> Result<Vec<RecordSummary>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{RECORD_SUMMARY_SELECT}
                 WHERE r.subject_id = ?1
                 GROUP BY r.id
                 ORDER BY r.created_at DESC, r.rowid DESC"
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![subject_id], row_to_summary)
            .map_err(backend)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }

    /// One record with every entry joined to its student, ordered by roll number.
    pub fn record_detail(&self, record_id: &str) -> Result<Option<RecordDetail>, StoreError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("{RECORD_SUMMARY_SELECT} WHERE r.id = ?1 GROUP BY r.id"),
                params![record_id],
                row_to_summary,
            )
            .optional()
            .map_err(backend)?;
        let Some(record) = record else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT s.id, s.name, s.roll_number, e.status
                 FROM attendance_entries e
                 JOIN students s ON s.id = e.student_id
                 WHERE e.attendance_record_id = ?1
                 ORDER BY s.roll_number, s.name",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![record_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(backend)?;

        let mut entries = Vec::new();
        for row in rows {
            let (student_id, name, roll_number, status) = row.map_err(backend)?;
            let status = AttendanceStatus::parse(&status).ok_or_else(|| {
                StoreError::Backend(format!("entry for {student_id} has status {status:?}"))
            })?;
            entries.push(RecordEntry {
                student_id,
                name,
                roll_number,
                status,
            });
        }
        Ok(Some(RecordDetail { record, entries }))
    }
}

impl RosterSource for Store {
    fn subject(&self, subject_id: &str) -> Result<Option<Subject>, StoreError> {
        self.conn()
            .query_row(
                "SELECT id, name, code, department, professor_id FROM subjects WHERE id = ?1",
                params![subject_id],
                row_to_subject,
            )
            .optional()
            .map_err(backend)
    }

    fn enrolled_students(&self, subject_id: &str) -> Result<Vec<Student>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT s.id, s.name, s.roll_number, s.email, s.department, s.face_encoding
                 FROM subject_enrollments e
                 JOIN students s ON s.id = e.student_id
                 WHERE e.subject_id = ?1
                 ORDER BY s.roll_number, s.name",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![subject_id], |row| {
                let encoding: Option<String> = row.get(5)?;
                Ok((
                    Student {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        roll_number: row.get(2)?,
                        email: row.get(3)?,
                        department: row.get(4)?,
                        face_encoding: None,
                    },
                    encoding,
                ))
            })
            .map_err(backend)?;

        let mut students = Vec::new();
        for row in rows {
            let (mut student, encoding) = row.map_err(backend)?;
            student.face_encoding = encoding.and_then(|json| decode_template(&student.id, &json));
            students.push(student);
        }
        Ok(students)
    }
}

impl AttendanceStore for Store {
    fn create_attendance_record(
        &self,
        subject_id: &str,
        date: NaiveDate,
        marked_by: &str,
    ) -> Result<String, StoreError> {
        let conn = self.conn();
        let date = date.to_string();

        let existing: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM attendance_records WHERE subject_id = ?1 AND date = ?2",
                params![subject_id, date],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Record(e.to_string()))?;
        if existing > 0 {
            tracing::warn!(
                subject = subject_id,
                %date,
                existing,
                "subject already has attendance for this date; adding another record"
            );
        }

        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO attendance_records (id, subject_id, date, marked_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, subject_id, date, marked_by, Utc::now().to_rfc3339()],
        )
        .map_err(|e| StoreError::Record(e.to_string()))?;
        Ok(id)
    }

    fn create_attendance_entries(
        &self,
        record_id: &str,
        entries: &[AttendanceEntry],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let failed = |e: rusqlite::Error| StoreError::Entries(e.to_string());

        let tx = conn.transaction().map_err(failed)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO attendance_entries (id, attendance_record_id, student_id, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(failed)?;
            let now = Utc::now().to_rfc3339();
            for entry in entries {
                stmt.execute(params![
                    uuid::Uuid::new_v4().to_string(),
                    record_id,
                    entry.student_id,
                    entry.status.as_str(),
                    now,
                ])
                .map_err(failed)?;
            }
        }
        tx.commit().map_err(failed)
    }
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordSummary> {
    Ok(RecordSummary {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        date: row.get(2)?,
        marked_by: row.get(3)?,
        created_at: row.get(4)?,
        present_count: row.get(5)?,
        total_count: row.get(6)?,
    })
}

/// Length of the first well-formed template stored for any other student.
fn stored_dimension(conn: &Connection, student_id: &str) -> Result<Option<usize>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT face_encoding FROM students
             WHERE id != ?1 AND face_encoding IS NOT NULL
             ORDER BY id",
        )
        .map_err(backend)?;
    let rows = stmt
        .query_map(params![student_id], |row| row.get::<_, String>(0))
        .map_err(backend)?;
    for json in rows {
        let json = json.map_err(backend)?;
        if let Ok(template) = serde_json::from_str::<FeatureVector>(&json) {
            if !template.is_empty() {
                return Ok(Some(template.len()));
            }
        }
    }
    Ok(None)
}

fn row_to_subject(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subject> {
    Ok(Subject {
        id: row.get(0)?,
        name: row.get(1)?,
        code: row.get(2)?,
        department: row.get(3)?,
        professor_id: row.get(4)?,
    })
}

/// Malformed template data counts as "no template".
fn decode_template(student_id: &str, json: &str) -> Option<FeatureVector> {
    match serde_json::from_str::<FeatureVector>(json) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(student = student_id, error = %e, "ignoring malformed face template");
            None
        }
    }
}

fn migrate(conn: &mut Connection) -> rusqlite::Result<()> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }
    let tx = conn.transaction()?;
    tx.execute_batch(include_str!("schema_v1.sql"))?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    tracing::info!(from = version, to = SCHEMA_VERSION, "database schema migrated");
    Ok(())
}
