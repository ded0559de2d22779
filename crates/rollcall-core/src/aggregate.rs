//! Turns a match result into a per-student attendance decision.

use crate::collab::{AttendanceStore, StoreError};
use crate::matcher::MatchResult;
use crate::types::Student;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            _ => None,
        }
    }
}

/// One persisted row: a roster member and their status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEntry {
    pub student_id: String,
    pub status: AttendanceStatus,
}

/// Status of every roster member, in roster order. Each member appears exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AttendanceDecision {
    entries: Vec<AttendanceEntry>,
}

impl AttendanceDecision {
    pub fn status_of(&self, student_id: &str) -> Option<AttendanceStatus> {
        self.entries
            .iter()
            .find(|e| e.student_id == student_id)
            .map(|e| e.status)
    }

    pub fn entries(&self) -> &[AttendanceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttendanceSummary {
    pub present_count: usize,
    pub absent_count: usize,
    pub total_count: usize,
    /// Rounded to the nearest whole percent; 0 for an empty roster.
    pub present_percentage: u32,
}

/// Present iff the student's id is in `matched`. Ids outside the roster are ignored.
pub fn decide(roster: &[Student], matched: &MatchResult) -> AttendanceDecision {
    let mut seen = HashSet::new();
    let entries = roster
        .iter()
        .filter(|s| seen.insert(s.id.as_str()))
        .map(|s| AttendanceEntry {
            student_id: s.id.clone(),
            status: if matched.contains(&s.id) {
                AttendanceStatus::Present
            } else {
                AttendanceStatus::Absent
            },
        })
        .collect();
    AttendanceDecision { entries }
}

pub fn summarize(decision: &AttendanceDecision) -> AttendanceSummary {
    let total_count = decision.len();
    let present_count = decision
        .entries
        .iter()
        .filter(|e| e.status == AttendanceStatus::Present)
        .count();
    let present_percentage = if total_count == 0 {
        0
    } else {
        (present_count as f64 / total_count as f64 * 100.0).round() as u32
    };

    AttendanceSummary {
        present_count,
        absent_count: total_count - present_count,
        total_count,
        present_percentage,
    }
}

/// Flattens the decision into the rows the store expects, one per roster member.
pub fn to_persistable_entries(decision: &AttendanceDecision) -> Vec<AttendanceEntry> {
    decision.entries.clone()
}

/// Everything needed to save one confirmed capture.
#[derive(Debug, Clone)]
pub struct PersistRequest {
    pub subject_id: String,
    pub date: NaiveDate,
    pub marked_by: String,
    pub entries: Vec<AttendanceEntry>,
}

/// Creates the record, then its entries. Either failing fails the whole
/// submission; a record created before an entry failure is left in place.
pub fn submit(store: &dyn AttendanceStore, request: &PersistRequest) -> Result<String, StoreError> {
    let record_id =
        store.create_attendance_record(&request.subject_id, request.date, &request.marked_by)?;

    if let Err(e) = store.create_attendance_entries(&record_id, &request.entries) {
        tracing::warn!(
            record = %record_id,
            error = %e,
            "attendance record created but entries failed"
        );
        return Err(e);
    }

    tracing::info!(
        record = %record_id,
        subject = %request.subject_id,
        date = %request.date,
        entries = request.entries.len(),
        "attendance saved"
    );
    Ok(record_id)
}
