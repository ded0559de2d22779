//! Enrollment gate: which of a subject's students can be recognized.

use crate::types::{EnrolledTemplate, Student};
use std::collections::HashSet;

/// Templates of every roster member whose stored feature data is present and non-empty.
///
/// A student listed twice contributes one template (the first listing wins).
pub fn eligible_templates(roster: &[Student]) -> Vec<EnrolledTemplate> {
    let mut seen = HashSet::new();
    roster
        .iter()
        .filter(|s| seen.insert(s.id.as_str()))
        .filter_map(|s| {
            s.template().map(|vector| EnrolledTemplate {
                student_id: s.id.clone(),
                vector: vector.clone(),
            })
        })
        .collect()
}

/// Capture may only start when at least one student can be recognized.
pub fn can_start_capture(roster: &[Student]) -> bool {
    roster.iter().any(|s| s.template().is_some())
}

/// Roster snapshot taken when a subject is selected.
///
/// Immutable for the rest of the session; enrollment changes made elsewhere
/// after selection are not seen by this session.
#[derive(Debug, Clone)]
pub struct Roster {
    students: Vec<Student>,
    templates: Vec<EnrolledTemplate>,
}

impl Roster {
    pub fn snapshot(students: Vec<Student>) -> Self {
        let mut seen = HashSet::new();
        let students: Vec<Student> = students
            .into_iter()
            .filter(|s| seen.insert(s.id.clone()))
            .collect();
        let templates = eligible_templates(&students);
        Self {
            students,
            templates,
        }
    }

    pub fn students(&self) -> &[Student] {
        &self.students
    }

    pub fn templates(&self) -> &[EnrolledTemplate] {
        &self.templates
    }

    pub fn can_start_capture(&self) -> bool {
        !self.templates.is_empty()
    }

    pub fn has_template(&self, student_id: &str) -> bool {
        self.templates.iter().any(|t| t.student_id == student_id)
    }
}
