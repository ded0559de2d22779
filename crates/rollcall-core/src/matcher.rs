//! Threshold matching of detected faces against enrolled templates.
//!
//! Every (detected, template) pair is compared independently. This is not an
//! assignment: one detected face may match several students whose templates
//! are close to it, and one student may be matched by several faces. Callers
//! must not assume a 1:1 mapping between matched students and faces.

use crate::types::{EnrolledTemplate, FeatureVector};
use serde::Serialize;
use std::collections::BTreeSet;

/// Default maximum Euclidean distance for two descriptors to be the same face.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Student ids judged present for one capture. Set semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MatchResult {
    present: BTreeSet<String>,
}

impl MatchResult {
    pub fn contains(&self, student_id: &str) -> bool {
        self.present.contains(student_id)
    }

    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.present.iter().map(String::as_str)
    }

    fn insert(&mut self, student_id: &str) {
        if !self.present.contains(student_id) {
            self.present.insert(student_id.to_string());
        }
    }
}

impl<S: Into<String>> FromIterator<S> for MatchResult {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            present: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Strategy for deciding which enrolled students appear among detected faces.
pub trait Matcher {
    fn find_present(
        &self,
        detected: &[FeatureVector],
        templates: &[EnrolledTemplate],
        threshold: f32,
    ) -> MatchResult;
}

/// Independent thresholding on Euclidean distance.
///
/// A template matches when its distance to any detected face is strictly
/// below the threshold.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn find_present(
        &self,
        detected: &[FeatureVector],
        templates: &[EnrolledTemplate],
        threshold: f32,
    ) -> MatchResult {
        let mut result = MatchResult::default();

        for face in detected {
            for template in templates {
                // Panics on length mismatch; see FeatureVector::euclidean_distance.
                if face.euclidean_distance(&template.vector) < threshold {
                    result.insert(&template.student_id);
                }
            }
        }

        tracing::trace!(
            faces = detected.len(),
            templates = templates.len(),
            threshold,
            matched = result.len(),
            "matched faces against templates"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(id: &str, values: &[f32]) -> EnrolledTemplate {
        EnrolledTemplate {
            student_id: id.into(),
            vector: FeatureVector::new(values.to_vec()),
        }
    }

    fn face(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    fn ids(result: &MatchResult) -> Vec<&str> {
        result.iter().collect()
    }

    #[test]
    fn test_match_scenario_near_and_far_templates() {
        // s1 is 0.2 from the face, s2 is 0.9 away.
        let detected = vec![face(&[0.0, 0.0])];
        let templates = vec![template("s1", &[0.2, 0.0]), template("s2", &[0.0, 0.9])];

        let result = EuclideanMatcher.find_present(&detected, &templates, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(ids(&result), vec!["s1"]);
    }

    #[test]
    fn test_match_two_faces_same_student_counted_once() {
        let detected = vec![face(&[0.1, 0.0]), face(&[0.0, 0.1])];
        let templates = vec![template("s1", &[0.0, 0.0])];

        let result = EuclideanMatcher.find_present(&detected, &templates, 0.6);
        assert_eq!(result.len(), 1);
        assert!(result.contains("s1"));
    }

    #[test]
    fn test_match_one_face_may_match_several_students() {
        let detected = vec![face(&[0.0, 0.0])];
        let templates = vec![template("s1", &[0.1, 0.0]), template("s2", &[0.0, -0.1])];

        let result = EuclideanMatcher.find_present(&detected, &templates, 0.6);
        assert_eq!(ids(&result), vec!["s1", "s2"]);
    }

    #[test]
    fn test_match_distance_equal_to_threshold_is_rejected() {
        let detected = vec![face(&[0.0, 0.0])];
        let templates = vec![template("s1", &[0.5, 0.0])];

        assert!(EuclideanMatcher.find_present(&detected, &templates, 0.5).is_empty());
        assert!(EuclideanMatcher.find_present(&detected, &templates, 0.51).contains("s1"));
    }

    #[test]
    fn test_match_empty_inputs_yield_empty_result() {
        let templates = vec![template("s1", &[0.0, 0.0])];
        let detected = vec![face(&[0.0, 0.0])];

        assert!(EuclideanMatcher.find_present(&[], &templates, 0.6).is_empty());
        assert!(EuclideanMatcher.find_present(&detected, &[], 0.6).is_empty());
    }

    #[test]
    fn test_match_never_invents_ids() {
        let detected = vec![face(&[0.0, 0.0]), face(&[1.0, 1.0]), face(&[0.4, 0.4])];
        let templates = vec![
            template("a", &[0.05, 0.0]),
            template("b", &[1.0, 0.95]),
            template("c", &[5.0, 5.0]),
        ];

        let result = EuclideanMatcher.find_present(&detected, &templates, 0.6);
        for id in result.iter() {
            assert!(templates.iter().any(|t| t.student_id == id), "unexpected id {id}");
        }
        assert!(!result.contains("c"));
    }

    #[test]
    fn test_match_independent_of_iteration_order() {
        let detected = vec![face(&[0.0, 0.0]), face(&[1.0, 1.0]), face(&[0.3, 0.9])];
        let templates = vec![
            template("a", &[0.1, 0.1]),
            template("b", &[1.2, 1.0]),
            template("c", &[0.3, 0.5]),
            template("d", &[3.0, 3.0]),
        ];
        let forward = EuclideanMatcher.find_present(&detected, &templates, 0.6);

        let mut detected_rev = detected.clone();
        detected_rev.reverse();
        let mut templates_rev = templates.clone();
        templates_rev.reverse();
        templates_rev.swap(0, 2);

        let reversed = EuclideanMatcher.find_present(&detected_rev, &templates_rev, 0.6);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_match_threshold_monotonic() {
        let detected = vec![face(&[0.0, 0.0]), face(&[2.0, 0.0])];
        let templates = vec![
            template("a", &[0.1, 0.0]),
            template("b", &[0.45, 0.0]),
            template("c", &[2.0, 0.7]),
            template("d", &[1.0, 0.0]),
        ];

        let thresholds = [0.05, 0.2, 0.5, 0.6, 0.8, 1.1];
        for pair in thresholds.windows(2) {
            let strict = EuclideanMatcher.find_present(&detected, &templates, pair[0]);
            let loose = EuclideanMatcher.find_present(&detected, &templates, pair[1]);
            for id in strict.iter() {
                assert!(loose.contains(id), "{id} lost when raising {} -> {}", pair[0], pair[1]);
            }
        }
    }

    #[test]
    #[should_panic(expected = "feature vector length mismatch")]
    fn test_match_length_mismatch_fails_loudly() {
        let detected = vec![face(&[0.0, 0.0, 0.0])];
        let templates = vec![template("s1", &[0.0, 0.0])];
        EuclideanMatcher.find_present(&detected, &templates, 0.6);
    }
}
