use serde::{Deserialize, Serialize};

/// Face descriptor produced by the external extractor (typically 128 components).
///
/// Immutable once produced. Two vectors are only comparable when they have
/// the same length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two descriptors.
    ///
    /// # Panics
    ///
    /// Panics if the vectors differ in length. Descriptors from one extractor
    /// always share a length, so a mismatch means corrupted template data.
    pub fn euclidean_distance(&self, other: &FeatureVector) -> f32 {
        assert_eq!(
            self.values.len(),
            other.values.len(),
            "feature vector length mismatch"
        );
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// A student's current face template, the comparison target during matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledTemplate {
    pub student_id: String,
    pub vector: FeatureVector,
}

/// A student as stored in the record store.
///
/// `face_encoding` is `None` (or empty) for students who have never had a
/// photo enrolled; they are always marked absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub roll_number: String,
    pub email: String,
    pub department: String,
    pub face_encoding: Option<FeatureVector>,
}

impl Student {
    /// The stored template, if present and non-empty.
    pub fn template(&self) -> Option<&FeatureVector> {
        self.face_encoding.as_ref().filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub name: String,
    pub code: String,
    pub department: String,
    pub professor_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Professor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Professor => "professor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "professor" => Some(Role::Professor),
            _ => None,
        }
    }
}

/// An instructor or administrator who can mark attendance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub department: String,
}

/// A captured 8-bit grayscale image (width * height bytes, row-major).
#[derive(Clone, PartialEq)]
pub struct Image {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = FeatureVector::new(vec![0.3, -0.1, 0.8]);
        assert_eq!(a.euclidean_distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known_value() {
        let a = FeatureVector::new(vec![0.0, 0.0]);
        let b = FeatureVector::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert!((b.euclidean_distance(&a) - 5.0).abs() < 1e-6);
    }

    #[test]
    #[should_panic(expected = "feature vector length mismatch")]
    fn test_euclidean_distance_length_mismatch_panics() {
        let a = FeatureVector::new(vec![0.0, 0.0, 0.0]);
        let b = FeatureVector::new(vec![0.0, 0.0]);
        a.euclidean_distance(&b);
    }

    #[test]
    fn test_student_template_ignores_empty_encoding() {
        let mut student = Student {
            id: "s1".into(),
            name: "Ada".into(),
            roll_number: "CS-01".into(),
            email: "ada@example.edu".into(),
            department: "CS".into(),
            face_encoding: Some(FeatureVector::new(vec![])),
        };
        assert!(student.template().is_none());

        student.face_encoding = None;
        assert!(student.template().is_none());

        student.face_encoding = Some(FeatureVector::new(vec![0.1]));
        assert_eq!(student.template().map(|v| v.len()), Some(1));
    }

    #[test]
    fn test_feature_vector_serializes_as_plain_array() {
        let v = FeatureVector::new(vec![0.5, -0.25]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "[0.5,-0.25]");
        let back: FeatureVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_role_round_trip_names() {
        assert_eq!(Role::parse(Role::Admin.as_str()), Some(Role::Admin));
        assert_eq!(Role::parse("professor"), Some(Role::Professor));
        assert_eq!(Role::parse("student"), None);
    }
}
