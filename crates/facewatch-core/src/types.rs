use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of every face descriptor produced by the recognition model.
pub const DESCRIPTOR_DIM: usize = 128;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Ordering used to pick "the" face out of several: detector confidence
    /// first, box area as tie-breaker.
    pub fn prominence_cmp(&self, other: &BoundingBox) -> std::cmp::Ordering {
        self.confidence
            .partial_cmp(&other.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                self.area()
                    .partial_cmp(&other.area())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor must have {DESCRIPTOR_DIM} values, got {0}")]
    WrongLength(usize),
}

/// Fixed-length face descriptor. Construction rejects any other length, so a
/// `Descriptor` is never partially populated.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.len() != DESCRIPTOR_DIM {
            return Err(DescriptorError::WrongLength(values.len()));
        }
        Ok(Self { values })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean distance between two descriptors.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

/// A stabilized age/gender reading. Age and gender only ever travel together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    /// Estimated age in years.
    pub age: f32,
    pub gender: Gender,
}

/// One face found in one frame. Produced fresh by every inference call.
#[derive(Debug, Clone)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
    pub age: f32,
    pub gender: Gender,
    /// Probability of `gender`, in [0.5, 1].
    pub gender_probability: f32,
}

impl FaceDetection {
    pub fn attributes(&self) -> Attributes {
        Attributes {
            age: self.age,
            gender: self.gender,
        }
    }
}

/// The single face found in a still image during enrollment.
#[derive(Debug, Clone)]
pub struct SingleFace {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
}

/// The one reference face live detections are matched against.
#[derive(Debug, Clone)]
pub struct EnrolledIdentity {
    pub label: String,
    pub descriptor: Descriptor,
    pub enrolled_at: DateTime<Utc>,
}

impl EnrolledIdentity {
    pub fn new(label: impl Into<String>, descriptor: Descriptor) -> Self {
        Self {
            label: label.into(),
            descriptor,
            enrolled_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn descriptor_with(first: f32) -> Descriptor {
        let mut values = vec![0.0; DESCRIPTOR_DIM];
        values[0] = first;
        Descriptor::new(values).unwrap()
    }

    fn bbox(w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x: 0.0, y: 0.0, width: w, height: h, confidence: conf, landmarks: None,
        }
    }

    #[test]
    fn test_descriptor_rejects_wrong_length() {
        assert_eq!(
            Descriptor::new(vec![0.0; 127]).unwrap_err(),
            DescriptorError::WrongLength(127)
        );
        assert!(Descriptor::try_from(vec![0.0; 512]).is_err());
        assert!(Descriptor::new(vec![0.0; DESCRIPTOR_DIM]).is_ok());
    }

    #[test]
    fn test_euclidean_distance() {
        let a = descriptor_with(0.0);
        let b = descriptor_with(3.0);
        assert_relative_eq!(a.euclidean_distance(&b), 3.0);
        assert_relative_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_prominence_prefers_confidence_then_area() {
        let small_confident = bbox(10.0, 10.0, 0.9);
        let large_unsure = bbox(100.0, 100.0, 0.6);
        assert!(small_confident.prominence_cmp(&large_unsure).is_gt());

        let tie_large = bbox(50.0, 50.0, 0.9);
        assert!(tie_large.prominence_cmp(&small_confident).is_gt());
    }

    #[test]
    fn test_gender_serializes_lowercase() {
        let json = serde_json::to_string(&Gender::Female).unwrap();
        assert_eq!(json, "\"female\"");
    }
}
