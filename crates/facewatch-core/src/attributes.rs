//! Age and gender estimation via the InsightFace `genderage` model.

use crate::alignment;
use crate::types::{BoundingBox, Gender};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const GENDERAGE_INPUT_SIZE: usize = 96;
/// The model is trained on crops 1.5× the detector box.
const GENDERAGE_CROP_SCALE: f32 = 1.5;

#[derive(Error, Debug)]
pub enum AttributeError {
    #[error("age/gender model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Raw age/gender estimate for one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgeGender {
    pub age: f32,
    pub gender: Gender,
    pub gender_probability: f32,
}

pub struct AgeGenderEstimator {
    session: Session,
}

impl AgeGenderEstimator {
    pub fn load(model_path: &Path) -> Result<Self, AttributeError> {
        if !model_path.exists() {
            return Err(AttributeError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded age/gender model");

        Ok(Self { session })
    }

    pub fn estimate(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<AgeGender, AttributeError> {
        let size = GENDERAGE_INPUT_SIZE;
        let crop =
            alignment::crop_square(frame, width, height, face, GENDERAGE_CROP_SCALE, size);
        let input =
            Array4::from_shape_fn((1, 3, size, size), |(_, _, y, x)| crop[y * size + x] as f32);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttributeError::InferenceFailed(format!("genderage output: {e}")))?;

        decode(raw)
    }
}

/// Decode `[female_logit, male_logit, age / 100]`.
fn decode(raw: &[f32]) -> Result<AgeGender, AttributeError> {
    let [female, male, age_scale] = raw else {
        return Err(AttributeError::InferenceFailed(format!(
            "expected 3 genderage outputs, got {}",
            raw.len()
        )));
    };

    // Two-way softmax
    let p_male = 1.0 / (1.0 + (female - male).exp());
    let (gender, gender_probability) = if male > female {
        (Gender::Male, p_male)
    } else {
        (Gender::Female, 1.0 - p_male)
    };

    Ok(AgeGender {
        age: (age_scale * 100.0).clamp(0.0, 120.0),
        gender,
        gender_probability,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_decode_male() {
        let out = decode(&[-1.0, 2.0, 0.34]).unwrap();
        assert_eq!(out.gender, Gender::Male);
        assert!(out.gender_probability > 0.9);
        assert_abs_diff_eq!(out.age, 34.0, epsilon = 1e-4);
    }

    #[test]
    fn test_decode_female_even_odds_floor() {
        let out = decode(&[0.5, 0.5, 0.2]).unwrap();
        assert_eq!(out.gender, Gender::Female);
        assert_abs_diff_eq!(out.gender_probability, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_decode_clamps_age() {
        assert_eq!(decode(&[0.0, 1.0, -0.3]).unwrap().age, 0.0);
    }

    #[test]
    fn test_decode_wrong_length() {
        assert!(decode(&[0.0, 1.0]).is_err());
    }
}
