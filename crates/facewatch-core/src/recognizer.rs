//! Face descriptor extraction via ONNX Runtime.
//!
//! Runs a ResNet-style recognition network on an eye-aligned 150×150 chip and
//! returns a 128-dimensional descriptor. Descriptors of the same person sit
//! within roughly 0.6 Euclidean distance of each other.

use crate::alignment;
use crate::types::{BoundingBox, Descriptor, DESCRIPTOR_DIM};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const RECOGNITION_CHIP_SIZE: usize = 150;
const RECOGNITION_SCALE: f32 = 1.0 / 255.0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognition model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; the detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// 128-d face descriptor extractor.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the recognition ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded recognition model");

        Ok(Self { session })
    }

    /// Extract the descriptor of one detected face from a grayscale frame.
    pub fn extract(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Descriptor, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let chip =
            alignment::align_chip(frame, width, height, face, landmarks, RECOGNITION_CHIP_SIZE);
        let input = preprocess(&chip);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("descriptor extraction: {e}")))?;

        if raw.iter().any(|v| !v.is_finite()) {
            return Err(RecognizerError::InferenceFailed(
                "descriptor contains non-finite values".into(),
            ));
        }

        Descriptor::new(raw.to_vec()).map_err(|_| {
            RecognizerError::InferenceFailed(format!(
                "expected {DESCRIPTOR_DIM}-dim descriptor, got {}",
                raw.len()
            ))
        })
    }
}

/// Gray chip → NCHW tensor scaled to [0, 1], replicated across three channels.
fn preprocess(chip: &[u8]) -> Array4<f32> {
    let size = RECOGNITION_CHIP_SIZE;
    Array4::from_shape_fn((1, 3, size, size), |(_, _, y, x)| {
        chip.get(y * size + x).copied().unwrap_or(0) as f32 * RECOGNITION_SCALE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_shape_and_scale() {
        let chip = vec![255u8; RECOGNITION_CHIP_SIZE * RECOGNITION_CHIP_SIZE];
        let tensor = preprocess(&chip);
        assert_eq!(tensor.shape(), &[1, 3, RECOGNITION_CHIP_SIZE, RECOGNITION_CHIP_SIZE]);
        assert!(tensor.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_preprocess_channels_identical() {
        let chip: Vec<u8> = (0..RECOGNITION_CHIP_SIZE * RECOGNITION_CHIP_SIZE)
            .map(|i| (i % 251) as u8)
            .collect();
        let tensor = preprocess(&chip);
        for (y, x) in [(0, 0), (17, 42), (149, 149)] {
            assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
            assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
        }
    }

    #[test]
    fn test_missing_model_is_reported() {
        let err = FaceRecognizer::load(Path::new("/nonexistent/face_recognition_128.onnx"))
            .err()
            .unwrap();
        assert!(matches!(err, RecognizerError::ModelNotFound(_)));
    }
}
