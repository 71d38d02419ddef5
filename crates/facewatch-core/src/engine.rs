//! The inference seam: whatever turns pixels into face detections.
//!
//! `OnnxEngine` chains SCRFD detection, descriptor extraction and age/gender
//! estimation. Tests and other backends implement [`InferenceEngine`] directly.

use crate::attributes::{AgeGenderEstimator, AttributeError};
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{FaceDetection, SingleFace};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const RECOGNITION_MODEL: &str = "face_recognition_128.onnx";
pub const GENDERAGE_MODEL: &str = "genderage.onnx";

/// Loading is all-or-nothing: any bundle failing fails the whole set.
#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("face detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("face recognition: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("age/gender: {0}")]
    AgeGender(#[from] AttributeError),
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("detection: {0}")]
    Detector(#[from] DetectorError),
    #[error("descriptor: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("age/gender: {0}")]
    AgeGender(#[from] AttributeError),
    #[error("{0}")]
    Other(String),
}

/// Produces face detections from grayscale pixels.
pub trait InferenceEngine: Send {
    /// Every face in the frame with descriptor and age/gender, in detector order.
    fn detect_all(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceDetection>, InferenceError>;

    /// The most prominent face only, with its descriptor.
    fn detect_single(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<SingleFace>, InferenceError> {
        let faces = self.detect_all(frame, width, height)?;
        Ok(faces
            .into_iter()
            .max_by(|a, b| a.bbox.prominence_cmp(&b.bbox))
            .map(|f| SingleFace {
                bbox: f.bbox,
                descriptor: f.descriptor,
            }))
    }
}

/// Locations of the model bundles.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognition: PathBuf,
    pub genderage: PathBuf,
}

impl ModelPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_MODEL),
            recognition: dir.join(RECOGNITION_MODEL),
            genderage: dir.join(GENDERAGE_MODEL),
        }
    }
}

pub struct OnnxEngine {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    genderage: AgeGenderEstimator,
}

impl OnnxEngine {
    pub fn load(paths: &ModelPaths) -> Result<Self, ModelLoadError> {
        let detector = FaceDetector::load(&paths.detector)?;
        let recognizer = FaceRecognizer::load(&paths.recognition)?;
        let genderage = AgeGenderEstimator::load(&paths.genderage)?;
        tracing::info!("all face models loaded");
        Ok(Self {
            detector,
            recognizer,
            genderage,
        })
    }
}

impl InferenceEngine for OnnxEngine {
    fn detect_all(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceDetection>, InferenceError> {
        let boxes = self.detector.detect(frame, width, height)?;
        let mut faces = Vec::with_capacity(boxes.len());

        for bbox in boxes {
            let descriptor = self.recognizer.extract(frame, width, height, &bbox)?;
            let estimate = self.genderage.estimate(frame, width, height, &bbox)?;
            faces.push(FaceDetection {
                bbox,
                descriptor,
                age: estimate.age,
                gender: estimate.gender,
                gender_probability: estimate.gender_probability,
            });
        }

        Ok(faces)
    }

    /// Skips age/gender estimation; enrollment only needs the descriptor.
    fn detect_single(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<SingleFace>, InferenceError> {
        let boxes = self.detector.detect(frame, width, height)?;
        let Some(bbox) = boxes.into_iter().max_by(|a, b| a.prominence_cmp(b)) else {
            return Ok(None);
        };
        let descriptor = self.recognizer.extract(frame, width, height, &bbox)?;
        Ok(Some(SingleFace { bbox, descriptor }))
    }
}
