//! facewatch-core: face detection, description and matching.
//!
//! SCRFD finds faces, a 128-d recognition network describes them, the
//! InsightFace genderage model estimates age and gender, and a Euclidean
//! matcher compares descriptors against the single enrolled identity.
//! All models run on CPU through ONNX Runtime.

pub mod alignment;
pub mod attributes;
pub mod detector;
pub mod engine;
pub mod matcher;
pub mod overlay;
pub mod recognizer;
pub mod types;

pub use engine::{InferenceEngine, InferenceError, ModelLoadError, ModelPaths, OnnxEngine};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use overlay::{Overlay, RasterSurface, Surface};
pub use types::{
    Attributes, BoundingBox, Descriptor, EnrolledIdentity, FaceDetection, Gender, SingleFace,
    DESCRIPTOR_DIM,
};

use std::path::PathBuf;

/// Where the ONNX bundles are installed by default.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/facewatch/models")
}
