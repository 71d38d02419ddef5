//! The single enrolled identity.
//!
//! Readers get a cheap `Arc` snapshot that is always a complete identity.
//! Enrollments are serialized, and a failed attempt leaves the current
//! identity untouched.

use crate::engine::{EngineError, EngineHandle};
use facewatch_core::EnrolledIdentity;
use facewatch_hw::FrameError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("face models are not loaded")]
    NotReady,
    #[error("could not read the uploaded image: {0}")]
    Decode(#[source] FrameError),
    #[error("no face detected in the uploaded image")]
    NoFaceFound,
    #[error("engine error: {0}")]
    Engine(#[source] EngineError),
}

#[derive(Clone)]
pub struct EnrollmentStore {
    current: Arc<watch::Sender<Option<Arc<EnrolledIdentity>>>>,
    writer: Arc<Mutex<()>>,
    label: Arc<str>,
}

impl EnrollmentStore {
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            current: Arc::new(current),
            writer: Arc::new(Mutex::new(())),
            label: label.into(),
        }
    }

    /// The identity at this instant, if any.
    pub fn current(&self) -> Option<Arc<EnrolledIdentity>> {
        self.current.borrow().clone()
    }

    /// Describe the most prominent face in `image` and make it the enrolled identity.
    ///
    /// Enrolling the same image twice yields the same descriptor. With no
    /// engine, an undecodable image or no face, the previous identity stays.
    pub async fn enroll(
        &self,
        engine: Option<&EngineHandle>,
        image: Vec<u8>,
    ) -> Result<Arc<EnrolledIdentity>, EnrollError> {
        let engine = engine.ok_or(EnrollError::NotReady)?;
        let _writer = self.writer.lock().await;

        let face = match engine.detect_still(image).await {
            Ok(Some(face)) => face,
            Ok(None) => {
                tracing::warn!("enrollment rejected: no face in uploaded image");
                return Err(EnrollError::NoFaceFound);
            }
            Err(EngineError::Frame(e)) => {
                tracing::warn!(error = %e, "enrollment rejected: undecodable image");
                return Err(EnrollError::Decode(e));
            }
            Err(e) => return Err(EnrollError::Engine(e)),
        };

        let identity = Arc::new(EnrolledIdentity::new(&*self.label, face.descriptor));
        let previous = self.replace(Arc::clone(&identity));
        tracing::info!(
            label = %identity.label,
            confidence = face.bbox.confidence,
            replaced = previous.is_some(),
            "face enrolled"
        );
        Ok(identity)
    }

    /// Swap in a new identity in one step. Returns the one it replaced.
    pub(crate) fn replace(&self, identity: Arc<EnrolledIdentity>) -> Option<Arc<EnrolledIdentity>> {
        self.current.send_replace(Some(identity))
    }
}
