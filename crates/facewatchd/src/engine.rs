use facewatch_core::{FaceDetection, InferenceEngine, InferenceError, SingleFace};
use facewatch_hw::{CameraError, Frame, FrameError, VideoSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),
    #[error("image error: {0}")]
    Frame(#[from] FrameError),
    #[error("no video source attached")]
    NoSource,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the detection loop and D-Bus handlers to the engine thread.
enum EngineRequest {
    Attach {
        source: Box<dyn VideoSource>,
        reply: oneshot::Sender<()>,
    },
    Capture {
        reply: oneshot::Sender<Result<Frame, EngineError>>,
    },
    DetectAll {
        frame: Frame,
        reply: oneshot::Sender<Result<Vec<FaceDetection>, EngineError>>,
    },
    DetectStill {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Option<SingleFace>, EngineError>>,
    },
    Release {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Clone-safe handle to the engine thread.
///
/// Requests are served one at a time in arrival order, so a capture or
/// inference call never overlaps another on the same models or device.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    /// Checked by the engine thread before every request.
    release_requested: Arc<AtomicBool>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Hand the live video source to the engine thread, replacing (and stopping) any previous one.
    pub async fn attach(&self, source: Box<dyn VideoSource>) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Attach { source, reply }).await
    }

    /// Grab the current frame from the attached source.
    pub async fn capture(&self) -> Result<Frame, EngineError> {
        self.call(|reply| EngineRequest::Capture { reply }).await?
    }

    /// Every face in `frame`, with descriptor and age/gender.
    pub async fn detect_all(&self, frame: Frame) -> Result<Vec<FaceDetection>, EngineError> {
        self.call(|reply| EngineRequest::DetectAll { frame, reply }).await?
    }

    /// Decode an uploaded still image and describe its most prominent face.
    /// The decoded pixels never leave the engine thread.
    pub async fn detect_still(&self, image: Vec<u8>) -> Result<Option<SingleFace>, EngineError> {
        self.call(|reply| EngineRequest::DetectStill { image, reply }).await?
    }

    /// Stop and drop the attached video source. Models stay loaded.
    pub async fn release(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Release { reply: Some(reply) }).await
    }

    /// Release without waiting. Used where awaiting is impossible (`Drop`).
    ///
    /// Returns whether a release request was queued. When the queue is full
    /// the thread still stops the source before serving its next request.
    pub fn release_nowait(&self) -> bool {
        self.release_requested.store(true, Ordering::SeqCst);
        match self.tx.try_send(EngineRequest::Release { reply: None }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("engine queue full; source released before the next request");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the inference models and, once attached, the video
/// source. It exits when every [`EngineHandle`] is dropped, stopping the
/// source on the way out.
pub fn spawn_engine(mut engine: Box<dyn InferenceEngine>) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let release_requested = Arc::new(AtomicBool::new(false));
    let release_flag = Arc::clone(&release_requested);

    std::thread::Builder::new()
        .name("facewatch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut source: Option<Box<dyn VideoSource>> = None;
            while let Some(req) = rx.blocking_recv() {
                if release_flag.swap(false, Ordering::SeqCst) {
                    if let Some(mut s) = source.take() {
                        s.stop();
                    }
                }
                match req {
                    EngineRequest::Attach { source: next, reply } => {
                        tracing::info!(source = %next.describe(), "video source attached");
                        if let Some(mut previous) = source.replace(next) {
                            previous.stop();
                        }
                        let _ = reply.send(());
                    }
                    EngineRequest::Capture { reply } => {
                        let result = match source.as_mut() {
                            Some(s) => s.capture_frame().map_err(EngineError::from),
                            None => Err(EngineError::NoSource),
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::DetectAll { frame, reply } => {
                        let result = engine
                            .detect_all(&frame.data, frame.width, frame.height)
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::DetectStill { image, reply } => {
                        let _ = reply.send(run_detect_still(engine.as_mut(), &image));
                    }
                    EngineRequest::Release { reply } => {
                        if let Some(mut s) = source.take() {
                            s.stop();
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                    }
                }
            }
            if let Some(mut s) = source.take() {
                s.stop();
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        release_requested,
    })
}

fn run_detect_still(
    engine: &mut dyn InferenceEngine,
    image: &[u8],
) -> Result<Option<SingleFace>, EngineError> {
    let frame = Frame::decode(image)?;
    tracing::debug!(width = frame.width, height = frame.height, "still image decoded");
    Ok(engine.detect_single(&frame.data, frame.width, frame.height)?)
}
