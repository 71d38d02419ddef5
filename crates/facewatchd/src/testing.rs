//! Scripted engine and video source for daemon tests.

use facewatch_core::{
    BoundingBox, Descriptor, FaceDetection, Gender, InferenceEngine, InferenceError, DESCRIPTOR_DIM,
};
use facewatch_hw::{CameraError, Frame, VideoSource};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tokio::sync::oneshot;

/// A face whose descriptor is `value` in every component.
pub fn face(confidence: f32, value: f32) -> FaceDetection {
    FaceDetection {
        bbox: BoundingBox {
            x: 10.0,
            y: 12.0,
            width: 20.0,
            height: 24.0,
            confidence,
            landmarks: None,
        },
        descriptor: descriptor(value),
        age: 30.0,
        gender: Gender::Male,
        gender_probability: 0.9,
    }
}

pub fn descriptor(value: f32) -> Descriptor {
    Descriptor::new(vec![value; DESCRIPTOR_DIM]).unwrap()
}

/// A flat grayscale PNG.
pub fn png(width: u32, height: u32, value: u8) -> Vec<u8> {
    let img = image::GrayImage::from_pixel(width, height, image::Luma([value]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

struct Gate {
    entered: oneshot::Sender<()>,
    release: mpsc::Receiver<()>,
}

#[derive(Default)]
struct EngineState {
    faces: Vec<FaceDetection>,
    failures: usize,
    calls: usize,
    gate: Option<Gate>,
}

/// Returns a fixed set of faces. Clones share state.
#[derive(Clone)]
pub struct FakeEngine(Arc<Mutex<EngineState>>);

impl FakeEngine {
    pub fn new(faces: Vec<FaceDetection>) -> Self {
        Self(Arc::new(Mutex::new(EngineState {
            faces,
            ..EngineState::default()
        })))
    }

    pub fn set_faces(&self, faces: Vec<FaceDetection>) {
        self.0.lock().unwrap().faces = faces;
    }

    /// Fail the next `n` inference calls.
    pub fn fail_next(&self, n: usize) {
        self.0.lock().unwrap().failures = n;
    }

    pub fn calls(&self) -> usize {
        self.0.lock().unwrap().calls
    }

    /// Block the next inference call until the returned sender fires.
    /// The receiver resolves once that call has started.
    pub fn gate_next(&self) -> (oneshot::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = mpsc::channel();
        self.0.lock().unwrap().gate = Some(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        (entered_rx, release_tx)
    }
}

impl InferenceEngine for FakeEngine {
    fn detect_all(
        &mut self,
        _: &[u8],
        _: u32,
        _: u32,
    ) -> Result<Vec<FaceDetection>, InferenceError> {
        let gate = {
            let mut state = self.0.lock().unwrap();
            state.calls += 1;
            state.gate.take()
        };
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }

        let mut state = self.0.lock().unwrap();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(InferenceError::Other("scripted failure".into()));
        }
        Ok(state.faces.clone())
    }
}

#[derive(Default)]
struct SourceState {
    captures: AtomicUsize,
    stopped: AtomicBool,
}

/// Produces flat 64x48 frames. Clones share state.
#[derive(Clone, Default)]
pub struct FakeSource(Arc<SourceState>);

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captures(&self) -> usize {
        self.0.captures.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.0.stopped.load(Ordering::SeqCst)
    }
}

impl VideoSource for FakeSource {
    fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        if self.is_stopped() {
            return Err(CameraError::Stopped);
        }
        let n = self.0.captures.fetch_add(1, Ordering::SeqCst) as u32;
        Frame::from_gray(vec![128; 64 * 48], 64, 48, n)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    fn stop(&mut self) {
        self.0.stopped.store(true, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}
