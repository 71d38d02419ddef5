//! The live detection loop.
//!
//! `Idle --prepare--> Ready --start--> Running --stop--> Idle`. Preparing
//! loads the models and then opens the camera; if either fails the
//! controller stays `Idle` for the rest of the session. While running, a
//! cycle fires every interval: capture, detect, match against the current
//! enrollment, publish the overlay and the match flag, and feed the
//! attribute debouncer. Cycles never overlap; ticks missed while a slow
//! cycle runs are skipped.

use crate::attributes::{AttributeDebouncer, AttributeTarget};
use crate::config::Config;
use crate::engine::{spawn_engine, EngineError, EngineHandle};
use crate::enrollment::EnrollmentStore;
use facewatch_core::overlay::render;
use facewatch_core::{
    Attributes, EuclideanMatcher, InferenceEngine, MatchResult, Matcher, ModelLoadError, Overlay,
    Surface,
};
use facewatch_hw::{CameraError, VideoSource};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Idle,
    Ready,
    Running,
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Could not load the face models: {0}")]
    ModelLoad(#[source] ModelLoadError),
    #[error("Could not access the camera: {0}")]
    CameraAccess(#[source] CameraError),
    #[error("detection loop is {found:?}, expected {expected:?}")]
    NotReady {
        found: ControllerState,
        expected: ControllerState,
    },
    #[error("a previous prepare failed: {0}")]
    Failed(String),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Why a single cycle produced no fresh overlay. The loop keeps running.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("frame capture failed: {0}")]
    Capture(#[source] EngineError),
    #[error("face detection failed: {0}")]
    Detection(#[source] EngineError),
}

/// What one cycle saw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleOutcome {
    /// No video source yet; nothing was captured.
    Skipped,
    Completed { cycle: u64, faces: usize, any_match: bool },
}

/// Loop timing and matching parameters.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub interval: Duration,
    pub debounce: Duration,
    pub match_threshold: f32,
    pub attribute_target: AttributeTarget,
}

impl From<&Config> for LoopSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.detect_interval(),
            debounce: config.debounce(),
            match_threshold: config.match_threshold,
            attribute_target: config.attribute_target,
        }
    }
}

/// Read side of everything the loop publishes.
///
/// Each value has exactly one writer: the controller for state and error,
/// the debouncer for attributes, and the running cycle for the match flag
/// and overlay.
#[derive(Clone)]
pub struct LoopView {
    state: Arc<watch::Sender<ControllerState>>,
    attributes: Arc<watch::Sender<Option<Attributes>>>,
    match_found: Arc<watch::Sender<bool>>,
    overlay: Arc<watch::Sender<Arc<Overlay>>>,
    last_error: Arc<watch::Sender<Option<String>>>,
}

impl LoopView {
    fn new() -> Self {
        Self {
            state: Arc::new(watch::channel(ControllerState::Idle).0),
            attributes: Arc::new(watch::channel(None).0),
            match_found: Arc::new(watch::channel(false).0),
            overlay: Arc::new(watch::channel(Arc::new(Overlay::default())).0),
            last_error: Arc::new(watch::channel(None).0),
        }
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn attributes(&self) -> Option<Attributes> {
        *self.attributes.borrow()
    }

    pub fn match_found(&self) -> bool {
        *self.match_found.borrow()
    }

    pub fn overlay(&self) -> Arc<Overlay> {
        self.overlay.borrow().clone()
    }

    /// The user-facing message of the failure that ended the session, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    fn publish_cycle(&self, any_match: bool, overlay: Overlay) {
        self.match_found.send_if_modified(|current| {
            let changed = *current != any_match;
            *current = any_match;
            changed
        });
        self.overlay.send_replace(Arc::new(overlay));
    }
}

/// Owns the loop's lifecycle and its resources.
pub struct DetectionController {
    settings: LoopSettings,
    store: EnrollmentStore,
    view: LoopView,
    engine: Option<EngineHandle>,
    task: Option<JoinHandle<()>>,
}

impl DetectionController {
    pub fn new(settings: LoopSettings, store: EnrollmentStore) -> Self {
        Self {
            settings,
            store,
            view: LoopView::new(),
            engine: None,
            task: None,
        }
    }

    pub fn view(&self) -> LoopView {
        self.view.clone()
    }

    /// The engine, once models are loaded. Still available after a camera
    /// failure so enrollment keeps working.
    pub fn engine(&self) -> Option<EngineHandle> {
        self.engine.clone()
    }

    /// Load the models, then open the camera. Both run off the async runtime.
    ///
    /// On success the controller is `Ready`. On failure it stays `Idle`, the
    /// error message is published on the view, and later calls are refused.
    pub async fn prepare<L, C>(
        &mut self,
        load_models: L,
        open_camera: C,
    ) -> Result<(), ControllerError>
    where
        L: FnOnce() -> Result<Box<dyn InferenceEngine>, ModelLoadError> + Send + 'static,
        C: FnOnce() -> Result<Box<dyn VideoSource>, CameraError> + Send + 'static,
    {
        self.expect_state(ControllerState::Idle)?;
        if let Some(message) = self.view.last_error() {
            return Err(ControllerError::Failed(message));
        }

        let engine = match tokio::task::spawn_blocking(load_models).await {
            Ok(Ok(engine)) => engine,
            Ok(Err(e)) => return Err(self.fail(ControllerError::ModelLoad(e))),
            Err(e) => return Err(self.fail(ControllerError::Join(e))),
        };
        tracing::info!("face models loaded");
        let handle = spawn_engine(engine).map_err(|e| self.fail(e.into()))?;
        self.engine = Some(handle.clone());

        let source = match tokio::task::spawn_blocking(open_camera).await {
            Ok(Ok(source)) => source,
            Ok(Err(e)) => return Err(self.fail(ControllerError::CameraAccess(e))),
            Err(e) => return Err(self.fail(ControllerError::Join(e))),
        };
        handle.attach(source).await.map_err(|e| self.fail(e.into()))?;

        self.view.state.send_replace(ControllerState::Ready);
        tracing::info!("detection loop ready");
        Ok(())
    }

    /// Begin periodic detection. The first cycle runs one interval from now.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        self.expect_state(ControllerState::Ready)?;
        let engine = self.engine.clone().ok_or(ControllerError::NotReady {
            found: ControllerState::Idle,
            expected: ControllerState::Ready,
        })?;

        let cycle = DetectionCycle {
            engine,
            store: self.store.clone(),
            view: self.view.clone(),
            matcher: EuclideanMatcher::new(self.settings.match_threshold),
            target: self.settings.attribute_target,
            debouncer: AttributeDebouncer::new(
                Arc::clone(&self.view.attributes),
                self.settings.debounce,
            ),
            count: 0,
        };
        self.task = Some(tokio::spawn(run_loop(cycle, self.settings.interval)));
        self.view.state.send_replace(ControllerState::Running);
        tracing::info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            "detection loop started"
        );
        Ok(())
    }

    /// Cancel the loop and release the camera.
    ///
    /// Results of a cycle still in flight are discarded. Safe to call in any state.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            tracing::info!("detection loop stopped");
        }
        if let Some(engine) = self.engine.take() {
            if let Err(e) = engine.release().await {
                tracing::debug!(error = %e, "engine already gone at release");
            }
        }
        if self.view.state() != ControllerState::Idle {
            self.view.publish_cycle(false, Overlay::default());
            self.view.state.send_replace(ControllerState::Idle);
        }
    }

    fn expect_state(&self, expected: ControllerState) -> Result<(), ControllerError> {
        let found = self.view.state();
        if found != expected {
            return Err(ControllerError::NotReady { found, expected });
        }
        Ok(())
    }

    fn fail(&self, err: ControllerError) -> ControllerError {
        tracing::error!(error = %err, "detection loop unavailable");
        self.view.last_error.send_replace(Some(err.to_string()));
        err
    }
}

impl Drop for DetectionController {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(engine) = self.engine.take() {
            if !engine.release_nowait() {
                tracing::debug!("camera release deferred until the engine queue drains");
            }
        }
    }
}

async fn run_loop(mut cycle: DetectionCycle, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match cycle.run().await {
            Ok(CycleOutcome::Skipped) => tracing::debug!("no video source; tick skipped"),
            Ok(CycleOutcome::Completed { cycle, faces, any_match }) => {
                tracing::debug!(cycle, faces, any_match, "detection cycle complete")
            }
            Err(e) => tracing::warn!(cycle = cycle.count, error = %e, "detection cycle failed"),
        }
    }
}

/// State carried from one cycle to the next. Lives inside the loop task.
struct DetectionCycle {
    engine: EngineHandle,
    store: EnrollmentStore,
    view: LoopView,
    matcher: EuclideanMatcher,
    target: AttributeTarget,
    debouncer: AttributeDebouncer,
    count: u64,
}

impl DetectionCycle {
    async fn run(&mut self) -> Result<CycleOutcome, CycleError> {
        let frame = match self.engine.capture().await {
            Ok(frame) => frame,
            Err(EngineError::NoSource) => return Ok(CycleOutcome::Skipped),
            Err(e) => return Err(CycleError::Capture(e)),
        };
        self.count += 1;
        if frame.is_dark {
            tracing::debug!(cycle = self.count, "frame is mostly dark");
        }
        let captured_at = frame.timestamp;

        let mut overlay = Overlay::new(self.count);
        overlay.resize(frame.width, frame.height);
        overlay.clear();

        let detections = match self.engine.detect_all(frame).await {
            Ok(detections) => detections,
            Err(e) => {
                self.view.publish_cycle(false, overlay);
                return Err(CycleError::Detection(e));
            }
        };

        // One snapshot for the whole cycle; a concurrent enrollment shows up next time.
        let enrolled = self.store.current();
        let results: Vec<MatchResult> = detections
            .iter()
            .map(|face| self.matcher.compare(&face.descriptor, enrolled.as_deref()))
            .collect();

        if let Some(i) = self.target.select(&detections, &results) {
            self.debouncer.observe(detections[i].attributes());
        }

        let any_match = results.iter().any(|r| r.is_match);
        render(&mut overlay, &detections, &results);
        self.view.publish_cycle(any_match, overlay);
        tracing::trace!(latency_ms = captured_at.elapsed().as_millis() as u64, "overlay published");

        Ok(CycleOutcome::Completed {
            cycle: self.count,
            faces: detections.len(),
            any_match,
        })
    }
}
