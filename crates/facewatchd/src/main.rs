use anyhow::Result;
use facewatch_core::{InferenceEngine, OnnxEngine};
use facewatch_hw::{Camera, VideoSource};
use tracing_subscriber::EnvFilter;

mod attributes;
mod config;
mod controller;
mod dbus_interface;
mod engine;
mod enrollment;
#[cfg(test)]
mod testing;

use controller::{DetectionController, LoopSettings};
use dbus_interface::{FacewatchService, BUS_NAME, OBJECT_PATH};
use enrollment::EnrollmentStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::load()?;
    tracing::info!(
        camera = %config.camera_device,
        model_dir = %config.model_dir.display(),
        threshold = config.match_threshold,
        interval_ms = config.detect_interval_ms,
        "facewatchd starting"
    );

    let store = EnrollmentStore::new(config.enrollment_label.as_str());
    let mut controller = DetectionController::new(LoopSettings::from(&config), store.clone());

    let paths = config.model_paths();
    let device = config.camera_device.clone();
    let warmup = config.warmup_frames;
    let prepared = controller
        .prepare(
            move || OnnxEngine::load(&paths).map(|e| Box::new(e) as Box<dyn InferenceEngine>),
            move || {
                let mut camera = Camera::open(&device)?;
                if warmup > 0 {
                    tracing::info!(count = warmup, "discarding warmup frames");
                    camera.warm_up(warmup);
                }
                Ok(Box::new(camera) as Box<dyn VideoSource>)
            },
        )
        .await;

    // The daemon stays up without a loop so status keeps reporting the error.
    match prepared {
        Ok(()) => controller.start()?,
        Err(e) => tracing::error!(error = %e, "live detection disabled for this session"),
    }

    let service = FacewatchService::new(store, controller.view(), controller.engine());
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, "facewatchd ready");

    shutdown_signal().await?;
    tracing::info!("facewatchd shutting down");
    controller.stop().await;

    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = term.recv() => Ok(()),
    }
}
