use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::overlay::render;
use facewatch_core::{
    EnrolledIdentity, EuclideanMatcher, InferenceEngine, MatchResult, Matcher, ModelPaths,
    OnnxEngine, Overlay, RasterSurface, DEFAULT_MATCH_THRESHOLD,
};
use facewatch_hw::{Camera, Frame, VideoSource};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.facewatch.Facewatch1",
    default_service = "org.facewatch.Facewatch1",
    default_path = "/org/facewatch/Facewatch1"
)]
trait Facewatch {
    fn enroll(&self, image: &[u8]) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
    fn overlay(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facewatch", about = "Live face detection and 1:1 matching")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the face in an image as the identity to match against
    Enroll {
        /// Image file (PNG, JPEG, BMP, ...)
        image: PathBuf,
    },
    /// Show daemon status
    Status,
    /// Show the latest detection overlay
    Overlay {
        /// Write the overlay as a transparent PNG
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// TrueType font for labels
        #[arg(long)]
        font: Option<PathBuf>,
    },
    /// List video capture devices
    Devices,
    /// Capture one frame and run detection locally (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_os_t = facewatch_core::default_model_dir())]
        model_dir: PathBuf,
        /// Image whose face the live faces are matched against
        #[arg(long)]
        reference: Option<PathBuf>,
        /// Write the annotated frame as PNG
        #[arg(short, long)]
        out: Option<PathBuf>,
        #[arg(long)]
        font: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { image } => {
            let bytes =
                std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            let proxy = connect().await?;
            let reply = proxy.enroll(&bytes).await.context("enrollment failed")?;
            print_json(&reply)?;
        }
        Commands::Status => {
            let proxy = connect().await?;
            print_json(&proxy.status().await?)?;
        }
        Commands::Overlay { out, font } => {
            let proxy = connect().await?;
            let overlay: Overlay = serde_json::from_str(&proxy.overlay().await?)?;
            println!(
                "cycle {}: {}x{}, {} face(s)",
                overlay.cycle,
                overlay.width,
                overlay.height,
                overlay.box_count()
            );
            for label in overlay.labels() {
                println!("  {label}");
            }
            if let Some(out) = out {
                let mut surface = surface(overlay.width, overlay.height, font.as_deref())?;
                overlay.replay(&mut surface);
                surface.into_image().save(&out)?;
                println!("wrote {}", out.display());
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("no video capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Test {
            device,
            model_dir,
            reference,
            out,
            font,
        } => run_test(
            &device,
            &model_dir,
            reference.as_deref(),
            out.as_deref(),
            font.as_deref(),
        )?,
    }

    Ok(())
}

async fn connect() -> Result<FacewatchProxy<'static>> {
    let conn = zbus::Connection::session().await.context("connecting to session bus")?;
    FacewatchProxy::new(&conn).await.context("facewatchd is not running")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn surface(width: u32, height: u32, font: Option<&Path>) -> Result<RasterSurface> {
    let surface = RasterSurface::new(width, height);
    Ok(match font {
        Some(path) => surface.with_font(RasterSurface::load_font(path)?),
        None => surface,
    })
}

fn run_test(
    device: &str,
    model_dir: &Path,
    reference: Option<&Path>,
    out: Option<&Path>,
    font: Option<&Path>,
) -> Result<()> {
    println!("Loading models from {}...", model_dir.display());
    let mut engine = OnnxEngine::load(&ModelPaths::in_dir(model_dir))?;

    let enrolled = match reference {
        Some(path) => {
            let frame = Frame::decode(&std::fs::read(path)?)?;
            let Some(face) = engine.detect_single(&frame.data, frame.width, frame.height)? else {
                bail!("no face detected in {}", path.display());
            };
            Some(EnrolledIdentity::new(path.display().to_string(), face.descriptor))
        }
        None => None,
    };

    println!("Opening {device}...");
    let mut camera = Camera::open(device)?;
    tracing::debug!(camera = %camera.describe(), "warming up");
    camera.warm_up(4);
    let frame = camera.capture_frame()?;
    camera.stop();
    println!(
        "Captured {}x{} frame (brightness {:.1}{})",
        frame.width,
        frame.height,
        frame.avg_brightness(),
        if frame.is_dark { ", dark" } else { "" }
    );

    let faces = engine.detect_all(&frame.data, frame.width, frame.height)?;
    let matcher = EuclideanMatcher::new(DEFAULT_MATCH_THRESHOLD);
    let results: Vec<MatchResult> = faces
        .iter()
        .map(|f| matcher.compare(&f.descriptor, enrolled.as_ref()))
        .collect();

    println!("{} face(s)", faces.len());
    for (face, result) in faces.iter().zip(&results) {
        let b = &face.bbox;
        println!(
            "  [{:.0},{:.0} {:.0}x{:.0}] conf {:.2}  age {:.0} {} ({:.2})  distance {:.3}{}",
            b.x,
            b.y,
            b.width,
            b.height,
            b.confidence,
            face.age,
            face.gender.as_str(),
            face.gender_probability,
            result.distance,
            if result.is_match { "  MATCH" } else { "" }
        );
    }

    if let Some(out) = out {
        let base = frame.to_image().context("frame buffer size mismatch")?;
        let mut surface = surface(frame.width, frame.height, font)?;
        render(&mut surface, &faces, &results);
        surface.composite_over(&base).save(out)?;
        println!("wrote {}", out.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overlay_args() {
        let cli = Cli::try_parse_from(["facewatch", "overlay", "--out", "/tmp/o.png"]).unwrap();
        match cli.command {
            Commands::Overlay { out, font } => {
                assert_eq!(out, Some(PathBuf::from("/tmp/o.png")));
                assert!(font.is_none());
            }
            _ => panic!("expected overlay"),
        }
    }

    #[test]
    fn test_parse_test_defaults() {
        let cli = Cli::try_parse_from(["facewatch", "test"]).unwrap();
        match cli.command {
            Commands::Test { device, model_dir, .. } => {
                assert_eq!(device, "/dev/video0");
                assert_eq!(model_dir, facewatch_core::default_model_dir());
            }
            _ => panic!("expected test"),
        }
    }

    #[test]
    fn test_enroll_requires_image() {
        assert!(Cli::try_parse_from(["facewatch", "enroll"]).is_err());
    }
}
