use crate::attributes::AttributeTarget;
use facewatch_core::{ModelPaths, DEFAULT_MATCH_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Defaults, overlaid by an optional TOML file named in `FACEWATCH_CONFIG`,
/// overlaid by `FACEWATCH_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory containing the ONNX model bundles.
    pub model_dir: PathBuf,
    /// Euclidean distance below which a live face matches the enrollment.
    pub match_threshold: f32,
    /// Period of the detection loop.
    pub detect_interval_ms: u64,
    /// How long a changed age/gender reading waits before it is published.
    pub debounce_ms: u64,
    /// Frames discarded right after the camera opens.
    pub warmup_frames: usize,
    /// Label attached to the enrolled identity.
    pub enrollment_label: String,
    /// Which face feeds the age/gender snapshot when several are visible.
    pub attribute_target: AttributeTarget,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: facewatch_core::default_model_dir(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            detect_interval_ms: 3000,
            debounce_ms: 100,
            warmup_frames: 4,
            enrollment_label: "Enrolled person".to_string(),
            attribute_target: AttributeTarget::Tracked,
        }
    }
}

impl Config {
    /// Load the file named by `FACEWATCH_CONFIG` (if any), then apply the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACEWATCH_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEWATCH_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACEWATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEWATCH_ENROLLMENT_LABEL") {
            self.enrollment_label = v;
        }
        override_parsed(&lookup, "FACEWATCH_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&lookup, "FACEWATCH_DETECT_INTERVAL_MS", &mut self.detect_interval_ms);
        override_parsed(&lookup, "FACEWATCH_DEBOUNCE_MS", &mut self.debounce_ms);
        override_parsed(&lookup, "FACEWATCH_WARMUP_FRAMES", &mut self.warmup_frames);
        override_parsed(&lookup, "FACEWATCH_ATTRIBUTE_TARGET", &mut self.attribute_target);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be positive, got {}",
                self.match_threshold
            )));
        }
        if self.detect_interval_ms == 0 {
            return Err(ConfigError::Invalid("detect_interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }

    pub fn detect_interval(&self) -> Duration {
        Duration::from_millis(self.detect_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Replace `slot` with the parsed variable; unparsable values keep the old one.
fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable setting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.detect_interval(), Duration::from_millis(3000));
        assert_eq!(config.debounce(), Duration::from_millis(100));
        assert_eq!(config.attribute_target, AttributeTarget::Tracked);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("FACEWATCH_CAMERA_DEVICE", "/dev/video4"),
            ("FACEWATCH_MATCH_THRESHOLD", "0.45"),
            ("FACEWATCH_DETECT_INTERVAL_MS", "500"),
            ("FACEWATCH_ATTRIBUTE_TARGET", "last"),
        ]));
        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.match_threshold, 0.45);
        assert_eq!(config.detect_interval_ms, 500);
        assert_eq!(config.attribute_target, AttributeTarget::Last);
    }

    #[test]
    fn test_unparsable_env_keeps_value() {
        let mut config = Config::default();
        config.apply_env(env(&[("FACEWATCH_DEBOUNCE_MS", "soon")]));
        assert_eq!(config.debounce_ms, 100);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "camera_device = \"/dev/video9\"\nmatch_threshold = 0.5").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.camera_device, "/dev/video9");
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.detect_interval_ms, 3000);
    }

    #[test]
    fn test_from_file_rejects_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "gallery_size = 4").unwrap();
        assert!(matches!(Config::from_file(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            match_threshold: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            detect_interval_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
