use rollcall_core::{DetectorConfig, SessionConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime configuration: defaults, then the optional TOML file named by
/// `ROLLCALL_CONFIG`, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the SCRFD ONNX model.
    pub model_dir: PathBuf,
    /// Root of the `<Name>.<id>` sample directories.
    pub training_dir: PathBuf,
    /// Where `model.json` and `labels.json` live.
    pub artifact_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// LBPH distance a match must stay strictly below.
    pub confidence_threshold: f64,
    pub progress_interval: u64,
    pub max_consecutive_failures: u32,
    pub detector_score_threshold: f32,
    /// Minimum face size as a fraction of the frame.
    pub min_face_fraction: f32,
    /// Frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: u32,
}

/// On-disk form; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    training_dir: Option<PathBuf>,
    artifact_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    confidence_threshold: Option<f64>,
    progress_interval: Option<u64>,
    max_consecutive_failures: Option<u32>,
    detector_score_threshold: Option<f32>,
    min_face_fraction: Option<f32>,
    warmup_frames: Option<u32>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::defaults(&default_data_dir());
        if let Ok(path) = std::env::var("ROLLCALL_CONFIG") {
            config.apply_file(&read_file(Path::new(&path))?);
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn defaults(data_dir: &Path) -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: data_dir.join("models"),
            training_dir: data_dir.join("training"),
            artifact_dir: data_dir.join("artifacts"),
            db_path: data_dir.join("rollcall.db"),
            confidence_threshold: 40.0,
            progress_interval: 30,
            max_consecutive_failures: 10,
            detector_score_threshold: 0.5,
            min_face_fraction: 0.1,
            warmup_frames: 4,
        }
    }

    fn apply_file(&mut self, f: &FileConfig) {
        if let Some(v) = &f.camera_device {
            self.camera_device = v.clone();
        }
        for (slot, value) in [
            (&mut self.model_dir, &f.model_dir),
            (&mut self.training_dir, &f.training_dir),
            (&mut self.artifact_dir, &f.artifact_dir),
            (&mut self.db_path, &f.db_path),
        ] {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }
        self.confidence_threshold = f.confidence_threshold.unwrap_or(self.confidence_threshold);
        self.progress_interval = f.progress_interval.unwrap_or(self.progress_interval);
        self.max_consecutive_failures = f
            .max_consecutive_failures
            .unwrap_or(self.max_consecutive_failures);
        self.detector_score_threshold = f
            .detector_score_threshold
            .unwrap_or(self.detector_score_threshold);
        self.min_face_fraction = f.min_face_fraction.unwrap_or(self.min_face_fraction);
        self.warmup_frames = f.warmup_frames.unwrap_or(self.warmup_frames);
    }

    /// Overlay variables from `lookup`; unparsable values are ignored.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        for (key, slot) in [
            ("ROLLCALL_MODEL_DIR", &mut self.model_dir),
            ("ROLLCALL_TRAINING_DIR", &mut self.training_dir),
            ("ROLLCALL_ARTIFACT_DIR", &mut self.artifact_dir),
            ("ROLLCALL_DB_PATH", &mut self.db_path),
        ] {
            if let Some(v) = lookup(key) {
                *slot = PathBuf::from(v);
            }
        }
        env_parse(&lookup, "ROLLCALL_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        env_parse(&lookup, "ROLLCALL_PROGRESS_INTERVAL", &mut self.progress_interval);
        env_parse(
            &lookup,
            "ROLLCALL_MAX_CONSECUTIVE_FAILURES",
            &mut self.max_consecutive_failures,
        );
        env_parse(
            &lookup,
            "ROLLCALL_DETECTOR_SCORE_THRESHOLD",
            &mut self.detector_score_threshold,
        );
        env_parse(&lookup, "ROLLCALL_MIN_FACE_FRACTION", &mut self.min_face_fraction);
        env_parse(&lookup, "ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            score_threshold: self.detector_score_threshold,
            min_face_fraction: self.min_face_fraction,
            ..DetectorConfig::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            confidence_threshold: self.confidence_threshold,
            progress_interval: self.progress_interval,
            max_consecutive_failures: self.max_consecutive_failures,
            warmup_frames: self.warmup_frames,
            ..SessionConfig::default()
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable setting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> Config {
        Config::defaults(Path::new("/data/rollcall"))
    }

    #[test]
    fn test_defaults() {
        let c = base();
        assert_eq!(c.camera_device, "/dev/video0");
        assert_eq!(c.db_path, PathBuf::from("/data/rollcall/rollcall.db"));
        assert_eq!(c.confidence_threshold, 40.0);
        assert_eq!(c.progress_interval, 30);
        assert_eq!(c.warmup_frames, 4);
        assert_eq!(
            c.scrfd_model_path(),
            PathBuf::from("/data/rollcall/models/det_10g.onnx")
        );
    }

    #[test]
    fn test_file_then_env_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(
            &path,
            "confidence_threshold = 35.0\ncamera_device = \"/dev/video2\"\nartifact_dir = \"/srv/artifacts\"\n",
        )
        .unwrap();

        let mut c = base();
        c.apply_file(&read_file(&path).unwrap());
        assert_eq!(c.confidence_threshold, 35.0);
        assert_eq!(c.artifact_dir, PathBuf::from("/srv/artifacts"));

        let env: HashMap<&str, &str> = [
            ("ROLLCALL_CAMERA_DEVICE", "/dev/video4"),
            ("ROLLCALL_PROGRESS_INTERVAL", "10"),
            ("ROLLCALL_CONFIDENCE_THRESHOLD", "not-a-number"),
        ]
        .into_iter()
        .collect();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(c.camera_device, "/dev/video4");
        assert_eq!(c.progress_interval, 10);
        assert_eq!(c.confidence_threshold, 35.0);
    }

    #[test]
    fn test_unknown_file_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "confidence = 12\n").unwrap();
        assert!(matches!(read_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_core_configs() {
        let mut c = base();
        c.min_face_fraction = 0.2;
        c.warmup_frames = 0;
        assert_eq!(c.detector_config().min_face_fraction, 0.2);
        assert_eq!(c.detector_config().nms_threshold, 0.4);
        let s = c.session_config();
        assert_eq!(s.confidence_threshold, 40.0);
        assert_eq!(s.warmup_frames, 0);
        assert!(s.skip_dark_frames);
    }
}
