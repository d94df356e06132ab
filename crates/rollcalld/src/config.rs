use rollcall_core::{
    BackendPreference, ContrastMode, DetectorParams, GalleryParams, PreprocessParams, StabilizerParams,
};
use rollcall_hw::SourceSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_ENV: &str = "ROLLCALL_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Pipeline configuration.
///
/// Built from defaults, then the TOML file named by `ROLLCALL_CONFIG` (any
/// subset of fields), then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 index opened by default (`/dev/videoN`).
    pub camera_index: u32,
    /// Indices tried when the requested camera cannot be opened.
    pub fallback_indices: Vec<u32>,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory holding `det_10g.onnx` and/or `seeta_fd_frontal_v1.0.bin`.
    pub model_dir: PathBuf,
    /// SQLite gallery store.
    pub db_path: PathBuf,
    /// "auto", "accurate" or "lightweight".
    pub detector: String,
    pub similarity_threshold: f32,
    pub max_samples_per_identity: usize,
    pub canonical_size: u32,
    /// "equalize" or "clahe".
    pub contrast: String,
    pub min_face_size: f32,
    pub max_face_size: f32,
    pub max_faces: usize,
    /// Detection loop period.
    pub cycle_ms: u64,
    /// Tracked faces unseen for this long are dropped.
    pub inactivity_secs: u64,
    pub position_bucket_px: f32,
    /// Bound on how long stop() waits for each background thread.
    pub stop_timeout_ms: u64,
    /// Consecutive failed detection cycles that count as a fault.
    pub max_consecutive_errors: u32,
    pub jpeg_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            camera_index: 0,
            fallback_indices: vec![0, 1, 2],
            capture_width: 640,
            capture_height: 480,
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("gallery.db"),
            detector: "auto".to_string(),
            similarity_threshold: 0.35,
            max_samples_per_identity: 10,
            canonical_size: 100,
            contrast: "equalize".to_string(),
            min_face_size: 60.0,
            max_face_size: 500.0,
            max_faces: 10,
            cycle_ms: 200,
            inactivity_secs: 5,
            position_bucket_px: 40.0,
            stop_timeout_ms: 2000,
            max_consecutive_errors: 10,
            jpeg_quality: 80,
        }
    }
}

impl Config {
    /// Defaults, then `$ROLLCALL_CONFIG`, then `ROLLCALL_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `ROLLCALL_*` overrides read through `lookup`. Unparseable
    /// values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        override_parsed(&mut self.camera_index, "ROLLCALL_CAMERA_INDEX", &get);
        if let Some(list) = get("ROLLCALL_FALLBACK_INDICES") {
            match list.split(',').map(|s| s.trim().parse::<u32>()).collect::<Result<Vec<_>, _>>() {
                Ok(indices) => self.fallback_indices = indices,
                Err(_) => tracing::warn!(value = %list, "ignoring invalid ROLLCALL_FALLBACK_INDICES"),
            }
        }
        override_parsed(&mut self.capture_width, "ROLLCALL_CAPTURE_WIDTH", &get);
        override_parsed(&mut self.capture_height, "ROLLCALL_CAPTURE_HEIGHT", &get);
        if let Some(dir) = get("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = get("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(detector) = get("ROLLCALL_DETECTOR") {
            self.detector = detector;
        }
        override_parsed(&mut self.similarity_threshold, "ROLLCALL_SIMILARITY_THRESHOLD", &get);
        override_parsed(&mut self.max_samples_per_identity, "ROLLCALL_MAX_SAMPLES", &get);
        override_parsed(&mut self.canonical_size, "ROLLCALL_CANONICAL_SIZE", &get);
        if let Some(contrast) = get("ROLLCALL_CONTRAST") {
            self.contrast = contrast;
        }
        override_parsed(&mut self.min_face_size, "ROLLCALL_MIN_FACE_SIZE", &get);
        override_parsed(&mut self.max_face_size, "ROLLCALL_MAX_FACE_SIZE", &get);
        override_parsed(&mut self.max_faces, "ROLLCALL_MAX_FACES", &get);
        override_parsed(&mut self.cycle_ms, "ROLLCALL_CYCLE_MS", &get);
        override_parsed(&mut self.inactivity_secs, "ROLLCALL_INACTIVITY_SECS", &get);
        override_parsed(&mut self.position_bucket_px, "ROLLCALL_BUCKET_PX", &get);
        override_parsed(&mut self.stop_timeout_ms, "ROLLCALL_STOP_TIMEOUT_MS", &get);
        override_parsed(&mut self.max_consecutive_errors, "ROLLCALL_MAX_CONSECUTIVE_ERRORS", &get);
        override_parsed(&mut self.jpeg_quality, "ROLLCALL_JPEG_QUALITY", &get);
    }

    pub fn backend_preference(&self) -> BackendPreference {
        self.detector.parse().unwrap_or_else(|e: String| {
            tracing::warn!(error = %e, "falling back to automatic backend selection");
            BackendPreference::Auto
        })
    }

    pub fn detector_params(&self) -> DetectorParams {
        DetectorParams {
            min_face_size: self.min_face_size,
            max_face_size: self.max_face_size,
            max_faces: self.max_faces,
            ..DetectorParams::default()
        }
    }

    pub fn preprocess_params(&self) -> PreprocessParams {
        let contrast = match self.contrast.trim().to_ascii_lowercase().as_str() {
            "clahe" => ContrastMode::Clahe,
            "equalize" | "" => ContrastMode::Equalize,
            other => {
                tracing::warn!(value = other, "unknown contrast mode; using global equalization");
                ContrastMode::Equalize
            }
        };
        PreprocessParams { canonical_size: self.canonical_size, contrast, ..PreprocessParams::default() }
    }

    pub fn gallery_params(&self) -> GalleryParams {
        GalleryParams {
            max_samples_per_identity: self.max_samples_per_identity,
            threshold: self.similarity_threshold,
            canonical_size: self.canonical_size,
            ..GalleryParams::default()
        }
    }

    pub fn stabilizer_params(&self) -> StabilizerParams {
        StabilizerParams {
            bucket_px: self.position_bucket_px,
            inactivity_timeout: Duration::from_secs(self.inactivity_secs),
        }
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            fallback_indices: self.fallback_indices.clone(),
            stop_timeout: self.stop_timeout(),
            ..SourceSettings::default()
        }
    }

    pub fn cycle(&self) -> Duration {
        Duration::from_millis(self.cycle_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// `$XDG_DATA_HOME/rollcall`, else `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn override_parsed<T: std::str::FromStr>(
    slot: &mut T,
    key: &str,
    get: &impl Fn(&str) -> Option<String>,
) {
    if let Some(raw) = get(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
        }
    }
}
