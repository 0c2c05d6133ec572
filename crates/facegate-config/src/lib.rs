use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const PRIMARY_CONFIG_PATH: &str = "/etc/facegate/config.toml";
pub const SECONDARY_CONFIG_PATH: &str = "/usr/local/etc/facegate/config.toml";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_DISTANCE_METRIC: &str = "cosine";
pub const DEFAULT_EMBEDDER: &str = "thumbnail";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_JITTERS: u32 = 1;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub storage_dir: Option<PathBuf>,
    pub listen_addr: Option<String>,
    pub distance_metric: Option<String>,
    pub threshold: Option<f64>,
    pub embedder: Option<String>,
    pub enforce_detection: Option<bool>,
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub jitters: Option<u32>,
    pub request_timeout_secs: Option<u64>,
    pub max_body_bytes: Option<usize>,
    pub allowed_origins: Option<Vec<String>>,
    pub persist_cache: Option<bool>,
}

/// Every key with its default applied, except the storage directory, which
/// the caller resolves against flags and the environment.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub storage_dir: Option<PathBuf>,
    pub listen_addr: SocketAddr,
    pub distance_metric: String,
    pub threshold: Option<f64>,
    pub embedder: String,
    pub enforce_detection: bool,
    pub landmark_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub jitters: u32,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
    pub persist_cache: bool,
}

impl ResolvedConfig {
    pub fn from_raw(raw: ConfigFile) -> Result<Self, ConfigError> {
        let listen_addr = raw
            .listen_addr
            .as_deref()
            .unwrap_or(DEFAULT_LISTEN_ADDR)
            .parse::<SocketAddr>()
            .map_err(|err| ConfigError::Invalid {
                key: "listen_addr",
                message: err.to_string(),
            })?;

        if let Some(threshold) = raw.threshold {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(ConfigError::Invalid {
                    key: "threshold",
                    message: format!("expected a non-negative number, found {threshold}"),
                });
            }
        }

        Ok(Self {
            storage_dir: raw.storage_dir,
            listen_addr,
            distance_metric: raw
                .distance_metric
                .unwrap_or_else(|| DEFAULT_DISTANCE_METRIC.to_string()),
            threshold: raw.threshold,
            embedder: raw.embedder.unwrap_or_else(|| DEFAULT_EMBEDDER.to_string()),
            enforce_detection: raw.enforce_detection.unwrap_or(false),
            landmark_model: raw.landmark_model,
            encoder_model: raw.encoder_model,
            jitters: raw.jitters.unwrap_or(DEFAULT_JITTERS).max(1),
            request_timeout: Duration::from_secs(
                raw.request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS)
                    .max(1),
            ),
            max_body_bytes: raw.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
            allowed_origins: raw.allowed_origins.unwrap_or_default(),
            persist_cache: raw.persist_cache.unwrap_or(true),
        })
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            distance_metric: DEFAULT_DISTANCE_METRIC.to_string(),
            threshold: None,
            embedder: DEFAULT_EMBEDDER.to_string(),
            enforce_detection: false,
            landmark_model: None,
            encoder_model: None,
            jitters: DEFAULT_JITTERS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            allowed_origins: Vec::new(),
            persist_cache: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub contents: ConfigFile,
    pub source: PathBuf,
}

impl LoadedConfig {
    pub fn new(contents: ConfigFile, source: PathBuf) -> Self {
        Self { contents, source }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigWithSource {
    pub resolved: ResolvedConfig,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

pub fn default_paths() -> [PathBuf; 2] {
    [
        PathBuf::from(PRIMARY_CONFIG_PATH),
        PathBuf::from(SECONDARY_CONFIG_PATH),
    ]
}

pub fn load_resolved_config() -> Result<ResolvedConfigWithSource, ConfigError> {
    load_resolved_from_paths(&default_paths())
}

/// First readable file wins; missing files are skipped.
pub fn load_from_paths(paths: &[PathBuf]) -> Result<Option<LoadedConfig>, ConfigError> {
    for path in paths {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let parsed =
                    toml::from_str::<ConfigFile>(&contents).map_err(|err| ConfigError::Parse {
                        path: path.clone(),
                        message: err.to_string(),
                    })?;
                return Ok(Some(LoadedConfig::new(parsed, path.clone())));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.clone(),
                    source: err,
                })
            }
        }
    }

    Ok(None)
}

pub fn load_resolved_from_paths(
    paths: &[PathBuf],
) -> Result<ResolvedConfigWithSource, ConfigError> {
    match load_from_paths(paths)? {
        Some(entry) => {
            let path = entry.source.clone();
            Ok(ResolvedConfigWithSource {
                resolved: ResolvedConfig::from_raw(entry.contents)?,
                source: Some(path),
            })
        }
        None => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::default(),
            source: None,
        }),
    }
}
