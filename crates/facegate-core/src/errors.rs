use std::io;
use std::path::PathBuf;
use std::time::Duration;

use image::ImageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid image data: {message}")]
    InvalidImage { message: String },

    #[error("failed to decode image: {source}")]
    ImageDecode {
        #[source]
        source: ImageError,
    },

    #[error("invalid identity '{identity}': {message}")]
    InvalidIdentity { identity: String, message: String },

    #[error("no face detected in image")]
    NoFaceDetected,

    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    Transient {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("missing {kind} model; set {key} in the configuration or ${env}")]
    MissingModel {
        kind: &'static str,
        key: &'static str,
        env: &'static str,
    },

    #[error("failed to load model {path}: {message}")]
    ModelLoad { path: PathBuf, message: String },

    #[error("failed to encode reference image: {0}")]
    ImageEncode(String),

    #[error("representation cache artifact {path} is invalid: {message}")]
    CacheArtifact { path: PathBuf, message: String },

    #[error("embedder '{embedder}' is not available in this build")]
    EmbedderUnavailable { embedder: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by request/response boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NoFace,
    Storage,
    Transient,
    Internal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::InvalidImage { .. } => ErrorKind::InvalidInput,
            AppError::ImageDecode { .. } => ErrorKind::InvalidInput,
            AppError::InvalidIdentity { .. } => ErrorKind::InvalidInput,
            AppError::NoFaceDetected => ErrorKind::NoFace,
            AppError::Storage { .. } => ErrorKind::Storage,
            AppError::CacheArtifact { .. } => ErrorKind::Storage,
            AppError::Transient { .. } => ErrorKind::Transient,
            _ => ErrorKind::Internal,
        }
    }

    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        AppError::Storage {
            path: path.into(),
            source,
        }
    }

    pub fn human_message(&self) -> String {
        self.to_string()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_classify_as_invalid_input() {
        let err = AppError::InvalidImage {
            message: "not base64".into(),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = AppError::InvalidIdentity {
            identity: String::new(),
            message: "identity cannot be empty".into(),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn transient_message_reports_timeout() {
        let err = AppError::Transient {
            operation: "verify",
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.to_string(), "verify timed out after 1500ms");
    }

    #[test]
    fn storage_helper_keeps_path() {
        let err = AppError::storage(
            "/srv/faces/alice",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        match &err {
            AppError::Storage { path, .. } => assert_eq!(path, &PathBuf::from("/srv/faces/alice")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
