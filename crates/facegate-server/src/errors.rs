use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use facegate_config::ConfigError;
use facegate_core::errors::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("configuration file {path} does not exist")]
    ConfigMissing { path: PathBuf },

    #[error("invalid setting {key}: {message}")]
    InvalidSetting { key: &'static str, message: String },

    #[error(transparent)]
    Core(#[from] AppError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

impl ServerError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ServerError::Config(_) => ExitCode::from(2),
            ServerError::ConfigMissing { .. } => ExitCode::from(2),
            ServerError::InvalidSetting { .. } => ExitCode::from(2),
            ServerError::Core(AppError::MissingModel { .. }) => ExitCode::from(2),
            ServerError::Core(AppError::ModelLoad { .. }) => ExitCode::from(2),
            ServerError::Core(AppError::EmbedderUnavailable { .. }) => ExitCode::from(2),
            ServerError::Bind { .. } => ExitCode::from(3),
            _ => ExitCode::from(1),
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
