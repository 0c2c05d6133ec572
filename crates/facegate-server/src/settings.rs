use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::http::HeaderValue;
use facegate_config::{
    load_resolved_config, load_resolved_from_paths, ResolvedConfig, ResolvedConfigWithSource,
};
use facegate_core::faces::{
    DistanceMetric, EmbedderKind, EmbedderSettings, EnvStoreDirResolver, ServiceConfig,
    StoreDirResolver,
};

use crate::cli::Cli;
use crate::errors::{ServerError, ServerResult};

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    /// Empty allows any origin.
    pub allowed_origins: Vec<HeaderValue>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_addr: SocketAddr,
    pub router: RouterOptions,
    pub service: ServiceConfig,
}

/// An explicit `--config` must exist; otherwise the default locations are searched.
pub fn load_config(explicit: Option<&Path>) -> ServerResult<ResolvedConfigWithSource> {
    match explicit {
        Some(path) if !path.exists() => Err(ServerError::ConfigMissing {
            path: path.to_path_buf(),
        }),
        Some(path) => Ok(load_resolved_from_paths(&[path.to_path_buf()])?),
        None => Ok(load_resolved_config()?),
    }
}

pub fn resolve_settings(cli: &Cli, file: ResolvedConfig) -> ServerResult<ServerSettings> {
    resolve_settings_with(cli, file, &EnvStoreDirResolver)
}

/// Flags override the file; the store resolver handles the environment and the default.
pub fn resolve_settings_with<R: StoreDirResolver>(
    cli: &Cli,
    file: ResolvedConfig,
    resolver: &R,
) -> ServerResult<ServerSettings> {
    let metric = file
        .distance_metric
        .parse::<DistanceMetric>()
        .map_err(|message| ServerError::InvalidSetting {
            key: "distance_metric",
            message,
        })?;
    let kind = file
        .embedder
        .parse::<EmbedderKind>()
        .map_err(|message| ServerError::InvalidSetting {
            key: "embedder",
            message,
        })?;

    let threshold = cli.threshold.or(file.threshold);
    if let Some(value) = threshold {
        if !value.is_finite() || value < 0.0 {
            return Err(ServerError::InvalidSetting {
                key: "threshold",
                message: format!("expected a non-negative number, found {value}"),
            });
        }
    }

    let allowed_origins = file
        .allowed_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|err| ServerError::InvalidSetting {
                key: "allowed_origins",
                message: format!("{origin}: {err}"),
            })
        })
        .collect::<ServerResult<Vec<_>>>()?;

    let override_dir = cli.storage_dir.as_deref().or(file.storage_dir.as_deref());
    let storage_dir = resolver.resolve(override_dir);

    Ok(ServerSettings {
        listen_addr: cli.listen.unwrap_or(file.listen_addr),
        router: RouterOptions {
            request_timeout: file.request_timeout,
            max_body_bytes: file.max_body_bytes,
            allowed_origins,
        },
        service: ServiceConfig {
            storage_dir,
            embedder: EmbedderSettings {
                kind,
                enforce_detection: file.enforce_detection,
                landmark_model: file.landmark_model,
                encoder_model: file.encoder_model,
                jitters: file.jitters,
            },
            metric,
            threshold,
            persist_cache: file.persist_cache,
            // Left to the request timeout: an abandoned rebuild still finishes and installs.
            rebuild_timeout: None,
        },
    })
}
