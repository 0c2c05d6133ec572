use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use facegate_core::faces::open_identity_service;
use facegate_server::cli::Cli;
use facegate_server::errors::{ServerError, ServerResult};
use facegate_server::routes::{build_router, AppState};
use facegate_server::settings::{load_config, resolve_settings};
use facegate_server::telemetry::init_tracing;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            err.exit_code()
        }
    }
}

async fn run(cli: Cli) -> ServerResult<()> {
    let config = load_config(cli.config.as_deref())?;
    match &config.source {
        Some(path) => info!(path = %path.display(), "loaded configuration"),
        None => info!("no configuration file found; using defaults"),
    }
    let settings = resolve_settings(&cli, config.resolved)?;

    let service = Arc::new(open_identity_service(&settings.service)?);
    {
        let service = Arc::clone(&service);
        tokio::task::spawn_blocking(move || service.warm_up());
    }

    let app = build_router(
        AppState::new(service, settings.router.request_timeout),
        &settings.router,
    );
    let listener = TcpListener::bind(settings.listen_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: settings.listen_addr,
            source,
        })?;
    info!(addr = %settings.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::Serve)?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
