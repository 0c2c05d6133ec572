use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use facegate_core::decode::decode_base64_payload;
use facegate_core::errors::{AppError, AppResult};
use facegate_core::faces::{
    EnrollmentOutcome, FaceEmbedder, IdentityService, IdentityStore, VerifyOutcome,
};
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info_span, warn, Span};
use uuid::Uuid;

use crate::response::{ApiReply, ApiResponse, Endpoint};
use crate::settings::RouterOptions;

/// What the HTTP layer needs from the engine.
pub trait FaceService: Send + Sync + 'static {
    fn verify(&self, image: &[u8]) -> AppResult<VerifyOutcome>;
    fn enroll(&self, identity: &str, image: &[u8]) -> AppResult<EnrollmentOutcome>;
}

impl<S, E> FaceService for IdentityService<S, E>
where
    S: IdentityStore + 'static,
    E: FaceEmbedder + 'static,
{
    fn verify(&self, image: &[u8]) -> AppResult<VerifyOutcome> {
        IdentityService::verify(self, image)
    }

    fn enroll(&self, identity: &str, image: &[u8]) -> AppResult<EnrollmentOutcome> {
        IdentityService::enroll(self, identity, image).map(|outcome| {
            for line in &outcome.logs {
                tracing::debug!("{line}");
            }
            outcome
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    service: Arc<dyn FaceService>,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(service: Arc<dyn FaceService>, request_timeout: Duration) -> Self {
        Self {
            service,
            request_timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub image: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub image: String,
    pub email: String,
}

pub fn build_router(state: AppState, options: &RouterOptions) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/verify", post(verify))
        .route("/register", post(register))
        .layer(DefaultBodyLimit::max(options.max_body_bytes))
        .layer(cors_layer(options))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            info_span!(
                "request",
                id = %Uuid::new_v4(),
                method = %request.method(),
                path = %request.uri().path(),
            )
        }))
        .with_state(state)
}

fn cors_layer(options: &RouterOptions) -> CorsLayer {
    if options.allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(options.allowed_origins.iter().cloned()))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn root() -> Json<ApiResponse> {
    Json(ApiResponse::running())
}

async fn verify(
    State(state): State<AppState>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> ApiReply {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return reject(rejection),
    };

    let result = run_blocking(&state, "verify", move |service| {
        let image = decode_base64_payload(&request.image)?;
        service.verify(&image)
    })
    .await;

    match result {
        Ok(outcome) => ApiReply::from_verify(outcome),
        Err(err) => error_reply(Endpoint::Verify, &err),
    }
}

async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiReply {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return reject(rejection),
    };

    let result = run_blocking(&state, "register", move |service| {
        let image = decode_base64_payload(&request.image)?;
        service.enroll(&request.email, &image)
    })
    .await;

    match result {
        Ok(outcome) => ApiReply::from_enroll(&outcome),
        Err(err) => error_reply(Endpoint::Register, &err),
    }
}

/// Runs engine work off the async workers, bounded by the request timeout.
///
/// A timed-out task keeps running to completion; cache rebuilds are atomic, so
/// it either installs a full snapshot or nothing.
async fn run_blocking<T, F>(state: &AppState, operation: &'static str, work: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn FaceService) -> AppResult<T> + Send + 'static,
{
    let service = Arc::clone(&state.service);
    let span = Span::current();
    let task = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        work(service.as_ref())
    });

    match tokio::time::timeout(state.request_timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => {
            error!(operation, error = %join_error, "worker task failed");
            Err(AppError::Internal(format!(
                "{operation} worker failed: {join_error}"
            )))
        }
        Err(_) => Err(AppError::Transient {
            operation,
            timeout: state.request_timeout,
        }),
    }
}

fn error_reply(endpoint: Endpoint, err: &AppError) -> ApiReply {
    let reply = ApiReply::from_error(endpoint, err);
    if reply.status.is_server_error() {
        error!(error = %err, "request failed");
    } else {
        warn!(error = %err, "request rejected");
    }
    reply
}

fn reject(rejection: JsonRejection) -> ApiReply {
    let status = match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    warn!(error = %rejection.body_text(), "malformed request body");
    ApiReply::rejected(status, rejection.body_text())
}
