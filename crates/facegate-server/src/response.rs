use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use facegate_core::errors::{AppError, ErrorKind};
use facegate_core::faces::{EnrollmentOutcome, VerifyOutcome};
use serde::{Deserialize, Serialize};

pub const RUNNING: &str = "Face Recognition Server Running";
pub const NO_MATCH: &str = "No match found";

/// JSON body shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiResponse {
    fn with_status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            user: None,
            distance: None,
            message: None,
        }
    }

    pub fn running() -> Self {
        Self::with_status(RUNNING)
    }

    pub fn matched(user: String, distance: f64) -> Self {
        Self {
            user: Some(user),
            distance: Some(distance),
            ..Self::with_status("success")
        }
    }

    pub fn registered(identity: &str) -> Self {
        Self {
            message: Some(format!("User {identity} registered")),
            ..Self::with_status("success")
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::with_status("failed")
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::with_status("error")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Verify,
    Register,
}

#[derive(Debug)]
pub struct ApiReply {
    pub status: StatusCode,
    pub body: ApiResponse,
}

impl ApiReply {
    pub fn ok(body: ApiResponse) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    pub fn from_verify(outcome: VerifyOutcome) -> Self {
        match (outcome.result.identity, outcome.result.distance) {
            (Some(user), Some(distance)) => Self::ok(ApiResponse::matched(user, distance)),
            _ => Self::ok(ApiResponse::failed(NO_MATCH)),
        }
    }

    pub fn from_enroll(outcome: &EnrollmentOutcome) -> Self {
        Self::ok(ApiResponse::registered(&outcome.identity))
    }

    /// Verify reports engine failures as `failed`; every other error is `error`.
    pub fn from_error(endpoint: Endpoint, err: &AppError) -> Self {
        let message = err.human_message();
        match (err.kind(), endpoint) {
            (ErrorKind::InvalidInput, _) => Self {
                status: StatusCode::BAD_REQUEST,
                body: ApiResponse::error(message),
            },
            (ErrorKind::Transient, _) => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: ApiResponse::error(message),
            },
            (ErrorKind::NoFace, Endpoint::Verify) => Self::ok(ApiResponse::failed(NO_MATCH)),
            (_, Endpoint::Verify) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: ApiResponse::failed(message),
            },
            (_, Endpoint::Register) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: ApiResponse::error(message),
            },
        }
    }

    pub fn rejected(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiResponse::error(message),
        }
    }
}

impl IntoResponse for ApiReply {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn optional_fields_are_omitted() {
        let body = serde_json::to_value(ApiResponse::failed(NO_MATCH)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"status": "failed", "message": "No match found"})
        );

        let body = serde_json::to_value(ApiResponse::matched("alice@example.com".into(), 0.1))
            .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"status": "success", "user": "alice@example.com", "distance": 0.1})
        );
    }

    #[test]
    fn registration_message_names_identity() {
        let body = ApiResponse::registered("bob@example.com");
        assert_eq!(body.message.as_deref(), Some("User bob@example.com registered"));
    }

    #[test]
    fn error_kinds_map_to_status_codes() {
        let invalid = AppError::InvalidImage {
            message: "payload is empty".into(),
        };
        let reply = ApiReply::from_error(Endpoint::Register, &invalid);
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.body.status, "error");

        let transient = AppError::Transient {
            operation: "verify",
            timeout: Duration::from_secs(1),
        };
        let reply = ApiReply::from_error(Endpoint::Verify, &transient);
        assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);

        let storage = AppError::storage(
            "/srv/faces",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let reply = ApiReply::from_error(Endpoint::Verify, &storage);
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(reply.body.status, "failed");
        let reply = ApiReply::from_error(Endpoint::Register, &storage);
        assert_eq!(reply.body.status, "error");
    }
}
