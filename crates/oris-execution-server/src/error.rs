//! Maps the §7 error taxonomy onto HTTP status semantics (SPEC_FULL §6).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use oris_kernel::{ErrorKind, KernelError};
use serde_json::json;

/// Thin wrapper so `KernelError` can be returned directly from axum
/// handlers via `?` and get the right status code.
pub struct ApiError(pub KernelError);

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::PreconditionFailed => StatusCode::CONFLICT,
            ErrorKind::Contention => StatusCode::CONFLICT,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ExecutorError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// A request the caller sent that doesn't shape-check (SPEC_FULL §6: bad
/// request shapes -> 400), kept distinct from the kernel's own taxonomy
/// since it never reaches a store.
pub struct BadRequest(pub String);

impl IntoResponse for BadRequest {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(json!({ "error": self.0 }))).into_response()
    }
}
