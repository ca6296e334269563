use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use instapay_core::DomainError;
use instapay_infra::command_dispatcher::DispatchError;
use instapay_infra::projections::QueryError;
use instapay_infra::registry::RegistryError;

/// Error code and message as sent in an `error` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    pub code: &'static str,
    pub message: String,
}

impl WireError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub fn domain_error(err: &DomainError) -> WireError {
    let code = match err {
        DomainError::StatusMismatch { .. } => "status_mismatch",
        DomainError::PermissionDenied(_) => "permission_denied",
        DomainError::NotFound(_) => "not_found",
        DomainError::Validation(_) | DomainError::InvalidId(_) => "validation_error",
    };
    WireError::new(code, err.to_string())
}

pub fn dispatch_error(err: &DispatchError) -> WireError {
    match err {
        DispatchError::Domain(e) => domain_error(e),
        // Lost optimistic race; the client retries.
        DispatchError::Concurrency(_) | DispatchError::Deserialize(_) | DispatchError::Store(_) => {
            error!(error = %err, "command failed");
            WireError::new("internal", err.to_string())
        }
    }
}

pub fn registry_error(err: &RegistryError) -> WireError {
    match err {
        RegistryError::NotFound(what) => WireError::new("not_found", format!("{what} is not registered")),
        RegistryError::Storage(_) => {
            error!(error = %err, "key registry failed");
            WireError::new("internal", err.to_string())
        }
    }
}

pub fn query_unavailable(err: &QueryError) -> axum::response::Response {
    error!(error = %err, "transaction query failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
