use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use teamcloud_infra::audit::AuditError;
use teamcloud_infra::EngineError;

pub fn engine_error_to_response(err: EngineError) -> axum::response::Response {
    match err {
        EngineError::Validation(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        EngineError::Duplicate(id) => json_error(
            StatusCode::CONFLICT,
            "conflict",
            format!("command {id} was already submitted"),
        ),
        EngineError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("command {id} not found"))
        }
        EngineError::Journal(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        EngineError::Dispatch(e) => json_error(StatusCode::BAD_GATEWAY, "dispatch_error", e.to_string()),
        EngineError::Timeout { .. } => {
            json_error(StatusCode::GATEWAY_TIMEOUT, "timeout", err.to_string())
        }
        EngineError::NoRoute(_) | EngineError::Handler(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "processing_error", err.to_string())
        }
    }
}

pub fn audit_error_to_response(err: AuditError) -> axum::response::Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "audit_error", err.to_string())
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
