use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use teamcloud_commands::CommandResult;
use teamcloud_core::CommandId;

use crate::app::errors::json_error;
use crate::app::AppServices;

/// Completion posted back by an asynchronous provider.
pub async fn complete(
    Extension(services): Extension<Arc<AppServices>>,
    Path(command_id): Path<CommandId>,
    Json(result): Json<CommandResult>,
) -> Response {
    if result.command_id != command_id {
        return json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("result of command {} posted for {command_id}", result.command_id),
        );
    }

    if services.engine.complete(command_id, result) {
        StatusCode::ACCEPTED.into_response()
    } else {
        json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no command {command_id} is waiting for a callback"),
        )
    }
}
