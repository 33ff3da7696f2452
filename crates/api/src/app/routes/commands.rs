use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use teamcloud_commands::Command;
use teamcloud_core::{CommandId, OrganizationId};

use crate::app::errors::{engine_error_to_response, json_error};
use crate::app::AppServices;

/// Accept a command; answers `200` with the final result when it finishes
/// within the sync wait, otherwise `202` pointing at the status endpoint.
pub async fn submit(
    Extension(services): Extension<Arc<AppServices>>,
    Path(org): Path<OrganizationId>,
    Json(command): Json<Command>,
) -> Response {
    if command.organization_id != org {
        return json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!(
                "command belongs to organization {}, not {org}",
                command.organization_id
            ),
        );
    }

    let command_id = command.command_id;
    let accepted = match services.engine.submit(command).await {
        Ok(result) => result,
        Err(e) => return engine_error_to_response(e),
    };

    let result = if services.sync_wait.is_zero() {
        accepted
    } else {
        match services.engine.wait(command_id, services.sync_wait).await {
            Ok(result) => result,
            Err(e) => return engine_error_to_response(e),
        }
    };

    if result.is_final() {
        return (StatusCode::OK, Json(result)).into_response();
    }

    let location = result
        .status_link()
        .map(str::to_string)
        .unwrap_or_else(|| format!("/orgs/{org}/commands/{command_id}"));
    (
        StatusCode::ACCEPTED,
        [(header::LOCATION, location)],
        Json(result),
    )
        .into_response()
}

pub async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Path((org, command_id)): Path<(OrganizationId, CommandId)>,
) -> Response {
    match services.engine.status(org, command_id).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => engine_error_to_response(e),
    }
}
