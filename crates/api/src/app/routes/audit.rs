use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    response::{IntoResponse, Response},
    Json,
};
use futures::TryStreamExt;

use teamcloud_core::OrganizationId;
use teamcloud_infra::audit::CommandAuditEntity;

use crate::app::dto::AuditListQuery;
use crate::app::errors::audit_error_to_response;
use crate::app::AppServices;

/// Audit rows of an organization, newest first.
pub async fn list(
    Extension(services): Extension<Arc<AppServices>>,
    Path(org): Path<OrganizationId>,
    Query(query): Query<AuditListQuery>,
) -> Response {
    let rows: Result<Vec<CommandAuditEntity>, _> = services
        .audit
        .list(org, &query.to_audit_query())
        .try_collect()
        .await;

    match rows {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => audit_error_to_response(e),
    }
}
