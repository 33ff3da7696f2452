use axum::{
    routing::{get, post},
    Router,
};

pub mod audit;
pub mod callbacks;
pub mod commands;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/orgs/:org/commands", post(commands::submit))
        .route("/orgs/:org/commands/:command_id", get(commands::status))
        .route("/orgs/:org/audit", get(audit::list))
        .route("/callbacks/:command_id", post(callbacks::complete))
}
