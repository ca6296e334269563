use axum::{Router, routing::get};

pub mod commands;
pub mod streams;
pub mod system;
pub mod transactions;

/// Router for all authenticated (bank-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/commands/:channel", get(commands::command_channel))
        .route("/streams/:kind", get(streams::event_channel))
        .route("/transactions", get(transactions::list_transactions))
        .route("/transactions/:id", get(transactions::get_transaction))
}
