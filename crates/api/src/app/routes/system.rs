use axum::{Json, response::IntoResponse};
use serde_json::json;

use crate::context::BankContext;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn whoami(axum::extract::Extension(bank): axum::extract::Extension<BankContext>) -> impl IntoResponse {
    Json(json!({ "bank_id": bank.bank_id().to_string() }))
}
