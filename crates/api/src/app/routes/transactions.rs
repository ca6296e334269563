use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use instapay_core::AggregateId;
use instapay_infra::projections::{ListFilter, QueryError};
use instapay_transactions::TransactionId;

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::BankContext;

/// GET /transactions/:id
pub async fn get_transaction(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(bank): Extension<BankContext>,
    Path(id): Path<String>,
) -> Response {
    let id: AggregateId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid transaction id"),
    };

    match services.projection().find_for(bank.bank_id(), TransactionId::new(id)) {
        Ok(view) => Json(view).into_response(),
        Err(QueryError::NotFound) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "transaction not found"),
        Err(e @ QueryError::PermissionDenied) => {
            errors::json_error(StatusCode::FORBIDDEN, "permission_denied", e.to_string())
        }
        Err(e @ QueryError::Unavailable(_)) => errors::query_unavailable(&e),
    }
}

/// GET /transactions?created_after&sender&receiver&limit&skip
///
/// Newest first; only transactions where the caller is one of the two banks.
pub async fn list_transactions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(bank): Extension<BankContext>,
    Query(filter): Query<ListFilter>,
) -> Response {
    match services.projection().list_for(bank.bank_id(), &filter) {
        Ok(views) => Json(views).into_response(),
        Err(e) => errors::query_unavailable(&e),
    }
}
