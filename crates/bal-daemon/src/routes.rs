//! Axum router and all HTTP handlers for bal-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests
//! under `tests/` can compose the router directly.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bal_outbox::EnqueueError;
use bal_schemas::MutationRequest;
use tracing::info;

use crate::{
    api_types::{BalanceResponse, ErrorResponse, HealthResponse, MutateRequestBody, MutateResponse},
    state::{uptime_secs, AppState},
};

/// Build the complete application router wired to the given shared state.
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/balances/mutate", post(mutate))
        .route("/v1/balances/:account_id/:currency", get(balance))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
            uptime_secs: uptime_secs(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/balances/:account_id/:currency
// ---------------------------------------------------------------------------

pub(crate) async fn balance(State(st): State<Arc<AppState>>, Path((account_id, currency)): Path<(i64, String)>) -> Response {
    match st.balance_store.balance(account_id, &currency).await {
        Ok(Some(snap)) => (StatusCode::OK, Json(BalanceResponse::from(snap))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("BAL_NOT_FOUND: no balance for account_id={account_id} currency={currency}"),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: e.to_string() }),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/balances/mutate
// ---------------------------------------------------------------------------

pub(crate) async fn mutate(State(st): State<Arc<AppState>>, Json(body): Json<MutateRequestBody>) -> Response {
    let request = MutationRequest {
        transaction_id: body.transaction_id,
        account_id: body.account_id,
        partition_key: body.partition_key,
        currency: body.currency,
        kind: body.kind,
        amount: body.amount,
        description: body.description,
        metadata: body.metadata,
    };

    match st.balance_store.submit(&request).await {
        Ok(event_id) => {
            info!(event_id = %event_id, transaction_id = %request.transaction_id, "mutation accepted");
            (StatusCode::OK, Json(MutateResponse { event_id })).into_response()
        }
        Err(EnqueueError::Validation(e)) => {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: e.to_string() })).into_response()
        }
        Err(EnqueueError::Duplicate) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "BAL_DUPLICATE: transaction_id already present".to_string(),
            }),
        )
            .into_response(),
        Err(EnqueueError::Transient(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse { error: e.to_string() }),
        )
            .into_response(),
    }
}
