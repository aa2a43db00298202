//! Request and response types for the `bal-daemon` HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded by
//! Axum and decoded by tests. No business logic lives here.

use bal_schemas::{BalanceSnapshot, MutationKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub account_id: i64,
    pub currency: String,
    pub available: Decimal,
    pub frozen: Decimal,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<BalanceSnapshot> for BalanceResponse {
    fn from(s: BalanceSnapshot) -> Self {
        Self {
            account_id: s.account_id,
            currency: s.currency,
            available: s.available,
            frozen: s.frozen,
            version: s.version,
            updated_at: s.updated_at,
        }
    }
}

/// Body of `POST /v1/balances/mutate`. `transaction_id` is the caller's
/// idempotency key; resubmitting the same one is a no-op (`409`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutateRequestBody {
    pub transaction_id: String,
    pub account_id: i64,
    pub partition_key: String,
    pub currency: String,
    pub kind: MutationKind,
    pub amount: Decimal,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutateResponse {
    pub event_id: Uuid,
}
