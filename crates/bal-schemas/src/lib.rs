//! Wire and domain record types shared across the balance engine.
//!
//! Every record here is explicit and versioned rather than an untyped map:
//! `kind` is a real enum, amounts are exact decimals, and `metadata` is the
//! one opaque extension point. Serialization is self-describing (serde_json)
//! and round-trippable.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of balance mutation a client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Deposit,
    Withdraw,
    Freeze,
    Unfreeze,
    /// Modeled as a withdraw on the source partition; the counter-deposit is
    /// an independent `Deposit` mutation submitted on the target partition.
    /// Cross-account atomicity is not provided.
    Transfer,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::Deposit => "deposit",
            MutationKind::Withdraw => "withdraw",
            MutationKind::Freeze => "freeze",
            MutationKind::Unfreeze => "unfreeze",
            MutationKind::Transfer => "transfer",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client-submitted mutation request. `transaction_id` is the globally
/// unique, client-supplied idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub transaction_id: String,
    pub account_id: i64,
    /// The value the log is partitioned by; stable per account.
    pub partition_key: String,
    pub currency: String,
    pub kind: MutationKind,
    pub amount: Decimal,
    pub description: Option<String>,
    /// Reserved opaque extension field. Never interpreted by the core.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl MutationRequest {
    /// Structural validation only (no DB access): amount must be positive,
    /// transaction_id and currency must be non-empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.transaction_id.trim().is_empty() {
            return Err(ValidationError::new("transaction_id must not be empty"));
        }
        if self.currency.trim().is_empty() {
            return Err(ValidationError::new("currency must not be empty"));
        }
        if self.partition_key.trim().is_empty() {
            return Err(ValidationError::new("partition_key must not be empty"));
        }
        if self.amount <= Decimal::ZERO {
            return Err(ValidationError::new("amount must be > 0"));
        }
        Ok(())
    }
}

/// Terminal and non-terminal states of one mutation's processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Init,
    Processing,
    Success,
    Failed,
}

impl LedgerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, LedgerStatus::Success | LedgerStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LedgerStatus::Init => "init",
            LedgerStatus::Processing => "processing",
            LedgerStatus::Success => "success",
            LedgerStatus::Failed => "failed",
        }
    }
}

/// One terminal record of a mutation's outcome. Unique on `transaction_id`;
/// this is the idempotency substrate of the whole system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub transaction_id: String,
    pub account_id: i64,
    pub currency: String,
    pub kind: MutationKind,
    pub amount: Decimal,
    pub available_before: Decimal,
    pub available_after: Decimal,
    pub frozen_before: Decimal,
    pub frozen_after: Decimal,
    pub status: LedgerStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A committed (account, currency) balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub account_id: i64,
    pub currency: String,
    pub available: Decimal,
    pub frozen: Decimal,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    pub fn zero(account_id: i64, currency: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            currency: currency.into(),
            available: Decimal::ZERO,
            frozen: Decimal::ZERO,
            version: 0,
            updated_at: at,
        }
    }
}

/// Delivery status of one outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// A persisted "to-publish" row. Unique on `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub event_id: Uuid,
    pub topic: String,
    pub partition_key: String,
    pub payload: MutationRequest,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Self-describing envelope published to the durable log. Headers (event id,
/// transaction id) ride alongside the payload so consumers can dedupe and
/// trace without deserializing the payload first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEnvelope {
    pub event_id: Uuid,
    pub transaction_id: String,
    pub partition_key: String,
    pub published_at: DateTime<Utc>,
    pub payload: MutationRequest,
}

/// Wrapper written to the dead-letter topic. Carries enough of the original
/// record to replay or inspect it without access to the original topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub original_topic: String,
    pub original_offset: i64,
    pub original_key: String,
    pub original_value_bytes: Vec<u8>,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub error_kind: String,
    pub error_message: String,
}

/// A structural validation failure, distinguished from infrastructure errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BAL_VALIDATION_ERROR: {}", self.0)
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(amount: Decimal) -> MutationRequest {
        MutationRequest {
            transaction_id: "t1".into(),
            account_id: 1,
            partition_key: "acct-1".into(),
            currency: "USDT".into(),
            kind: MutationKind::Deposit,
            amount,
            description: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn rejects_non_positive_amount() {
        assert!(req(Decimal::ZERO).validate().is_err());
        assert!(req(Decimal::new(-1, 0)).validate().is_err());
    }

    #[test]
    fn accepts_positive_amount() {
        assert!(req(Decimal::new(100, 0)).validate().is_ok());
    }

    #[test]
    fn rejects_empty_transaction_id() {
        let mut r = req(Decimal::new(100, 0));
        r.transaction_id = "  ".into();
        assert!(r.validate().is_err());
    }

    #[test]
    fn ledger_status_terminal() {
        assert!(LedgerStatus::Success.is_terminal());
        assert!(LedgerStatus::Failed.is_terminal());
        assert!(!LedgerStatus::Init.is_terminal());
        assert!(!LedgerStatus::Processing.is_terminal());
    }

    #[test]
    fn round_trips_through_json() {
        let r = req(Decimal::new(12345, 2));
        let s = serde_json::to_string(&r).unwrap();
        let back: MutationRequest = serde_json::from_str(&s).unwrap();
        assert_eq!(r, back);
    }
}
