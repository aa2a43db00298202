//! Builders for `MutationRequest`s with sensible scenario-test defaults.

use bal_schemas::{LogEnvelope, MutationKind, MutationRequest};
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

fn base(transaction_id: &str, account_id: i64, kind: MutationKind, amount: Decimal) -> MutationRequest {
    MutationRequest {
        transaction_id: transaction_id.to_string(),
        account_id,
        partition_key: format!("acct-{account_id}"),
        currency: "USD".to_string(),
        kind,
        amount,
        description: None,
        metadata: serde_json::Value::Null,
    }
}

pub fn deposit(transaction_id: &str, account_id: i64, amount: Decimal) -> MutationRequest {
    base(transaction_id, account_id, MutationKind::Deposit, amount)
}

pub fn withdraw(transaction_id: &str, account_id: i64, amount: Decimal) -> MutationRequest {
    base(transaction_id, account_id, MutationKind::Withdraw, amount)
}

pub fn freeze(transaction_id: &str, account_id: i64, amount: Decimal) -> MutationRequest {
    base(transaction_id, account_id, MutationKind::Freeze, amount)
}

pub fn unfreeze(transaction_id: &str, account_id: i64, amount: Decimal) -> MutationRequest {
    base(transaction_id, account_id, MutationKind::Unfreeze, amount)
}

/// A transfer out of `account_id`. The counter-deposit on the receiving
/// partition is a separate, independently submitted request; this builder
/// only covers the source-side leg.
pub fn transfer(transaction_id: &str, account_id: i64, amount: Decimal) -> MutationRequest {
    base(transaction_id, account_id, MutationKind::Transfer, amount)
}

/// Wrap a request as the envelope the consumer reads off the log, as if it
/// had just been published by the outbox.
pub fn envelope_for(request: &MutationRequest) -> LogEnvelope {
    LogEnvelope {
        event_id: Uuid::new_v4(),
        transaction_id: request.transaction_id.clone(),
        partition_key: request.partition_key.clone(),
        published_at: Utc::now(),
        payload: request.clone(),
    }
}
