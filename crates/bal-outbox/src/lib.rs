//! The transactional outbox: the DB is the single source of truth that "the
//! request exists"; log delivery is a separable, eventually-consistent
//! step reconciled by the sweeper.

use bal_config::RetryConfig;
use bal_log::{LogProducer, TOPIC_BALANCE_CHANGES};
use bal_schemas::{LogEnvelope, MutationRequest, ValidationError};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

/// Outcome of `enqueue`: distinguishes the client-visible duplicate signal
/// from everything else.
#[derive(Debug)]
pub enum EnqueueError {
    Validation(ValidationError),
    Duplicate,
    Transient(anyhow::Error),
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueError::Validation(e) => write!(f, "{e}"),
            EnqueueError::Duplicate => write!(f, "BAL_DUPLICATE: transaction_id already present"),
            EnqueueError::Transient(e) => write!(f, "BAL_TRANSIENT: {e}"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Insert the outbox row (authoritative) then best-effort publish to the
/// log. A publish failure does not surface to the caller — the DB commit
/// already happened, and the sweeper will retry. Returns the event id on
/// success; `Duplicate` if the transaction-id was already present.
pub async fn enqueue(
    pool: &PgPool,
    log: &dyn LogProducer,
    request: &MutationRequest,
) -> Result<Uuid, EnqueueError> {
    request.validate().map_err(EnqueueError::Validation)?;

    let event_id = Uuid::new_v4();
    let payload_json = serde_json::to_value(request)
        .map_err(|e| EnqueueError::Transient(anyhow::anyhow!("payload serialize: {e}")))?;

    let inserted = bal_db::outbox_enqueue(
        pool,
        event_id,
        TOPIC_BALANCE_CHANGES,
        &request.partition_key,
        payload_json,
    )
    .await
    .map_err(EnqueueError::Transient)?;

    if !inserted {
        return Err(EnqueueError::Duplicate);
    }

    let envelope = LogEnvelope {
        event_id,
        transaction_id: request.transaction_id.clone(),
        partition_key: request.partition_key.clone(),
        published_at: Utc::now(),
        payload: request.clone(),
    };

    match log
        .publish(TOPIC_BALANCE_CHANGES, &request.partition_key, &envelope)
        .await
    {
        Ok(()) => {
            let _ = bal_db::outbox_mark_sent(pool, event_id).await;
        }
        Err(e) => {
            tracing::warn!(event_id = %event_id, error = %e, "outbox publish failed, deferring to sweeper");
            let _ = bal_db::outbox_mark_failed(pool, event_id).await;
        }
    }

    Ok(event_id)
}

/// Bounded-retry republisher for rows stuck `pending` past a staleness
/// threshold, and `failed` rows under the retry cap. Rows that exhaust the
/// cap are escalated to the dead-letter topic and then fall out of future
/// sweeps (their `retry_count` already exceeds `max_retries`).
pub struct Sweeper<'a> {
    pool: &'a PgPool,
    log: &'a dyn LogProducer,
    retry: RetryConfig,
    stale_after: chrono::Duration,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub republished: u32,
    pub escalated_to_dlq: u32,
}

impl<'a> Sweeper<'a> {
    pub fn new(pool: &'a PgPool, log: &'a dyn LogProducer, retry: RetryConfig, stale_after: chrono::Duration) -> Self {
        Self {
            pool,
            log,
            retry,
            stale_after,
        }
    }

    pub async fn sweep_once(&self) -> anyhow::Result<SweepReport> {
        let rows = bal_db::outbox_list_sweepable(self.pool, self.stale_after, self.retry.max_retries as i32).await?;
        let mut report = SweepReport::default();

        for row in rows {
            let envelope = LogEnvelope {
                event_id: row.event_id,
                transaction_id: row.payload.transaction_id.clone(),
                partition_key: row.partition_key.clone(),
                published_at: Utc::now(),
                payload: row.payload.clone(),
            };

            match self.log.publish(&row.topic, &row.partition_key, &envelope).await {
                Ok(()) => {
                    bal_db::outbox_mark_sent(self.pool, row.event_id).await?;
                    report.republished += 1;
                }
                Err(e) => {
                    bal_db::outbox_mark_failed(self.pool, row.event_id).await?;
                    let next_retry_count = row.retry_count + 1;
                    if next_retry_count >= self.retry.max_retries as i32 {
                        let dlq_record = bal_schemas::DlqRecord {
                            original_topic: row.topic.clone(),
                            original_offset: -1,
                            original_key: row.partition_key.clone(),
                            original_value_bytes: serde_json::to_vec(&row.payload).unwrap_or_default(),
                            failed_at: Utc::now(),
                            retry_count: next_retry_count as u32,
                            error_kind: "BAL_TRANSIENT".to_string(),
                            error_message: e.to_string(),
                        };
                        self.log.publish_dlq(&self.retry.dlq_topic, &dlq_record).await?;
                        report.escalated_to_dlq += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_error_display_distinguishes_duplicate() {
        let msg = format!("{}", EnqueueError::Duplicate);
        assert!(msg.contains("BAL_DUPLICATE"));
    }
}
