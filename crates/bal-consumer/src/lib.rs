//! The partition consumer: single-writer-per-partition batch processing
//! over the durable log, backed by an in-memory working set and committed
//! atomically through `bal_db::batch::commit_batch`.
//!
//! One instance owns exactly one partition while it holds that partition's
//! lease. Everything here assumes serialized access — no two consumers for
//! the same partition run this loop concurrently, which is what makes the
//! in-memory working set safe to read-modify-write without locking.

use bal_config::BatchConfig;
use bal_db::batch::{BatchMutationOutcome, CommitError};
use bal_lease::LeaseGuard;
use bal_log::{LogConsumer, RawRecord};
use bal_schemas::{BalanceSnapshot, LedgerStatus, LogEnvelope, MutationKind};
use bal_snapshot::SnapshotUpdater;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-partition in-memory (account, currency) -> balance cache. Populated
/// lazily on first touch within a running process; authoritative values
/// always come from the relational store, this is purely an accelerator.
#[derive(Default)]
pub struct WorkingSet {
    cache: HashMap<(i64, String), BalanceSnapshot>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cached snapshot, if any. Does not touch the database.
    pub fn peek(&self, account_id: i64, currency: &str) -> Option<&BalanceSnapshot> {
        self.cache.get(&(account_id, currency.to_string()))
    }

    /// Authoritative balance for (account, currency): cached value if
    /// present, otherwise a DB read that seeds the cache (zero balance if
    /// the account has never been touched).
    pub async fn get_or_load(
        &mut self,
        pool: &PgPool,
        account_id: i64,
        currency: &str,
    ) -> anyhow::Result<BalanceSnapshot> {
        let key = (account_id, currency.to_string());
        if let Some(snap) = self.cache.get(&key) {
            return Ok(snap.clone());
        }
        let snap = bal_db::balance_fetch(pool, account_id, currency)
            .await?
            .unwrap_or_else(|| BalanceSnapshot::zero(account_id, currency, Utc::now()));
        self.cache.insert(key, snap.clone());
        Ok(snap)
    }

    /// Apply a committed batch's outcomes: only `Success` rows mutate a
    /// balance, so the cache stays exactly in step with what the database
    /// just durably committed.
    pub fn apply_committed(&mut self, outcomes: &[BatchMutationOutcome]) {
        for o in outcomes {
            if o.status != LedgerStatus::Success {
                continue;
            }
            let key = (o.account_id, o.currency_code.clone());
            let entry = self.cache.entry(key).or_insert_with(|| {
                BalanceSnapshot::zero(o.account_id, o.currency_code.clone(), Utc::now())
            });
            entry.available = o.available_after;
            entry.frozen = o.frozen_after;
            entry.version += 1;
            entry.updated_at = Utc::now();
        }
    }
}

/// Compute `(available_after, frozen_after, status, error_message)` for one
/// mutation against its pre-image. Never touches the database; the caller
/// commits the whole batch's outcomes in one transaction.
pub fn compute_outcome(
    kind: MutationKind,
    amount: Decimal,
    before: &BalanceSnapshot,
) -> (Decimal, Decimal, LedgerStatus, Option<String>) {
    match kind {
        MutationKind::Deposit => (before.available + amount, before.frozen, LedgerStatus::Success, None),
        MutationKind::Withdraw | MutationKind::Transfer => {
            if before.available >= amount {
                (before.available - amount, before.frozen, LedgerStatus::Success, None)
            } else {
                (
                    before.available,
                    before.frozen,
                    LedgerStatus::Failed,
                    Some("insufficient available balance".to_string()),
                )
            }
        }
        MutationKind::Freeze => {
            if before.available >= amount {
                (before.available - amount, before.frozen + amount, LedgerStatus::Success, None)
            } else {
                (
                    before.available,
                    before.frozen,
                    LedgerStatus::Failed,
                    Some("insufficient available balance to freeze".to_string()),
                )
            }
        }
        MutationKind::Unfreeze => {
            if before.frozen >= amount {
                (before.available + amount, before.frozen - amount, LedgerStatus::Success, None)
            } else {
                (
                    before.available,
                    before.frozen,
                    LedgerStatus::Failed,
                    Some("insufficient frozen balance to unfreeze".to_string()),
                )
            }
        }
    }
}

/// One drained batch, already deduplicated against the ledger and computed
/// against the working set, ready for `commit_batch`.
pub struct PreparedBatch {
    pub outcomes: Vec<BatchMutationOutcome>,
    pub up_to_offset: i64,
    pub malformed: Vec<(RawRecord, bal_log::ParseError)>,
}

/// Drain up to `config.max_records` parsed envelopes from `consumer`,
/// waiting at most `config.max_latency_ms` total for the batch to fill.
/// Malformed records are set aside rather than blocking the partition.
pub async fn poll_batch(
    consumer: &dyn LogConsumer,
    config: &BatchConfig,
) -> anyhow::Result<(Vec<(RawRecord, LogEnvelope)>, Vec<(RawRecord, bal_log::ParseError)>, Option<i64>)> {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(config.max_latency_ms);
    let mut parsed = Vec::new();
    let mut malformed = Vec::new();
    let mut last_offset = None;

    while parsed.len() < config.max_records as usize {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let poll_timeout = remaining.min(Duration::from_millis(config.long_poll_ms));
        match consumer.poll(poll_timeout).await? {
            None => break,
            Some(record) => {
                last_offset = Some(record.offset);
                match record.parse() {
                    Ok(envelope) => parsed.push((record, envelope)),
                    Err(e) => malformed.push((record, e)),
                }
            }
        }
    }

    Ok((parsed, malformed, last_offset))
}

/// Dedup against the ledger, then compute each surviving record's outcome
/// against the working set. Records whose `transaction_id` is already
/// terminal are dropped silently (the exactly-once substrate: the earlier
/// attempt already produced the authoritative outcome).
///
/// Two or more records touching the same (account, currency) within one
/// batch are folded sequentially: the second record's `before` is the
/// first's `after`, not the pre-batch snapshot, so ledger chaining holds
/// even before the batch is durably committed. That folded state lives in
/// a local overlay and is never written into `working_set` directly — only
/// `apply_committed`, called after the commit succeeds, does that — so a
/// rolled-back batch leaves the real working set untouched.
pub async fn prepare_batch(
    pool: &PgPool,
    working_set: &mut WorkingSet,
    records: Vec<(RawRecord, LogEnvelope)>,
) -> anyhow::Result<Vec<BatchMutationOutcome>> {
    let transaction_ids: Vec<String> = records.iter().map(|(_, e)| e.transaction_id.clone()).collect();
    let already_terminal = bal_db::ledger_fetch_terminal_many(pool, &transaction_ids).await?;
    let seen: std::collections::HashSet<String> =
        already_terminal.into_iter().map(|r| r.transaction_id).collect();

    let mut pending: HashMap<(i64, String), BalanceSnapshot> = HashMap::new();
    let mut outcomes = Vec::with_capacity(records.len());
    for (_, envelope) in records {
        if seen.contains(&envelope.transaction_id) {
            continue;
        }
        let req = &envelope.payload;
        let key = (req.account_id, req.currency.clone());
        let before = match pending.get(&key) {
            Some(snap) => snap.clone(),
            None => working_set.get_or_load(pool, req.account_id, &req.currency).await?,
        };
        let (available_after, frozen_after, status, error_message) =
            compute_outcome(req.kind, req.amount, &before);

        let mut folded = before.clone();
        folded.available = available_after;
        folded.frozen = frozen_after;
        pending.insert(key, folded);

        outcomes.push(BatchMutationOutcome {
            transaction_id: req.transaction_id.clone(),
            account_id: req.account_id,
            currency_code: req.currency.clone(),
            kind: req.kind,
            amount: req.amount,
            available_before: before.available,
            available_after,
            frozen_before: before.frozen,
            frozen_after,
            status,
            error_message,
        });
    }
    Ok(outcomes)
}

/// One partition's end-to-end processing loop: poll a batch, dedup +
/// compute, commit under the fenced lease, and fold the committed outcomes
/// back into the working set. Returns `Ok(None)` when nothing was available
/// to poll (caller should loop again), `Ok(Some(count))` with the number of
/// records committed, or `Err(CommitError::LeaseLost(_))` when the caller
/// must stop owning this partition.
pub struct PartitionRunner {
    pub pool: PgPool,
    pub lease: Arc<dyn LeaseGuard>,
    pub holder_id: String,
    pub partition: i32,
    pub topic: String,
    pub consumer_group: String,
    pub batch: BatchConfig,
    pub working_set: WorkingSet,
    /// Best-effort fan-out of freshly committed balances to the external
    /// cache. `None` when no cache was reachable at startup — reads simply
    /// fall back to the relational store, per the snapshot updater's
    /// failure semantics.
    pub snapshot_updater: Option<Arc<SnapshotUpdater>>,
}

impl PartitionRunner {
    /// Read the last committed offset and reposition `consumer` to resume
    /// immediately after it. A partition never seen before yields `-1`,
    /// which `seek_to` treats as "start from the beginning".
    pub async fn recover(&self, consumer: &dyn LogConsumer) -> anyhow::Result<i64> {
        let offset = bal_db::offset_fetch(&self.pool, &self.consumer_group, &self.topic, &self.partition.to_string()).await?;
        consumer.seek_to(&self.topic, self.partition, offset)?;
        Ok(offset)
    }

    pub async fn process_once(&mut self, consumer: &dyn LogConsumer) -> Result<Option<usize>, CommitError> {
        let (records, malformed, last_offset) = poll_batch(consumer, &self.batch)
            .await
            .map_err(CommitError::from)?;

        for (raw, err) in &malformed {
            tracing::warn!(offset = raw.offset, error = %err, "malformed record routed to dead-letter topic");
        }

        let Some(up_to_offset) = last_offset else {
            return Ok(None);
        };
        if records.is_empty() {
            return Ok(Some(0));
        }

        let outcomes = prepare_batch(&self.pool, &mut self.working_set, records)
            .await
            .map_err(CommitError::from)?;

        let Some(fencing_token) = self.lease.fencing_token() else {
            return Err(CommitError::LeaseLost(self.partition.to_string()));
        };

        bal_db::batch::commit_batch(
            &self.pool,
            &self.partition.to_string(),
            &self.holder_id,
            fencing_token,
            &self.consumer_group,
            &self.topic,
            up_to_offset,
            &outcomes,
        )
        .await?;

        self.working_set.apply_committed(&outcomes);
        self.route_to_snapshot_updater(&outcomes).await;
        Ok(Some(outcomes.len()))
    }

    /// Push every successfully committed outcome to the cache fan-out.
    /// Best-effort: a routing failure is logged, not propagated — the
    /// relational store just committed these values and stays authoritative.
    async fn route_to_snapshot_updater(&self, outcomes: &[BatchMutationOutcome]) {
        let Some(updater) = &self.snapshot_updater else {
            return;
        };
        for o in outcomes {
            if o.status != LedgerStatus::Success {
                continue;
            }
            let Some(snap) = self.working_set.peek(o.account_id, &o.currency_code) else {
                continue;
            };
            if let Err(e) = updater.route(snap.clone()).await {
                tracing::warn!(
                    partition = self.partition,
                    account_id = o.account_id,
                    currency = %o.currency_code,
                    error = %e,
                    "failed to route committed balance to snapshot updater"
                );
            }
        }
    }
}
