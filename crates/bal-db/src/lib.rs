//! Relational persistence for the balance engine: balances, the ledger
//! idempotency index, the transactional outbox, the fenced leader lease,
//! and consumer offsets.
//!
//! Every table here backs an invariant that must be verifiable from the
//! relational store alone: unique `transaction_id` on `ledger`, the
//! `available >= 0` / `frozen >= 0` check constraints on `balances`, and
//! the single-row-per-partition shape of `leader_lease` and
//! `consumer_offset`.

use anyhow::{anyhow, Context, Result};
use bal_schemas::{
    BalanceSnapshot, LedgerRow, LedgerStatus, MutationKind, OutboxRecord, OutboxStatus,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

pub const ENV_DB_URL: &str = "BAL_DATABASE_URL";

/// Connect to Postgres using `BAL_DATABASE_URL` with the pool shape named
/// in the configuration surface (max-conns / queue-limit / connect-timeout).
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url, &DbPoolSettings::default()).await
}

#[derive(Debug, Clone, Copy)]
pub struct DbPoolSettings {
    pub max_conns: u32,
    pub connect_timeout_ms: u64,
}

impl Default for DbPoolSettings {
    fn default() -> Self {
        Self {
            max_conns: 15,
            connect_timeout_ms: 5000,
        }
    }
}

pub async fn connect(url: &str, settings: &DbPoolSettings) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_conns)
        .acquire_timeout(std::time::Duration::from_millis(settings.connect_timeout_ms))
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_balances_table: bool,
}

pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from information_schema.tables
            where table_schema = 'public' and table_name = 'balances'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_balances_table: exists,
    })
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

pub async fn balance_fetch(
    pool: &PgPool,
    account_id: i64,
    currency_code: &str,
) -> Result<Option<BalanceSnapshot>> {
    let row = sqlx::query(
        r#"
        select account_id, available, frozen, version, updated_at
        from balances
        where account_id = $1 and currency_code = $2
        "#,
    )
    .bind(account_id)
    .bind(currency_code)
    .fetch_optional(pool)
    .await
    .context("balance_fetch failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(BalanceSnapshot {
        account_id: row.try_get("account_id")?,
        currency: currency_code.to_string(),
        available: row.try_get("available")?,
        frozen: row.try_get("frozen")?,
        version: row.try_get("version")?,
        updated_at: row.try_get("updated_at")?,
    }))
}

// ---------------------------------------------------------------------------
// Ledger (the idempotency index)
// ---------------------------------------------------------------------------

pub async fn ledger_fetch(pool: &PgPool, transaction_id: &str) -> Result<Option<LedgerRow>> {
    let row = sqlx::query(
        r#"
        select transaction_id, account_id, currency_code, kind, amount,
               available_before, available_after, frozen_before, frozen_after,
               status, error_message, created_at
        from ledger
        where transaction_id = $1
        "#,
    )
    .bind(transaction_id)
    .fetch_optional(pool)
    .await
    .context("ledger_fetch failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(row_to_ledger_row(row)?))
}

/// Batch variant used by the consumer's dedup pass: given the
/// transaction-ids in a batch, return only those already terminal.
pub async fn ledger_fetch_terminal_many(
    pool: &PgPool,
    transaction_ids: &[String],
) -> Result<Vec<LedgerRow>> {
    if transaction_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        r#"
        select transaction_id, account_id, currency_code, kind, amount,
               available_before, available_after, frozen_before, frozen_after,
               status, error_message, created_at
        from ledger
        where transaction_id = any($1)
          and status in ('success', 'failed')
        "#,
    )
    .bind(transaction_ids)
    .fetch_all(pool)
    .await
    .context("ledger_fetch_terminal_many failed")?;

    rows.into_iter().map(row_to_ledger_row).collect()
}

fn row_to_ledger_row(row: sqlx::postgres::PgRow) -> Result<LedgerRow> {
    let kind_str: String = row.try_get("kind")?;
    let status_str: String = row.try_get("status")?;
    Ok(LedgerRow {
        transaction_id: row.try_get("transaction_id")?,
        account_id: row.try_get("account_id")?,
        currency: row.try_get("currency_code")?,
        kind: parse_kind(&kind_str)?,
        amount: row.try_get("amount")?,
        available_before: row.try_get("available_before")?,
        available_after: row.try_get("available_after")?,
        frozen_before: row.try_get("frozen_before")?,
        frozen_after: row.try_get("frozen_after")?,
        status: parse_status(&status_str)?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_kind(s: &str) -> Result<MutationKind> {
    match s {
        "deposit" => Ok(MutationKind::Deposit),
        "withdraw" => Ok(MutationKind::Withdraw),
        "freeze" => Ok(MutationKind::Freeze),
        "unfreeze" => Ok(MutationKind::Unfreeze),
        "transfer" => Ok(MutationKind::Transfer),
        other => Err(anyhow!("invalid mutation kind in ledger row: {other}")),
    }
}

fn parse_status(s: &str) -> Result<LedgerStatus> {
    match s {
        "init" => Ok(LedgerStatus::Init),
        "processing" => Ok(LedgerStatus::Processing),
        "success" => Ok(LedgerStatus::Success),
        "failed" => Ok(LedgerStatus::Failed),
        other => Err(anyhow!("invalid ledger status in row: {other}")),
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Insert one outbox row. Idempotent on the payload's `transaction_id`: a
/// second enqueue with the same transaction-id returns `Ok(false)` rather
/// than creating a duplicate.
pub async fn outbox_enqueue(
    pool: &PgPool,
    event_id: Uuid,
    topic: &str,
    partition_key: &str,
    payload_json: serde_json::Value,
) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        insert into outbox (event_id, topic, partition_key, payload, status)
        values ($1, $2, $3, $4, 'pending')
        on conflict ((payload ->> 'transaction_id')) do nothing
        returning event_id
        "#,
    )
    .bind(event_id)
    .bind(topic)
    .bind(partition_key)
    .bind(payload_json)
    .fetch_optional(pool)
    .await
    .context("outbox_enqueue failed")?;

    Ok(row.is_some())
}

pub async fn outbox_mark_sent(pool: &PgPool, event_id: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update outbox
        set status = 'sent', sent_at = coalesce(sent_at, now())
        where event_id = $1
        returning event_id
        "#,
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await
    .context("outbox_mark_sent failed")?;
    Ok(row.is_some())
}

pub async fn outbox_mark_failed(pool: &PgPool, event_id: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update outbox
        set status = 'failed', retry_count = retry_count + 1
        where event_id = $1
        returning event_id
        "#,
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await
    .context("outbox_mark_failed failed")?;
    Ok(row.is_some())
}

/// Rows the sweeper should (re)attempt: `pending` rows older than
/// `stale_after`, and `failed` rows with `retry_count < max_retries`.
pub async fn outbox_list_sweepable(
    pool: &PgPool,
    stale_after: chrono::Duration,
    max_retries: i32,
) -> Result<Vec<OutboxRecord>> {
    let cutoff = Utc::now() - stale_after;
    let rows = sqlx::query(
        r#"
        select event_id, topic, partition_key, payload, status, retry_count,
               created_at, sent_at
        from outbox
        where (status = 'pending' and created_at <= $1)
           or (status = 'failed' and retry_count < $2)
        order by created_at asc
        "#,
    )
    .bind(cutoff)
    .bind(max_retries)
    .fetch_all(pool)
    .await
    .context("outbox_list_sweepable failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let status_str: String = row.try_get("status")?;
        let payload_json: serde_json::Value = row.try_get("payload")?;
        out.push(OutboxRecord {
            event_id: row.try_get("event_id")?,
            topic: row.try_get("topic")?,
            partition_key: row.try_get("partition_key")?,
            payload: serde_json::from_value(payload_json).context("outbox payload decode")?,
            status: parse_outbox_status(&status_str)?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
        });
    }
    Ok(out)
}

fn parse_outbox_status(s: &str) -> Result<OutboxStatus> {
    match s {
        "pending" => Ok(OutboxStatus::Pending),
        "sent" => Ok(OutboxStatus::Sent),
        "failed" => Ok(OutboxStatus::Failed),
        other => Err(anyhow!("invalid outbox status in row: {other}")),
    }
}

// ---------------------------------------------------------------------------
// Leader lease (gated: only the partition-owning writer may touch this)
// ---------------------------------------------------------------------------

#[cfg(feature = "partition-writer")]
pub mod lease {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct LeaseRow {
        pub partition: String,
        pub holder_id: String,
        pub fencing_token: i64,
        pub acquired_at: DateTime<Utc>,
        pub expires_at: DateTime<Utc>,
    }

    /// Take ownership of `partition` if unheld or expired. Returns the new
    /// fencing token on success, `None` if another holder's lease is live.
    pub async fn acquire(
        pool: &PgPool,
        partition: &str,
        holder_id: &str,
        ttl: chrono::Duration,
    ) -> Result<Option<i64>> {
        let expires_at = Utc::now() + ttl;
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            insert into leader_lease (partition, holder_id, fencing_token, acquired_at, expires_at)
            values ($1, $2, 1, now(), $3)
            on conflict (partition) do update
                set holder_id     = excluded.holder_id,
                    fencing_token = leader_lease.fencing_token + 1,
                    acquired_at   = now(),
                    expires_at    = excluded.expires_at
                where leader_lease.expires_at < now()
            returning fencing_token
            "#,
        )
        .bind(partition)
        .bind(holder_id)
        .bind(expires_at)
        .fetch_optional(pool)
        .await
        .context("lease acquire failed")?;

        Ok(row.map(|(t,)| t))
    }

    /// Extend expiry for the current holder. Zero rows affected means the
    /// lease expired and was (or will be) taken by someone else.
    pub async fn renew(
        pool: &PgPool,
        partition: &str,
        holder_id: &str,
        fencing_token: i64,
        ttl: chrono::Duration,
    ) -> Result<bool> {
        let expires_at = Utc::now() + ttl;
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            update leader_lease
            set expires_at = $4
            where partition = $1
              and holder_id = $2
              and fencing_token = $3
              and expires_at > now()
            returning fencing_token
            "#,
        )
        .bind(partition)
        .bind(holder_id)
        .bind(fencing_token)
        .bind(expires_at)
        .fetch_optional(pool)
        .await
        .context("lease renew failed")?;

        Ok(row.is_some())
    }

    pub async fn release(pool: &PgPool, partition: &str, holder_id: &str, fencing_token: i64) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            delete from leader_lease
            where partition = $1 and holder_id = $2 and fencing_token = $3
            returning fencing_token
            "#,
        )
        .bind(partition)
        .bind(holder_id)
        .bind(fencing_token)
        .fetch_optional(pool)
        .await
        .context("lease release failed")?;
        Ok(row.is_some())
    }

    pub async fn fetch(pool: &PgPool, partition: &str) -> Result<Option<LeaseRow>> {
        let row = sqlx::query(
            r#"
            select partition, holder_id, fencing_token, acquired_at, expires_at
            from leader_lease
            where partition = $1
            "#,
        )
        .bind(partition)
        .fetch_optional(pool)
        .await
        .context("lease fetch failed")?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(LeaseRow {
            partition: row.try_get("partition")?,
            holder_id: row.try_get("holder_id")?,
            fencing_token: row.try_get("fencing_token")?,
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    /// Locking read inside an open commit transaction. Fails the caller's
    /// commit if `holder_id`/`fencing_token` no longer match.
    pub async fn fence_check(
        tx: &mut Transaction<'_, Postgres>,
        partition: &str,
        holder_id: &str,
        fencing_token: i64,
    ) -> Result<bool> {
        let row: Option<(String, i64)> = sqlx::query_as(
            r#"
            select holder_id, fencing_token
            from leader_lease
            where partition = $1
            for update
            "#,
        )
        .bind(partition)
        .fetch_optional(&mut **tx)
        .await
        .context("lease fence_check failed")?;

        Ok(matches!(row, Some((h, t)) if h == holder_id && t == fencing_token))
    }
}

// ---------------------------------------------------------------------------
// Consumer offsets
// ---------------------------------------------------------------------------

pub async fn offset_fetch(
    pool: &PgPool,
    consumer_group: &str,
    topic: &str,
    partition: &str,
) -> Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        select committed_offset
        from consumer_offset
        where consumer_group = $1 and topic = $2 and partition = $3
        "#,
    )
    .bind(consumer_group)
    .bind(topic)
    .bind(partition)
    .fetch_optional(pool)
    .await
    .context("offset_fetch failed")?;

    Ok(row.map(|(o,)| o).unwrap_or(-1))
}

// ---------------------------------------------------------------------------
// Batch commit (gated, executed once per partition batch)
// ---------------------------------------------------------------------------

#[cfg(feature = "partition-writer")]
pub mod batch {
    use super::*;
    use std::collections::HashMap;

    /// One record's computed outcome, ready to be committed. Produced by the
    /// consumer's in-memory compute step; `available_after`/`frozen_after`
    /// already reflect the full mutation (not a delta).
    #[derive(Debug, Clone)]
    pub struct BatchMutationOutcome {
        pub transaction_id: String,
        pub account_id: i64,
        pub currency_code: String,
        pub kind: MutationKind,
        pub amount: Decimal,
        pub available_before: Decimal,
        pub available_after: Decimal,
        pub frozen_before: Decimal,
        pub frozen_after: Decimal,
        pub status: LedgerStatus,
        pub error_message: Option<String>,
    }

    #[derive(Debug)]
    pub enum CommitError {
        LeaseLost(String),
        Other(anyhow::Error),
    }

    impl std::fmt::Display for CommitError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                CommitError::LeaseLost(partition) => {
                    write!(f, "BAL_LEASE_LOST: fence check failed for partition '{partition}'")
                }
                CommitError::Other(e) => write!(f, "{e}"),
            }
        }
    }

    impl std::error::Error for CommitError {}

    impl From<anyhow::Error> for CommitError {
        fn from(e: anyhow::Error) -> Self {
            CommitError::Other(e)
        }
    }

    /// Commit one whole batch as a single relational transaction: fence
    /// check, set-based balance update, insert-missing, bulk ledger insert,
    /// offset upsert. Rolls back (and returns `CommitError::LeaseLost`)
    /// if the fence check fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn commit_batch(
        pool: &PgPool,
        partition: &str,
        holder_id: &str,
        fencing_token: i64,
        consumer_group: &str,
        topic: &str,
        up_to_offset: i64,
        outcomes: &[BatchMutationOutcome],
    ) -> Result<(), CommitError> {
        let mut tx = pool.begin().await.context("begin batch transaction")?;

        if !super::lease::fence_check(&mut tx, partition, holder_id, fencing_token).await? {
            tx.rollback().await.ok();
            return Err(CommitError::LeaseLost(partition.to_string()));
        }

        if !outcomes.is_empty() {
            let transaction_ids: Vec<String> = outcomes.iter().map(|o| o.transaction_id.clone()).collect();
            let account_ids: Vec<i64> = outcomes.iter().map(|o| o.account_id).collect();
            let currencies: Vec<String> = outcomes.iter().map(|o| o.currency_code.clone()).collect();
            let kinds: Vec<String> = outcomes.iter().map(|o| o.kind.as_str().to_string()).collect();
            let amounts: Vec<Decimal> = outcomes.iter().map(|o| o.amount).collect();
            let avail_before: Vec<Decimal> = outcomes.iter().map(|o| o.available_before).collect();
            let avail_after: Vec<Decimal> = outcomes.iter().map(|o| o.available_after).collect();
            let frozen_before: Vec<Decimal> = outcomes.iter().map(|o| o.frozen_before).collect();
            let frozen_after: Vec<Decimal> = outcomes.iter().map(|o| o.frozen_after).collect();
            let statuses: Vec<String> = outcomes.iter().map(|o| o.status.as_str().to_string()).collect();
            let error_messages: Vec<Option<String>> = outcomes.iter().map(|o| o.error_message.clone()).collect();

            // `outcomes` can carry several chained mutations of the same
            // (account, currency) in one batch (each still gets its own
            // ledger row). Fold those down to one row per key, keeping only
            // the last successful after-state in batch order, before the
            // balances row is ever touched — an unaggregated unnest join
            // against `balances` would otherwise leave Postgres to pick an
            // arbitrary staged row for a repeated key.
            let mut folded_order: Vec<(i64, String)> = Vec::new();
            let mut folded: HashMap<(i64, String), (Decimal, Decimal)> = HashMap::new();
            for o in outcomes.iter().filter(|o| o.status == LedgerStatus::Success) {
                let key = (o.account_id, o.currency_code.clone());
                if !folded.contains_key(&key) {
                    folded_order.push(key.clone());
                }
                folded.insert(key, (o.available_after, o.frozen_after));
            }
            let final_account_ids: Vec<i64> = folded_order.iter().map(|k| k.0).collect();
            let final_currencies: Vec<String> = folded_order.iter().map(|k| k.1.clone()).collect();
            let final_avail_after: Vec<Decimal> = folded_order.iter().map(|k| folded[k].0).collect();
            let final_frozen_after: Vec<Decimal> = folded_order.iter().map(|k| folded[k].1).collect();

            // Set-based update of pre-existing (account, currency) rows. The
            // nonneg guard is a second-pass safety net: the consumer's
            // in-memory compute step already rejected negative outcomes.
            sqlx::query(
                r#"
                with staged as (
                    select * from unnest(
                        $1::bigint[], $2::text[], $3::numeric[], $4::numeric[]
                    ) as t(account_id, currency_code, available_after, frozen_after)
                )
                update balances b
                set available  = s.available_after,
                    frozen     = s.frozen_after,
                    version    = b.version + 1,
                    updated_at = now()
                from staged s
                where b.account_id = s.account_id
                  and b.currency_code = s.currency_code
                  and s.available_after >= 0
                  and s.frozen_after >= 0
                "#,
            )
            .bind(&final_account_ids)
            .bind(&final_currencies)
            .bind(&final_avail_after)
            .bind(&final_frozen_after)
            .execute(&mut *tx)
            .await
            .context("batch balance update failed")?;

            // Insert-missing: first-touch (account, currency) pairs. A no-op
            // for rows the update above already touched.
            sqlx::query(
                r#"
                with staged as (
                    select * from unnest(
                        $1::bigint[], $2::text[], $3::numeric[], $4::numeric[]
                    ) as t(account_id, currency_code, available_after, frozen_after)
                )
                insert into balances (account_id, currency_code, available, frozen, version, updated_at)
                select account_id, currency_code, available_after, frozen_after, 1, now()
                from staged
                where available_after >= 0
                  and frozen_after >= 0
                on conflict (account_id, currency_code) do nothing
                "#,
            )
            .bind(&final_account_ids)
            .bind(&final_currencies)
            .bind(&final_avail_after)
            .bind(&final_frozen_after)
            .execute(&mut *tx)
            .await
            .context("batch balance insert-missing failed")?;

            // Bulk ledger insert. on-conflict-do-nothing is redundant safety
            // over the transaction_id uniqueness the consumer's dedup pass
            // already enforced.
            sqlx::query(
                r#"
                insert into ledger (
                    transaction_id, account_id, currency_code, kind, amount,
                    available_before, available_after, frozen_before, frozen_after,
                    status, error_message
                )
                select * from unnest(
                    $1::text[], $2::bigint[], $3::text[], $4::text[], $5::numeric[],
                    $6::numeric[], $7::numeric[], $8::numeric[], $9::numeric[],
                    $10::text[], $11::text[]
                ) as t(transaction_id, account_id, currency_code, kind, amount,
                       available_before, available_after, frozen_before, frozen_after,
                       status, error_message)
                on conflict (transaction_id) do nothing
                "#,
            )
            .bind(&transaction_ids)
            .bind(&account_ids)
            .bind(&currencies)
            .bind(&kinds)
            .bind(&amounts)
            .bind(&avail_before)
            .bind(&avail_after)
            .bind(&frozen_before)
            .bind(&frozen_after)
            .bind(&statuses)
            .bind(&error_messages)
            .execute(&mut *tx)
            .await
            .context("batch ledger insert failed")?;
        }

        sqlx::query(
            r#"
            insert into consumer_offset (consumer_group, topic, partition, committed_offset, updated_at)
            values ($1, $2, $3, $4, now())
            on conflict (consumer_group, topic, partition) do update
                set committed_offset = greatest(consumer_offset.committed_offset, excluded.committed_offset),
                    updated_at = excluded.updated_at
            "#,
        )
        .bind(consumer_group)
        .bind(topic)
        .bind(partition)
        .bind(up_to_offset)
        .execute(&mut *tx)
        .await
        .context("offset upsert failed")?;

        tx.commit().await.context("batch transaction commit failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kind_roundtrips_every_variant() {
        for k in [
            MutationKind::Deposit,
            MutationKind::Withdraw,
            MutationKind::Freeze,
            MutationKind::Unfreeze,
            MutationKind::Transfer,
        ] {
            assert_eq!(parse_kind(k.as_str()).unwrap(), k);
        }
    }

    #[test]
    fn parse_kind_rejects_unknown() {
        assert!(parse_kind("teleport").is_err());
    }

    #[test]
    fn parse_status_roundtrips_every_variant() {
        for s in [
            LedgerStatus::Init,
            LedgerStatus::Processing,
            LedgerStatus::Success,
            LedgerStatus::Failed,
        ] {
            assert_eq!(parse_status(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn default_pool_settings_match_documented_defaults() {
        let s = DbPoolSettings::default();
        assert_eq!(s.max_conns, 15);
        assert_eq!(s.connect_timeout_ms, 5000);
    }
}
