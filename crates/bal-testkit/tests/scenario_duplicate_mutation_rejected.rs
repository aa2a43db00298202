//! The same `transaction_id` landing twice in the log must only mutate the
//! balance once. This is the whole idempotency substrate: a unique index on
//! `ledger.transaction_id`, checked via `ledger_fetch_terminal_many` before a
//! record is ever computed against the working set.

use bal_config::{BatchConfig, LeaseConfig};
use bal_consumer::{PartitionRunner, WorkingSet};
use bal_lease::PostgresLeaseGuard;
use bal_log::{testing::InMemoryLog, TOPIC_BALANCE_CHANGES};
use bal_testkit::{requests, InMemoryLogConsumer};
use rust_decimal::Decimal;
use std::sync::Arc;

fn batch_config() -> BatchConfig {
    BatchConfig {
        max_records: 10,
        max_latency_ms: 50,
        long_poll_ms: 20,
    }
}

#[tokio::test]
async fn duplicate_transaction_id_mutates_balance_once() -> anyhow::Result<()> {
    let Some(pool) = bal_testkit::connect_test_pool().await? else {
        eprintln!("SKIP: {} not set", bal_testkit::ENV_TEST_DB_URL);
        return Ok(());
    };
    bal_testkit::truncate_all(&pool).await?;

    let lease_config = LeaseConfig {
        ttl_ms: 5_000,
        renew_ms: 2_000,
    };
    let lease = Arc::new(PostgresLeaseGuard::new(pool.clone(), "0", "holder-a", &lease_config));
    assert!(lease.acquire().await?);

    let log = Arc::new(InMemoryLog::new());
    let consumer = InMemoryLogConsumer::new(log.clone());

    let mut runner = PartitionRunner {
        pool: pool.clone(),
        lease,
        holder_id: "holder-a".to_string(),
        partition: 0,
        topic: TOPIC_BALANCE_CHANGES.to_string(),
        consumer_group: "test-group".to_string(),
        batch: batch_config(),
        working_set: WorkingSet::new(),
        snapshot_updater: None,
    };
    runner.recover(&consumer).await?;

    let request = requests::deposit("dep-dup", 7, Decimal::new(5000, 2));
    log.push_envelope(TOPIC_BALANCE_CHANGES, 0, &requests::envelope_for(&request));
    let first = runner.process_once(&consumer).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(first, Some(1));

    // Same envelope redelivered (as if the transport had no exactly-once
    // guarantee of its own and replayed it after a restart).
    log.push_envelope(TOPIC_BALANCE_CHANGES, 0, &requests::envelope_for(&request));
    let second = runner.process_once(&consumer).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(second, Some(0), "duplicate transaction_id must not produce a new outcome");

    let snap = bal_db::balance_fetch(&pool, 7, "USD").await?.expect("balance row must exist");
    assert_eq!(snap.available, Decimal::new(5000, 2), "balance must reflect exactly one deposit");
    assert_eq!(snap.version, 1);

    Ok(())
}
