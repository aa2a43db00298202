//! A withdraw larger than the available balance is committed as a `Failed`
//! ledger row, not silently dropped or allowed to drive the balance
//! negative. `balances_available_nonneg` is the last-resort guard; the
//! consumer's own compute step is the one expected to catch this.

use bal_config::{BatchConfig, LeaseConfig};
use bal_consumer::{PartitionRunner, WorkingSet};
use bal_lease::PostgresLeaseGuard;
use bal_log::{testing::InMemoryLog, TOPIC_BALANCE_CHANGES};
use bal_schemas::LedgerStatus;
use bal_testkit::{requests, InMemoryLogConsumer};
use rust_decimal::Decimal;
use std::sync::Arc;

#[tokio::test]
async fn withdraw_over_available_balance_fails_without_mutating_balance() -> anyhow::Result<()> {
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
        batch: BatchConfig {
            max_records: 10,
            max_latency_ms: 50,
            long_poll_ms: 20,
        },
        working_set: WorkingSet::new(),
        snapshot_updater: None,
    };
    runner.recover(&consumer).await?;

    // Never deposited into account 9; the first mutation it ever sees is a
    // withdraw, so available starts at zero.
    let request = requests::withdraw("wd-1", 9, Decimal::new(100, 2));
    log.push_envelope(TOPIC_BALANCE_CHANGES, 0, &requests::envelope_for(&request));

    let committed = runner.process_once(&consumer).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(committed, Some(1), "the failed outcome is still a committed ledger row");

    let ledger = bal_db::ledger_fetch(&pool, "wd-1").await?.expect("ledger row must exist");
    assert_eq!(ledger.status, LedgerStatus::Failed);
    assert!(ledger.error_message.unwrap().contains("insufficient"));

    // No balance row should have been created for a mutation that never
    // succeeded.
    let snap = bal_db::balance_fetch(&pool, 9, "USD").await?;
    assert!(snap.is_none());

    Ok(())
}
