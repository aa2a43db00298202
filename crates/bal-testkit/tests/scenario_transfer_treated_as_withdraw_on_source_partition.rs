//! On its own partition a `Transfer` mutation behaves exactly like a
//! `Withdraw`: it decreases `available`, never touches `frozen`, and is
//! rejected with a `Failed` ledger row rather than going negative. The
//! counter-deposit on the receiving account is a separate submission this
//! crate doesn't model.

use bal_config::{BatchConfig, LeaseConfig};
use bal_consumer::{PartitionRunner, WorkingSet};
use bal_lease::PostgresLeaseGuard;
use bal_log::{testing::InMemoryLog, TOPIC_BALANCE_CHANGES};
use bal_schemas::LedgerStatus;
use bal_testkit::{requests, InMemoryLogConsumer};
use rust_decimal::Decimal;
use std::sync::Arc;

#[tokio::test]
async fn transfer_out_decreases_available_like_a_withdraw() -> anyhow::Result<()> {
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
    assert!(lease.acquire().await?, "expected to win an uncontested lease");

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

    let deposit = requests::deposit("dep-1", 7, Decimal::new(10000, 2));
    log.push_envelope(TOPIC_BALANCE_CHANGES, 0, &requests::envelope_for(&deposit));
    let committed = runner.process_once(&consumer).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(committed, Some(1));

    let transfer = requests::transfer("xfer-1", 7, Decimal::new(4000, 2));
    log.push_envelope(TOPIC_BALANCE_CHANGES, 0, &requests::envelope_for(&transfer));
    let committed = runner.process_once(&consumer).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(committed, Some(1));

    let ledger = bal_db::ledger_fetch(&pool, "xfer-1").await?.expect("ledger row must exist");
    assert_eq!(ledger.status, LedgerStatus::Success);

    let snap = bal_db::balance_fetch(&pool, 7, "USD").await?.expect("balance row must exist");
    assert_eq!(snap.available, Decimal::new(6000, 2));
    assert_eq!(snap.frozen, Decimal::ZERO);

    Ok(())
}

#[tokio::test]
async fn transfer_over_available_balance_fails_without_mutating_balance() -> anyhow::Result<()> {
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

    // Never deposited into account 11; a transfer out of it must fail the
    // same way a withdraw would.
    let transfer = requests::transfer("xfer-2", 11, Decimal::new(100, 2));
    log.push_envelope(TOPIC_BALANCE_CHANGES, 0, &requests::envelope_for(&transfer));

    let committed = runner.process_once(&consumer).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(committed, Some(1), "the failed outcome is still a committed ledger row");

    let ledger = bal_db::ledger_fetch(&pool, "xfer-2").await?.expect("ledger row must exist");
    assert_eq!(ledger.status, LedgerStatus::Failed);
    assert!(ledger.error_message.unwrap().contains("insufficient"));

    let snap = bal_db::balance_fetch(&pool, 11, "USD").await?;
    assert!(snap.is_none());

    Ok(())
}
