//! Freezing moves funds from available to frozen; unfreezing moves them
//! back. Across both mutations the account's total (available + frozen)
//! is conserved.

use bal_config::{BatchConfig, LeaseConfig};
use bal_consumer::{PartitionRunner, WorkingSet};
use bal_lease::PostgresLeaseGuard;
use bal_log::{testing::InMemoryLog, TOPIC_BALANCE_CHANGES};
use bal_testkit::{requests, InMemoryLogConsumer};
use rust_decimal::Decimal;
use std::sync::Arc;

#[tokio::test]
async fn freeze_then_unfreeze_conserves_total_balance() -> anyhow::Result<()> {
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

    let deposit = requests::deposit("fz-dep", 3, Decimal::new(20000, 2));
    log.push_envelope(TOPIC_BALANCE_CHANGES, 0, &requests::envelope_for(&deposit));
    runner.process_once(&consumer).await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let freeze = requests::freeze("fz-1", 3, Decimal::new(8000, 2));
    log.push_envelope(TOPIC_BALANCE_CHANGES, 0, &requests::envelope_for(&freeze));
    runner.process_once(&consumer).await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let mid = bal_db::balance_fetch(&pool, 3, "USD").await?.unwrap();
    assert_eq!(mid.available, Decimal::new(12000, 2));
    assert_eq!(mid.frozen, Decimal::new(8000, 2));
    assert_eq!(mid.available + mid.frozen, Decimal::new(20000, 2));

    let unfreeze = requests::unfreeze("fz-2", 3, Decimal::new(8000, 2));
    log.push_envelope(TOPIC_BALANCE_CHANGES, 0, &requests::envelope_for(&unfreeze));
    runner.process_once(&consumer).await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let after = bal_db::balance_fetch(&pool, 3, "USD").await?.unwrap();
    assert_eq!(after.available, Decimal::new(20000, 2));
    assert_eq!(after.frozen, Decimal::ZERO);

    Ok(())
}
