//! A deposit against a never-before-seen (account, currency) creates the
//! balance row from zero rather than requiring it to pre-exist.

use bal_config::{BatchConfig, LeaseConfig};
use bal_consumer::{PartitionRunner, WorkingSet};
use bal_lease::PostgresLeaseGuard;
use bal_log::{testing::InMemoryLog, TOPIC_BALANCE_CHANGES};
use bal_testkit::{requests, InMemoryLogConsumer};
use rust_decimal::Decimal;
use std::sync::Arc;

#[tokio::test]
async fn first_deposit_creates_balance() -> anyhow::Result<()> {
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

    let request = requests::deposit("dep-1", 42, Decimal::new(10000, 2));
    log.push_envelope(TOPIC_BALANCE_CHANGES, 0, &requests::envelope_for(&request));

    let committed = runner.process_once(&consumer).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(committed, Some(1));

    let snap = bal_db::balance_fetch(&pool, 42, "USD").await?.expect("balance row must exist");
    assert_eq!(snap.available, Decimal::new(10000, 2));
    assert_eq!(snap.frozen, Decimal::ZERO);
    assert_eq!(snap.version, 1);

    Ok(())
}
