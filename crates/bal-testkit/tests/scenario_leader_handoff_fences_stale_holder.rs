//! Only one holder's writes may land for a given partition at a time. Once
//! a new leader has taken the lease, a batch committed under the old
//! holder's stale fencing token must be rejected rather than silently
//! applied — this is what keeps two processes from ever writing the same
//! partition concurrently.

use bal_config::{BatchConfig, LeaseConfig};
use bal_consumer::{PartitionRunner, WorkingSet};
use bal_db::batch::CommitError;
use bal_lease::PostgresLeaseGuard;
use bal_log::{testing::InMemoryLog, TOPIC_BALANCE_CHANGES};
use bal_testkit::{requests, InMemoryLogConsumer};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn stale_leader_is_fenced_out_after_handoff() -> anyhow::Result<()> {
    let Some(pool) = bal_testkit::connect_test_pool().await? else {
        eprintln!("SKIP: {} not set", bal_testkit::ENV_TEST_DB_URL);
        return Ok(());
    };
    bal_testkit::truncate_all(&pool).await?;

    // Short TTL so the old holder's lease is eligible to be taken over
    // almost immediately, without waiting out a production-sized TTL.
    let lease_config = LeaseConfig {
        ttl_ms: 10,
        renew_ms: 5,
    };

    let old_holder = Arc::new(PostgresLeaseGuard::new(pool.clone(), "0", "holder-old", &lease_config));
    assert!(old_holder.acquire().await?, "first acquire must win an unheld lease");

    let log = Arc::new(InMemoryLog::new());
    let consumer = InMemoryLogConsumer::new(log.clone());
    let mut stale_runner = PartitionRunner {
        pool: pool.clone(),
        lease: old_holder.clone(),
        holder_id: "holder-old".to_string(),
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
    stale_runner.recover(&consumer).await?;

    // Lease expires, a new leader is elected for the same partition.
    tokio::time::sleep(Duration::from_millis(25)).await;
    let new_holder = Arc::new(PostgresLeaseGuard::new(pool.clone(), "0", "holder-new", &lease_config));
    assert!(new_holder.acquire().await?, "new holder must win the expired lease");

    // The old holder never learned its lease was taken (no renewal loop
    // running in this test); its cached fencing token is now stale.
    let request = requests::deposit("handoff-1", 1, Decimal::new(100, 2));
    log.push_envelope(TOPIC_BALANCE_CHANGES, 0, &requests::envelope_for(&request));

    let result = stale_runner.process_once(&consumer).await;
    match result {
        Err(CommitError::LeaseLost(partition)) => assert_eq!(partition, "0"),
        other => panic!("expected CommitError::LeaseLost, got {other:?}"),
    }

    // The fenced-out write must not have landed.
    let snap = bal_db::balance_fetch(&pool, 1, "USD").await?;
    assert!(snap.is_none());

    Ok(())
}
