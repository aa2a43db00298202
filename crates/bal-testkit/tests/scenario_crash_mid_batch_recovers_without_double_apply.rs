//! After a crash, the new process instance never trusts the transport's own
//! offsets — it reads the last committed offset back out of Postgres and
//! resumes from there. If the upstream redelivers a record the crashed
//! process already committed, the restarted instance must still apply it
//! exactly once.

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
async fn restarted_runner_does_not_double_apply_a_redelivered_record() -> anyhow::Result<()> {
    let Some(pool) = bal_testkit::connect_test_pool().await? else {
        eprintln!("SKIP: {} not set", bal_testkit::ENV_TEST_DB_URL);
        return Ok(());
    };
    bal_testkit::truncate_all(&pool).await?;

    let lease_config = LeaseConfig {
        ttl_ms: 5_000,
        renew_ms: 2_000,
    };
    let holder_id = "holder-a".to_string();
    let lease = Arc::new(PostgresLeaseGuard::new(pool.clone(), "0", holder_id.clone(), &lease_config));
    assert!(lease.acquire().await?);

    // First process instance: commits one deposit, then "crashes" (its
    // in-memory WorkingSet and consumer are simply dropped at the end of
    // this block).
    {
        let log = Arc::new(InMemoryLog::new());
        let consumer = InMemoryLogConsumer::new(log.clone());
        let mut runner = PartitionRunner {
            pool: pool.clone(),
            lease: lease.clone(),
            holder_id: holder_id.clone(),
            partition: 0,
            topic: TOPIC_BALANCE_CHANGES.to_string(),
            consumer_group: "test-group".to_string(),
            batch: batch_config(),
            working_set: WorkingSet::new(),
            snapshot_updater: None,
        };
        runner.recover(&consumer).await?;

        let request = requests::deposit("crash-1", 55, Decimal::new(30000, 2));
        log.push_envelope(TOPIC_BALANCE_CHANGES, 0, &requests::envelope_for(&request));
        let committed = runner.process_once(&consumer).await.map_err(|e| anyhow::anyhow!("{e}"))?;
        assert_eq!(committed, Some(1));
    }

    let offset_after_first_instance =
        bal_db::offset_fetch(&pool, "test-group", TOPIC_BALANCE_CHANGES, "0").await?;
    assert!(offset_after_first_instance >= 0, "offset must have advanced past the committed record");

    // Second process instance: fresh WorkingSet, same lease holder (as if
    // the same process restarted and re-acquired the same partition).
    // Upstream redelivers the exact same record the crashed instance had
    // already committed.
    let log2 = Arc::new(InMemoryLog::new());
    let consumer2 = InMemoryLogConsumer::new(log2.clone());
    let mut runner2 = PartitionRunner {
        pool: pool.clone(),
        lease: lease.clone(),
        holder_id,
        partition: 0,
        topic: TOPIC_BALANCE_CHANGES.to_string(),
        consumer_group: "test-group".to_string(),
        batch: batch_config(),
        working_set: WorkingSet::new(),
        snapshot_updater: None,
    };
    let recovered_offset = runner2.recover(&consumer2).await?;
    assert_eq!(recovered_offset, offset_after_first_instance);

    let replayed = requests::deposit("crash-1", 55, Decimal::new(30000, 2));
    log2.push_envelope(TOPIC_BALANCE_CHANGES, 0, &requests::envelope_for(&replayed));
    let committed2 = runner2.process_once(&consumer2).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(committed2, Some(0), "redelivered transaction_id must be deduped, not reapplied");

    let snap = bal_db::balance_fetch(&pool, 55, "USD").await?.unwrap();
    assert_eq!(snap.available, Decimal::new(30000, 2), "balance must reflect exactly one deposit");

    Ok(())
}
