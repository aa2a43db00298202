//! In-process test doubles for the capability traits, so scenario tests can
//! exercise `bal-consumer`/`bal-runtime` without a Kafka broker or Redis.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bal_log::testing::InMemoryLog;
use bal_log::{LogConsumer, LogProducer, RawRecord};
use bal_schemas::{BalanceSnapshot, DlqRecord, LogEnvelope};

/// `LogProducer` backed by an `InMemoryLog`. Always appends to partition 0 —
/// fine for scenario tests, which model one partition per case.
pub struct InMemoryLogProducer {
    log: Arc<InMemoryLog>,
}

impl InMemoryLogProducer {
    pub fn new(log: Arc<InMemoryLog>) -> Self {
        Self { log }
    }
}

#[async_trait::async_trait]
impl LogProducer for InMemoryLogProducer {
    async fn publish(&self, topic: &str, _partition_key: &str, envelope: &LogEnvelope) -> anyhow::Result<()> {
        self.log.push_envelope(topic, 0, envelope);
        Ok(())
    }

    async fn publish_dlq(&self, _topic: &str, record: &DlqRecord) -> anyhow::Result<()> {
        self.log.push_dlq(record.clone());
        Ok(())
    }
}

/// `LogConsumer` backed by the same `InMemoryLog`. `seek_to` just records
/// which `(topic, partition)` to read from; the in-memory queue has no
/// concept of an arbitrary offset, so tests start each queue fresh.
pub struct InMemoryLogConsumer {
    log: Arc<InMemoryLog>,
    assigned: Mutex<Option<(String, i32)>>,
}

impl InMemoryLogConsumer {
    pub fn new(log: Arc<InMemoryLog>) -> Self {
        Self {
            log,
            assigned: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl LogConsumer for InMemoryLogConsumer {
    fn seek_to(&self, topic: &str, partition: i32, _offset: i64) -> anyhow::Result<()> {
        *self.assigned.lock().unwrap() = Some((topic.to_string(), partition));
        Ok(())
    }

    async fn poll(&self, _timeout: Duration) -> anyhow::Result<Option<RawRecord>> {
        let assigned = self.assigned.lock().unwrap().clone();
        let Some((topic, partition)) = assigned else {
            return Ok(None);
        };
        Ok(self.log.pop(&topic, partition))
    }
}

/// `SnapshotSink` that just records every call, for asserting what the
/// sharded updater published without standing up a Redis instance.
#[derive(Default)]
pub struct RecordingSnapshotSink {
    published: Mutex<Vec<BalanceSnapshot>>,
}

impl RecordingSnapshotSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<BalanceSnapshot> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl bal_snapshot::SnapshotSink for RecordingSnapshotSink {
    async fn publish_many(&self, snapshots: &[BalanceSnapshot]) -> anyhow::Result<()> {
        self.published.lock().unwrap().extend_from_slice(snapshots);
        Ok(())
    }
}
