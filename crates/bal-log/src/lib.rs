//! The durable, partitioned log transport. Two narrow capability traits —
//! [`LogProducer`] and [`LogConsumer`] — decouple the outbox writer and the
//! partition consumer from the transport's concrete wire client, per the
//! cyclic-dependency note in the design notes: each is independently
//! implementable and injected by the root runtime.
//!
//! Partition offsets are never trusted to the transport's own consumer-group
//! coordinator. The partition consumer tracks its own committed offset in
//! the relational store and manually seeks on (re)start, so recovery is a
//! property of `bal-db`, not of Kafka group management.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bal_schemas::{DlqRecord, LogEnvelope};
use chrono::Utc;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::time::Duration;
use uuid::Uuid;

pub const TOPIC_BALANCE_CHANGES: &str = "balance-changes";

/// A record read off the log, not yet known to be well-formed.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Vec<u8>,
}

impl RawRecord {
    /// Parse the value as a [`LogEnvelope`]. On failure the caller routes
    /// the raw bytes to the dead-letter topic rather than blocking the
    /// partition.
    pub fn parse(&self) -> Result<LogEnvelope, ParseError> {
        serde_json::from_slice(&self.value).map_err(|e| ParseError {
            message: e.to_string(),
        })
    }

    pub fn to_dlq_record(&self, error_kind: &str, error_message: &str, retry_count: u32) -> DlqRecord {
        DlqRecord {
            original_topic: self.topic.clone(),
            original_offset: self.offset,
            original_key: self.key.clone().unwrap_or_default(),
            original_value_bytes: self.value.clone(),
            failed_at: Utc::now(),
            retry_count,
            error_kind: error_kind.to_string(),
            error_message: error_message.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BAL_PARSE_ERROR: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Publishes mutation envelopes and dead-letter wrappers to the durable log.
#[async_trait]
pub trait LogProducer: Send + Sync {
    async fn publish(&self, topic: &str, partition_key: &str, envelope: &LogEnvelope) -> Result<()>;
    async fn publish_dlq(&self, topic: &str, record: &DlqRecord) -> Result<()>;
}

/// Polls raw records from one assigned partition. The caller owns offset
/// bookkeeping; `seek_to` repositions the client, it does not commit
/// anything back to the transport.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Reposition to start reading immediately after `offset` (pass `-1`
    /// to start from the beginning, matching a never-before-seen partition).
    fn seek_to(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// Poll for up to one record, waiting at most `timeout`. `None` means
    /// the poll window elapsed with nothing available.
    async fn poll(&self, timeout: Duration) -> Result<Option<RawRecord>>;
}

// ---------------------------------------------------------------------------
// Kafka-backed implementation
// ---------------------------------------------------------------------------

pub struct KafkaLogProducer {
    producer: FutureProducer,
}

impl KafkaLogProducer {
    pub fn new(brokers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .create()
            .context("failed to construct Kafka producer")?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl LogProducer for KafkaLogProducer {
    async fn publish(&self, topic: &str, partition_key: &str, envelope: &LogEnvelope) -> Result<()> {
        let payload = serde_json::to_vec(envelope).context("serialize log envelope")?;
        let event_id_str = envelope.event_id.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "event_id",
                value: Some(event_id_str.as_bytes()),
            })
            .insert(Header {
                key: "transaction_id",
                value: Some(envelope.transaction_id.as_bytes()),
            });

        let record = FutureRecord::to(topic)
            .key(partition_key)
            .payload(&payload)
            .headers(headers);

        self.producer
            .send(record, Duration::from_secs(30))
            .await
            .map_err(|(err, _)| anyhow::anyhow!("kafka publish failed: {err}"))?;
        Ok(())
    }

    async fn publish_dlq(&self, topic: &str, record: &DlqRecord) -> Result<()> {
        let payload = serde_json::to_vec(record).context("serialize dlq record")?;
        let kafka_record = FutureRecord::to(topic)
            .key(&record.original_key)
            .payload(&payload);

        self.producer
            .send(kafka_record, Duration::from_secs(30))
            .await
            .map_err(|(err, _)| anyhow::anyhow!("kafka dlq publish failed: {err}"))?;
        Ok(())
    }
}

pub struct KafkaLogConsumer {
    consumer: BaseConsumer,
}

impl KafkaLogConsumer {
    pub fn new(brokers: &str, consumer_group: &str) -> Result<Self> {
        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .create()
            .context("failed to construct Kafka consumer")?;
        Ok(Self { consumer })
    }
}

#[async_trait]
impl LogConsumer for KafkaLogConsumer {
    fn seek_to(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        let start = Offset::Offset(offset + 1);
        tpl.add_partition_offset(topic, partition, start)
            .context("invalid topic partition offset")?;
        self.consumer.assign(&tpl).context("assign partition")?;
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<RawRecord>> {
        match self.consumer.poll(timeout) {
            None => Ok(None),
            Some(Ok(msg)) => {
                let key = msg.key().map(|b| String::from_utf8_lossy(b).into_owned());
                let value = msg.payload().unwrap_or(&[]).to_vec();
                Ok(Some(RawRecord {
                    topic: msg.topic().to_string(),
                    partition: msg.partition(),
                    offset: msg.offset(),
                    key,
                    value,
                }))
            }
            Some(Err(e)) => Err(anyhow::anyhow!("kafka poll error: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory test double
// ---------------------------------------------------------------------------

pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A single-process stand-in for the log, queuing records per
    /// `(topic, partition)`. Sufficient for scenario tests that don't need
    /// a real broker.
    #[derive(Default)]
    pub struct InMemoryLog {
        queues: Mutex<std::collections::HashMap<(String, i32), VecDeque<RawRecord>>>,
        dlq: Mutex<Vec<DlqRecord>>,
        next_offset: Mutex<std::collections::HashMap<(String, i32), i64>>,
    }

    impl InMemoryLog {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_envelope(&self, topic: &str, partition: i32, envelope: &LogEnvelope) {
            let mut offsets = self.next_offset.lock().unwrap();
            let key = (topic.to_string(), partition);
            let offset = *offsets.get(&key).unwrap_or(&0);
            offsets.insert(key.clone(), offset + 1);

            let record = RawRecord {
                topic: topic.to_string(),
                partition,
                offset,
                key: Some(envelope.partition_key.clone()),
                value: serde_json::to_vec(envelope).expect("envelope serializes"),
            };
            self.queues.lock().unwrap().entry(key).or_default().push_back(record);
        }

        pub fn push_malformed(&self, topic: &str, partition: i32, raw_bytes: Vec<u8>) {
            let mut offsets = self.next_offset.lock().unwrap();
            let key = (topic.to_string(), partition);
            let offset = *offsets.get(&key).unwrap_or(&0);
            offsets.insert(key.clone(), offset + 1);

            let record = RawRecord {
                topic: topic.to_string(),
                partition,
                offset,
                key: None,
                value: raw_bytes,
            };
            self.queues.lock().unwrap().entry(key).or_default().push_back(record);
        }

        pub fn pop(&self, topic: &str, partition: i32) -> Option<RawRecord> {
            self.queues
                .lock()
                .unwrap()
                .get_mut(&(topic.to_string(), partition))
                .and_then(|q| q.pop_front())
        }

        pub fn dlq_records(&self) -> Vec<DlqRecord> {
            self.dlq.lock().unwrap().clone()
        }

        pub fn push_dlq(&self, record: DlqRecord) {
            self.dlq.lock().unwrap().push(record);
        }
    }
}
