//! The snapshot updater: a best-effort, last-writer-wins cache of balances
//! in Redis, sharded by account id so a slow shard never backs up another.
//!
//! Redis is never the source of truth; a reader that finds it empty or
//! stale falls back to the relational store. The Lua script enforces LWW
//! server-side (comparing the stored ledger version against the incoming
//! one) so out-of-order delivery across shard flushes can't regress a
//! balance back to an older value.

use async_trait::async_trait;
use bal_config::SnapshotConfig;
use bal_schemas::BalanceSnapshot;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Narrow capability trait for where committed balances get published
/// after they're durably written. Independently implementable so the
/// consumer's commit path never depends on Redis being reachable.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn publish_many(&self, snapshots: &[BalanceSnapshot]) -> anyhow::Result<()>;
}

fn redis_key(account_id: i64, currency: &str) -> String {
    format!("bal:{account_id}:{currency}")
}

pub struct RedisSnapshotSink {
    conn: ConnectionManager,
    cas_script: redis::Script,
}

impl RedisSnapshotSink {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            cas_script: redis::Script::new(LWW_SET_SCRIPT),
        })
    }

    pub fn from_connection_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            cas_script: redis::Script::new(LWW_SET_SCRIPT),
        }
    }
}

/// `KEYS[1]` is the balance key, `ARGV[1]` the incoming version, `ARGV[2]`
/// the JSON payload. Only overwrites when no value is stored yet or the
/// stored version is older than the incoming one.
const LWW_SET_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if (not current) or (tonumber(current) < tonumber(ARGV[1])) then
    redis.call('HSET', KEYS[1], 'version', ARGV[1], 'payload', ARGV[2])
    return 1
else
    return 0
end
"#;

#[async_trait]
impl SnapshotSink for RedisSnapshotSink {
    async fn publish_many(&self, snapshots: &[BalanceSnapshot]) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        for snap in snapshots {
            let key = redis_key(snap.account_id, &snap.currency);
            let payload = serde_json::to_string(snap)?;
            let _: i32 = self
                .cas_script
                .key(key)
                .arg(snap.version)
                .arg(payload)
                .invoke_async(&mut conn)
                .await?;
        }
        Ok(())
    }
}

/// Reads a balance snapshot back out of the cache, if present. Not part of
/// `SnapshotSink` since readers (the query path) are a separate concern
/// from the write-side updater.
pub async fn read_cached(conn: &mut ConnectionManager, account_id: i64, currency: &str) -> anyhow::Result<Option<BalanceSnapshot>> {
    let payload: Option<String> = conn.hget(redis_key(account_id, currency), "payload").await?;
    match payload {
        None => Ok(None),
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
    }
}

/// Sharded fan-out: every (account, currency) update routes to
/// `account_id % worker_count` so a single hot account is always handled
/// by the same worker, and distinct accounts spread across workers.
pub struct SnapshotUpdater {
    senders: Vec<mpsc::Sender<BalanceSnapshot>>,
}

impl SnapshotUpdater {
    /// Spawns `config.worker_count` background tasks, each batching
    /// incoming snapshots and flushing to `sink` every
    /// `config.flush_interval_ms`.
    pub fn spawn(config: SnapshotConfig, sink: Arc<dyn SnapshotSink>) -> Self {
        let worker_count = config.worker_count.max(1) as usize;
        let mut senders = Vec::with_capacity(worker_count);

        for shard in 0..worker_count {
            let (tx, rx) = mpsc::channel(1024);
            senders.push(tx);
            tokio::spawn(run_shard(shard, rx, sink.clone(), Duration::from_millis(config.flush_interval_ms)));
        }

        Self { senders }
    }

    /// Route one snapshot update to its shard. Never blocks the caller on
    /// the flush itself — only on channel backpressure, which signals the
    /// shard is falling behind.
    pub async fn route(&self, snapshot: BalanceSnapshot) -> anyhow::Result<()> {
        let shard = (snapshot.account_id.unsigned_abs() as usize) % self.senders.len();
        self.senders[shard]
            .send(snapshot)
            .await
            .map_err(|_| anyhow::anyhow!("snapshot shard worker has shut down"))
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }
}

async fn run_shard(
    shard: usize,
    mut rx: mpsc::Receiver<BalanceSnapshot>,
    sink: Arc<dyn SnapshotSink>,
    flush_interval: Duration,
) {
    let mut pending: HashMap<(i64, String), BalanceSnapshot> = HashMap::new();
    let mut ticker = tokio::time::interval(flush_interval);

    loop {
        tokio::select! {
            maybe_snap = rx.recv() => {
                match maybe_snap {
                    Some(snap) => {
                        pending.insert((snap.account_id, snap.currency.clone()), snap);
                    }
                    None => {
                        flush(shard, &mut pending, sink.as_ref()).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(shard, &mut pending, sink.as_ref()).await;
            }
        }
    }
}

async fn flush(shard: usize, pending: &mut HashMap<(i64, String), BalanceSnapshot>, sink: &dyn SnapshotSink) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<BalanceSnapshot> = pending.values().cloned().collect();
    if let Err(e) = sink.publish_many(&batch).await {
        tracing::warn!(shard, error = %e, "snapshot flush failed, will retry on next tick with latest values");
        return;
    }
    pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    fn snap(account_id: i64, version: i64) -> BalanceSnapshot {
        BalanceSnapshot {
            account_id,
            currency: "USDT".into(),
            available: rust_decimal::Decimal::ZERO,
            frozen: rust_decimal::Decimal::ZERO,
            version,
            updated_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<BalanceSnapshot>>,
    }

    #[async_trait]
    impl SnapshotSink for RecordingSink {
        async fn publish_many(&self, snapshots: &[BalanceSnapshot]) -> anyhow::Result<()> {
            self.received.lock().unwrap().extend_from_slice(snapshots);
            Ok(())
        }
    }

    #[test]
    fn redis_key_is_stable_for_same_account_and_currency() {
        assert_eq!(redis_key(42, "USDT"), redis_key(42, "USDT"));
        assert_ne!(redis_key(42, "USDT"), redis_key(42, "BTC"));
    }

    #[tokio::test]
    async fn updater_routes_same_account_to_same_shard_consistently() {
        let sink = Arc::new(RecordingSink::default());
        let updater = SnapshotUpdater::spawn(
            bal_config::SnapshotConfig {
                worker_count: 4,
                flush_interval_ms: 5,
            },
            sink.clone(),
        );

        updater.route(snap(7, 1)).await.unwrap();
        updater.route(snap(7, 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let received = sink.received.lock().unwrap();
        assert!(received.iter().any(|s| s.account_id == 7 && s.version == 2));
    }

    #[test]
    fn worker_count_is_at_least_one_even_if_configured_zero() {
        let sink = Arc::new(RecordingSink::default());
        let updater = SnapshotUpdater::spawn(
            bal_config::SnapshotConfig {
                worker_count: 0,
                flush_interval_ms: 100,
            },
            sink,
        );
        assert_eq!(updater.worker_count(), 1);
    }
}
