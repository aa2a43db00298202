//! Root composition: wires the relational store, the durable log, fenced
//! leases, the partition consumers, the outbox sweeper and the snapshot
//! updater into one runtime object.
//!
//! Nothing here is a global singleton — every capability is constructed
//! once in `RootRuntime::bootstrap` and handed down by reference or `Arc`.
//! This breaks the natural cyclic dependency between the partition
//! consumer, the leader lease and the balance cache: each is defined as a
//! narrow trait in its own crate, and only `bal-runtime` knows about all
//! three concretely.

use bal_config::BalanceEngineConfig;
use bal_config::secrets::ResolvedSecrets;
use bal_consumer::{PartitionRunner, WorkingSet};
use bal_db::DbPoolSettings;
use bal_lease::{LeaseGuard, PostgresLeaseGuard, WorkerEvent, WorkerPhase, WorkerState};
use bal_log::{KafkaLogConsumer, KafkaLogProducer, LogConsumer, LogProducer, TOPIC_BALANCE_CHANGES};
use bal_outbox::{EnqueueError, Sweeper};
use bal_schemas::{BalanceSnapshot, MutationRequest};
use bal_snapshot::{RedisSnapshotSink, SnapshotSink, SnapshotUpdater};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// The balance engine's inbound capability surface: fetch a balance, submit
/// a mutation. `bal-daemon`'s HTTP adapter is the only intended caller.
/// `balance` returns `Ok(None)` for an (account, currency) that has never
/// been touched — callers must distinguish that from a zero balance.
#[async_trait::async_trait]
pub trait BalanceStore: Send + Sync {
    async fn balance(&self, account_id: i64, currency: &str) -> anyhow::Result<Option<BalanceSnapshot>>;
    async fn submit(&self, request: &MutationRequest) -> Result<Uuid, EnqueueError>;
}

/// Cache-first reads (Redis, best-effort) falling back to the relational
/// store; writes always go through the transactional outbox.
pub struct PostgresBalanceStore {
    pool: PgPool,
    log: Arc<dyn LogProducer>,
    cache: Option<tokio::sync::Mutex<redis::aio::ConnectionManager>>,
}

impl PostgresBalanceStore {
    pub fn new(pool: PgPool, log: Arc<dyn LogProducer>, cache: Option<redis::aio::ConnectionManager>) -> Self {
        Self {
            pool,
            log,
            cache: cache.map(tokio::sync::Mutex::new),
        }
    }
}

#[async_trait::async_trait]
impl BalanceStore for PostgresBalanceStore {
    async fn balance(&self, account_id: i64, currency: &str) -> anyhow::Result<Option<BalanceSnapshot>> {
        if let Some(cache) = &self.cache {
            let mut conn = cache.lock().await;
            if let Some(snap) = bal_snapshot::read_cached(&mut conn, account_id, currency).await? {
                return Ok(Some(snap));
            }
        }
        bal_db::balance_fetch(&self.pool, account_id, currency).await
    }

    async fn submit(&self, request: &MutationRequest) -> Result<Uuid, EnqueueError> {
        bal_outbox::enqueue(&self.pool, self.log.as_ref(), request).await
    }
}

/// One partition's whole lifecycle: elect, own, process batches, yield.
/// Driven entirely by `bal_lease::WorkerState` so the legal-transition
/// rules live in one place, shared with `bal-lease`'s own tests.
pub struct PartitionSupervisor {
    pub partition: i32,
    pub runner: PartitionRunner,
    pub consumer: Arc<dyn LogConsumer>,
    pub lease: Arc<dyn LeaseGuard>,
    pub elect_interval: Duration,
    pub renew_interval: Duration,
}

impl PartitionSupervisor {
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut state = WorkerState::default();

        loop {
            match state.phase() {
                WorkerPhase::Stopped => return,

                WorkerPhase::Follower => {
                    if *stop.borrow() {
                        let _ = state.apply(WorkerEvent::Shutdown);
                        continue;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.elect_interval) => {
                            let _ = state.apply(WorkerEvent::AttemptElection);
                        }
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                let _ = state.apply(WorkerEvent::Shutdown);
                            }
                        }
                    }
                }

                WorkerPhase::Candidate => match self.lease.acquire().await {
                    Ok(true) => {
                        let _ = state.apply(WorkerEvent::LeaseGranted);
                        if let Err(e) = self.runner.recover(self.consumer.as_ref()).await {
                            tracing::warn!(partition = self.partition, error = %e, "offset recovery failed");
                        }
                    }
                    Ok(false) => {
                        let _ = state.apply(WorkerEvent::LeaseLost);
                        tokio::time::sleep(self.elect_interval).await;
                    }
                    Err(e) => {
                        tracing::warn!(partition = self.partition, error = %e, "lease acquire errored");
                        let _ = state.apply(WorkerEvent::LeaseLost);
                        tokio::time::sleep(self.elect_interval).await;
                    }
                },

                WorkerPhase::Leader => {
                    if *stop.borrow() {
                        let _ = state.apply(WorkerEvent::Shutdown);
                        continue;
                    }
                    tokio::select! {
                        outcome = self.runner.process_once(self.consumer.as_ref()) => {
                            match outcome {
                                Ok(_) => {
                                    if !self.lease.renew().await.unwrap_or(false) {
                                        let _ = state.apply(WorkerEvent::LeaseLost);
                                    }
                                }
                                Err(bal_db::batch::CommitError::LeaseLost(_)) => {
                                    let _ = state.apply(WorkerEvent::LeaseLost);
                                }
                                Err(e) => {
                                    tracing::error!(partition = self.partition, error = %e, "batch commit failed");
                                }
                            }
                        }
                        _ = tokio::time::sleep(self.renew_interval) => {
                            if !self.lease.renew().await.unwrap_or(false) {
                                let _ = state.apply(WorkerEvent::LeaseLost);
                            }
                        }
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                let _ = state.apply(WorkerEvent::Shutdown);
                            }
                        }
                    }
                }

                WorkerPhase::Draining => {
                    let _ = self.lease.release().await;
                    let _ = state.apply(WorkerEvent::DrainComplete);
                }
            }
        }
    }
}

/// Everything the process needs to serve reads/writes and own its
/// partitions, constructed once at startup.
pub struct RootRuntime {
    pub pool: PgPool,
    pub balance_store: Arc<dyn BalanceStore>,
    pub log_producer: Arc<dyn LogProducer>,
    pub supervisors: Vec<PartitionSupervisor>,
    pub snapshot_updater: Option<Arc<SnapshotUpdater>>,
    pub sweeper_interval: Duration,
    pub retry: bal_config::RetryConfig,
}

impl RootRuntime {
    pub async fn bootstrap(
        config: &BalanceEngineConfig,
        secrets: &ResolvedSecrets,
        partitions: Vec<i32>,
        consumer_group: String,
    ) -> anyhow::Result<Self> {
        let pool_settings = DbPoolSettings {
            max_conns: config.db_pool.max_conns,
            connect_timeout_ms: config.db_pool.connect_timeout_ms,
        };
        let pool = bal_db::connect(&secrets.database_url, &pool_settings).await?;
        bal_db::migrate(&pool).await?;

        let log_producer: Arc<dyn LogProducer> = Arc::new(KafkaLogProducer::new(&secrets.kafka_brokers)?);

        let mut cache_conn = None;
        let snapshot_updater: Option<Arc<SnapshotUpdater>> = {
            let sink = RedisSnapshotSink::connect(&secrets.redis_url).await;
            match sink {
                Ok(sink) => {
                    if let Ok(client) = redis::Client::open(secrets.redis_url.as_str()) {
                        if let Ok(conn) = client.get_connection_manager().await {
                            cache_conn = Some(conn);
                        }
                    }
                    Some(Arc::new(SnapshotUpdater::spawn(
                        config.snapshot.clone(),
                        Arc::new(sink) as Arc<dyn SnapshotSink>,
                    )))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "snapshot cache unavailable at startup, reads will fall back to the database");
                    None
                }
            }
        };

        let mut supervisors = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let holder_id = format!("consumer-{partition}-{}", Uuid::new_v4());
            let consumer: Arc<dyn LogConsumer> = Arc::new(KafkaLogConsumer::new(&secrets.kafka_brokers, &consumer_group)?);
            let lease: Arc<dyn LeaseGuard> = Arc::new(PostgresLeaseGuard::new(
                pool.clone(),
                partition.to_string(),
                holder_id.clone(),
                &config.lease,
            ));

            let runner = PartitionRunner {
                pool: pool.clone(),
                lease: lease.clone(),
                holder_id,
                partition,
                topic: TOPIC_BALANCE_CHANGES.to_string(),
                consumer_group: consumer_group.clone(),
                batch: config.batch.clone(),
                working_set: WorkingSet::new(),
                snapshot_updater: snapshot_updater.clone(),
            };

            supervisors.push(PartitionSupervisor {
                partition,
                runner,
                consumer,
                lease,
                elect_interval: Duration::from_millis(config.lease.renew_ms),
                renew_interval: Duration::from_millis(config.lease.renew_ms),
            });
        }

        let balance_store: Arc<dyn BalanceStore> =
            Arc::new(PostgresBalanceStore::new(pool.clone(), log_producer.clone(), cache_conn));

        Ok(Self {
            pool,
            balance_store,
            log_producer,
            supervisors,
            snapshot_updater,
            sweeper_interval: Duration::from_millis(config.retry.initial_interval_ms),
            retry: config.retry.clone(),
        })
    }

    /// Run every partition supervisor and the outbox sweeper until
    /// `shutdown` fires, then wait for each to drain (release its lease)
    /// before returning.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut handles = Vec::new();
        for supervisor in self.supervisors {
            let rx = stop_rx.clone();
            handles.push(tokio::spawn(supervisor.run(rx)));
        }

        let sweeper_pool = self.pool.clone();
        let sweeper_log = self.log_producer.clone();
        let retry = self.retry.clone();
        let interval = self.sweeper_interval;
        let mut sweeper_stop = stop_rx.clone();
        let sweeper_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sweeper = Sweeper::new(&sweeper_pool, sweeper_log.as_ref(), retry.clone(), chrono::Duration::seconds(30));
                        if let Err(e) = sweeper.sweep_once().await {
                            tracing::warn!(error = %e, "outbox sweep failed");
                        }
                    }
                    _ = sweeper_stop.changed() => {
                        if *sweeper_stop.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        shutdown.changed().await.ok();
        let _ = stop_tx.send(true);

        for handle in handles {
            let _ = handle.await;
        }
        let _ = sweeper_handle.await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopLogProducer;

    #[async_trait::async_trait]
    impl LogProducer for NoopLogProducer {
        async fn publish(&self, _topic: &str, _partition_key: &str, _envelope: &bal_schemas::LogEnvelope) -> anyhow::Result<()> {
            Ok(())
        }
        async fn publish_dlq(&self, _topic: &str, _record: &bal_schemas::DlqRecord) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn balance_store_is_object_safe_and_constructible() {
        // A compile-time check that BalanceStore can be used as a trait
        // object; no DB access performed.
        fn assert_object_safe(_: &dyn BalanceStore) {}
        let pool = PgPool::connect_lazy("postgres://localhost/does_not_need_to_exist").unwrap();
        let log: Arc<dyn LogProducer> = Arc::new(NoopLogProducer);
        let store = PostgresBalanceStore::new(pool, log, None);
        assert_object_safe(&store);
    }
}
