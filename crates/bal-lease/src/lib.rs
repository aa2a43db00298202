//! Fenced leader election and the partition worker's lifecycle state
//! machine. A single row per partition in the relational store carries
//! `(holder, fencing_token, expires_at)`; the fence check is a locking read
//! performed inside the caller's commit transaction so split-brain writes
//! cannot land even across a brief network partition.

use bal_config::LeaseConfig;
use bal_db::lease as db_lease;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

/// Narrow capability trait for the partition consumer: acquire, renew, fence
/// inside an open transaction, and release. Independently implementable and
/// injected by the root runtime (design notes: breaking the
/// consumer/leader/cache cyclic dependency).
#[async_trait::async_trait]
pub trait LeaseGuard: Send + Sync {
    async fn acquire(&self) -> anyhow::Result<bool>;
    async fn renew(&self) -> anyhow::Result<bool>;
    async fn fence(&self, tx: &mut Transaction<'_, Postgres>) -> anyhow::Result<bool>;
    async fn release(&self) -> anyhow::Result<()>;
    fn fencing_token(&self) -> Option<i64>;
}

pub struct PostgresLeaseGuard {
    pool: PgPool,
    partition: String,
    holder_id: String,
    ttl: chrono::Duration,
    fencing_token: Mutex<Option<i64>>,
}

impl PostgresLeaseGuard {
    pub fn new(pool: PgPool, partition: impl Into<String>, holder_id: impl Into<String>, config: &LeaseConfig) -> Self {
        Self {
            pool,
            partition: partition.into(),
            holder_id: holder_id.into(),
            ttl: chrono::Duration::milliseconds(config.ttl_ms as i64),
            fencing_token: Mutex::new(None),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }
}

#[async_trait::async_trait]
impl LeaseGuard for PostgresLeaseGuard {
    async fn acquire(&self) -> anyhow::Result<bool> {
        let token = db_lease::acquire(&self.pool, &self.partition, &self.holder_id, self.ttl).await?;
        *self.fencing_token.lock().unwrap() = token;
        Ok(token.is_some())
    }

    async fn renew(&self) -> anyhow::Result<bool> {
        let Some(token) = *self.fencing_token.lock().unwrap() else {
            return Ok(false);
        };
        let renewed = db_lease::renew(&self.pool, &self.partition, &self.holder_id, token, self.ttl).await?;
        if !renewed {
            *self.fencing_token.lock().unwrap() = None;
        }
        Ok(renewed)
    }

    async fn fence(&self, tx: &mut Transaction<'_, Postgres>) -> anyhow::Result<bool> {
        let Some(token) = *self.fencing_token.lock().unwrap() else {
            return Ok(false);
        };
        db_lease::fence_check(tx, &self.partition, &self.holder_id, token).await
    }

    async fn release(&self) -> anyhow::Result<()> {
        if let Some(token) = *self.fencing_token.lock().unwrap() {
            db_lease::release(&self.pool, &self.partition, &self.holder_id, token).await?;
        }
        *self.fencing_token.lock().unwrap() = None;
        Ok(())
    }

    fn fencing_token(&self) -> Option<i64> {
        *self.fencing_token.lock().unwrap()
    }
}

/// Periodically renews the lease until told to stop or until a renewal is
/// refused (lease lost). Intended to be spawned as its own task per
/// partition worker.
pub async fn run_renewal_loop(
    guard: std::sync::Arc<dyn LeaseGuard>,
    renew_every: StdDuration,
    mut stop: tokio::sync::watch::Receiver<bool>,
    on_lost: impl Fn() + Send + 'static,
) {
    let mut ticker = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match guard.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(partition = ?std::any::type_name::<()>(), "lease renewal refused, lease lost");
                        on_lost();
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "lease renewal errored");
                    }
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Partition worker lifecycle: follower -> candidate -> leader -> draining ->
// stopped
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerPhase {
    Follower,
    Candidate,
    Leader,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    AttemptElection,
    LeaseGranted,
    LeaseLost,
    Shutdown,
    DrainComplete,
}

/// Returned when an event cannot legally be applied in the current phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: WorkerPhase,
    pub event: WorkerEvent,
}

impl std::fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal worker transition: {:?} + {:?}", self.from, self.event)
    }
}

impl std::error::Error for IllegalTransition {}

/// The partition worker's current lifecycle phase. Transitions are applied
/// one event at a time via [`WorkerState::apply`]; illegal transitions are
/// rejected rather than silently ignored, since a phase mismatch here means
/// the caller's own bookkeeping (lease guard state, batch loop) has drifted.
#[derive(Debug, Clone, Copy)]
pub struct WorkerState {
    phase: WorkerPhase,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            phase: WorkerPhase::Follower,
        }
    }
}

impl WorkerState {
    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn apply(&mut self, event: WorkerEvent) -> Result<WorkerPhase, IllegalTransition> {
        use WorkerEvent::*;
        use WorkerPhase::*;

        let next = match (self.phase, event) {
            (Follower, AttemptElection) => Candidate,
            (Candidate, LeaseGranted) => Leader,
            (Candidate, LeaseLost) => Follower,
            (Leader, LeaseLost) => Follower,
            (Follower | Candidate | Leader, Shutdown) => Draining,
            (Draining, DrainComplete) => Stopped,
            (from, event) => return Err(IllegalTransition { from, event }),
        };

        self.phase = next;
        Ok(next)
    }
}
