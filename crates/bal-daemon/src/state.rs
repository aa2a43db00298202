//! Shared runtime state for bal-daemon.
//!
//! All types here are `Clone`-able (via `Arc`). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself.

use bal_runtime::BalanceStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers. The daemon's
/// HTTP surface only ever touches the core through `BalanceStore`; it never
/// reaches into `bal-db`/`bal-log` directly.
#[derive(Clone)]
pub struct AppState {
    pub build: BuildInfo,
    pub balance_store: Arc<dyn BalanceStore>,
}

impl AppState {
    pub fn new(balance_store: Arc<dyn BalanceStore>) -> Self {
        Self {
            build: BuildInfo {
                service: "bal-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            balance_store,
        }
    }
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START.get_or_init(std::time::Instant::now).elapsed().as_secs()
}
