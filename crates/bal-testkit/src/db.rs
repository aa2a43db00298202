//! Postgres fixture shared by scenario tests. Connects to a real database —
//! there is no mocked SQL layer — and truncates the core tables between
//! cases so tests stay independent without needing a fresh container per run.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Env var scenario tests check before touching a real database. Kept
/// distinct from `BAL_DATABASE_URL` so a developer's daemon config can
/// point at a real cluster while tests run against a disposable one.
pub const ENV_TEST_DB_URL: &str = "BAL_TEST_DATABASE_URL";

/// Connect and migrate, or return `Ok(None)` if no test database is
/// configured. Callers should skip (not fail) the test in that case —
/// see the `scenario_*` tests under `tests/` for the pattern.
pub async fn connect_test_pool() -> Result<Option<PgPool>> {
    let url = match std::env::var(ENV_TEST_DB_URL) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => return Ok(None),
    };

    let pool = bal_db::connect(&url, &bal_db::DbPoolSettings::default())
        .await
        .context("connect to test database")?;
    bal_db::migrate(&pool).await.context("migrate test database")?;
    Ok(Some(pool))
}

/// Wipe every row from the core tables. Order matters only in that none of
/// these tables carry foreign keys to each other, so a flat `truncate` list
/// is safe.
pub async fn truncate_all(pool: &PgPool) -> Result<()> {
    sqlx::query("truncate table balances, ledger, outbox, leader_lease, consumer_offset")
        .execute(pool)
        .await
        .context("truncate fixture tables")?;
    Ok(())
}
