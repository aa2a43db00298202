//! Shared helpers for the `bal` CLI's subcommands.

use anyhow::Result;
use sqlx::PgPool;

/// Connect using `BAL_DATABASE_URL`, the same env var the daemon reads.
pub async fn connect_pool() -> Result<PgPool> {
    bal_db::connect_from_env().await
}
