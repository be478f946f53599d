//! Database setup and initialization

use anyhow::{Context, Result};
use sqlx::PgPool;

use taskrelay_core::Config;

/// Open the pool and apply pending task-store migrations.
pub async fn setup_database(config: &Config) -> Result<PgPool> {
    let pool = taskrelay_db::connect(
        &config.database_url,
        config.base.db_max_connections,
        config.base.db_timeout_seconds,
    )
    .await?;

    taskrelay_db::run_migrations(&pool)
        .await
        .context("Failed to prepare task store schema")?;

    Ok(pool)
}
