use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::config::RelayConfig;

pub async fn run(cfg: &RelayConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("connect relay db")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("migrate relay db")?;

    tracing::info!("migrations applied");
    Ok(())
}
