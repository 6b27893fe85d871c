use crate::config::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// The query pipeline is only usable when the approved projection exists.
pub async fn check_approved_view(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as(
        "SELECT table_name::text FROM information_schema.views WHERE table_name = 'approved_tickets'",
    )
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}
