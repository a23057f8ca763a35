//! Shared storage plumbing: error type and connection pools.

#[cfg(feature = "postgres")]
use tracing::info;

#[cfg(feature = "postgres")]
use crate::config::DatabaseConfig;

/// Errors raised by the account and profile stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(any(feature = "postgres", feature = "sqlite"))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A unique key is already taken.
    #[error("Duplicate key: {0}")]
    Conflict(String),

    /// The record can never be stored as given.
    #[error("Invalid record: {0}")]
    Invalid(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// True when a database error is a unique-constraint violation.
#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// Open the PostgreSQL pool described by the database section.
#[cfg(feature = "postgres")]
pub async fn connect_postgres(config: &DatabaseConfig) -> Result<sqlx::PgPool> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| StoreError::Unavailable("database.url is not set".to_string()))?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await?;

    info!(max_connections = config.max_connections, "PostgreSQL pool ready");
    Ok(pool)
}
