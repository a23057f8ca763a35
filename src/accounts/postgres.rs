//! PostgreSQL account store.
//!
//! Passwords are hashed inside the database with pgcrypto's bcrypt
//! (`crypt(.., gen_salt('bf', 10))`).

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::AccountStore;
use crate::storage::{is_unique_violation, Result, StoreError};

/// DDL for `auth.users`.
pub const CREATE_AUTH_USERS: &str = r#"
CREATE EXTENSION IF NOT EXISTS pgcrypto;

CREATE SCHEMA IF NOT EXISTS auth;

CREATE TABLE IF NOT EXISTS auth.users (
    id UUID PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

const INSERT_ACCOUNT: &str =
    "INSERT INTO auth.users (id, username, password_hash) VALUES ($1, $2, crypt($3, gen_salt('bf', 10)))";

/// [`AccountStore`] over `auth.users`.
pub struct PostgresAccountStore {
    pool: PgPool,
}

impl PostgresAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_AUTH_USERS).execute(&self.pool).await?;
        info!("Account schema ready");
        Ok(())
    }
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    async fn create(&self, id: Uuid, username: &str, password: &str) -> Result<()> {
        sqlx::query(INSERT_ACCOUNT)
            .bind(id)
            .bind(username)
            .bind(password)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict(username.to_string())
                } else {
                    StoreError::Database(e)
                }
            })?;
        Ok(())
    }
}
