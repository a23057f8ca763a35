//! SQLite profile store.

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqlitePool};

use super::schema::{Users, CREATE_SQLITE_PROFILES};
use super::{InsertOutcome, NewProfile, Profile, ProfileStore};
use crate::storage::Result;

/// [`ProfileStore`] over a local `users` table.
pub struct SqliteProfileStore {
    pool: SqlitePool,
}

impl SqliteProfileStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_SQLITE_PROFILES)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for SqliteProfileStore {
    async fn insert_if_absent(&self, profile: &NewProfile) -> Result<InsertOutcome> {
        let (sql, values) = Query::insert()
            .into_table(Users::Table)
            .columns([Users::Id, Users::Username])
            .values_panic([profile.id.as_str().into(), profile.username.as_str().into()])
            .on_conflict(OnConflict::column(Users::Id).do_nothing().to_owned())
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::AlreadyExists
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Profile>> {
        let (sql, values) = Query::select()
            .columns([Users::Id, Users::Username, Users::PublicKey])
            .from(Users::Table)
            .and_where(Expr::col(Users::Id).eq(id))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<Profile> {
            Ok(Profile {
                id: row.try_get("id")?,
                username: row.try_get("username")?,
                public_key: row.try_get("public_key")?,
            })
        })
        .transpose()
    }
}
