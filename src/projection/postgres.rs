//! PostgreSQL profile store.

use async_trait::async_trait;
use sea_query::{Alias, Expr, OnConflict, PostgresQueryBuilder, Query};
use sea_query_binder::SqlxBinder;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use super::schema::{UserProfiles, Users, CREATE_POSTGRES_PROFILES};
use super::{InsertOutcome, NewProfile, Profile, ProfileStore};
use crate::storage::{Result, StoreError};

/// [`ProfileStore`] over `user_profiles.users`.
pub struct PostgresProfileStore {
    pool: PgPool,
}

impl PostgresProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema and table if they do not exist.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_POSTGRES_PROFILES)
            .execute(&self.pool)
            .await?;
        info!("Profile schema ready");
        Ok(())
    }
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|e| StoreError::Invalid(format!("user id '{}': {}", id, e)))
}

#[async_trait]
impl ProfileStore for PostgresProfileStore {
    async fn insert_if_absent(&self, profile: &NewProfile) -> Result<InsertOutcome> {
        let id = parse_id(&profile.id)?;

        let (sql, values) = Query::insert()
            .into_table((UserProfiles, Users::Table))
            .columns([Users::Id, Users::Username])
            .values_panic([
                Expr::val(id.to_string()).cast_as(Alias::new("UUID")),
                profile.username.as_str().into(),
            ])
            .on_conflict(OnConflict::column(Users::Id).do_nothing().to_owned())
            .build_sqlx(PostgresQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::AlreadyExists
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Profile>> {
        let uuid = match parse_id(id) {
            Ok(uuid) => uuid,
            Err(_) => return Ok(None),
        };

        let (sql, values) = Query::select()
            .expr_as(Expr::col(Users::Id).cast_as(Alias::new("TEXT")), Alias::new("id"))
            .columns([Users::Username, Users::PublicKey])
            .from((UserProfiles, Users::Table))
            .and_where(Expr::col(Users::Id).eq(Expr::val(uuid.to_string()).cast_as(Alias::new("UUID"))))
            .build_sqlx(PostgresQueryBuilder);

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
