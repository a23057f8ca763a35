//! Profile table identifiers for sea-query and the DDL that creates them.

use sea_query::Iden;

/// Schema holding the projection on PostgreSQL.
#[derive(Iden)]
pub struct UserProfiles;

/// Profile table.
#[derive(Iden)]
pub enum Users {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "username"]
    Username,
    #[iden = "public_key"]
    PublicKey,
}

/// PostgreSQL: `user_profiles.users`, id is a UUID.
pub const CREATE_POSTGRES_PROFILES: &str = r#"
CREATE SCHEMA IF NOT EXISTS user_profiles;

CREATE TABLE IF NOT EXISTS user_profiles.users (
    id UUID PRIMARY KEY,
    username TEXT NOT NULL,
    public_key TEXT
);
"#;

/// SQLite: a single `users` table keyed by the id text.
pub const CREATE_SQLITE_PROFILES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    public_key TEXT
);
"#;
