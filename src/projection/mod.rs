//! User profile projection.
//!
//! [`ProfileProjector`] applies `UserRegistered` events to a [`ProfileStore`].
//! The store exposes a single write, [`ProfileStore::insert_if_absent`], keyed
//! by the subject id. A row that already exists is never overwritten, so a
//! redelivered event has no further effect and is acknowledged like the first.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info};

use crate::broker::{EnvelopeHandler, HandlerError};
use crate::envelope::{Envelope, UserRegistered};
use crate::storage::{Result, StoreError};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryProfileStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresProfileStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteProfileStore;

/// Profile row to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub id: String,
    pub username: String,
}

/// Stored profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    pub username: String,
    /// Set by the profile owner later; empty after projection.
    pub public_key: Option<String>,
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Profile storage boundary.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Insert the row unless one with the same id exists. Never updates.
    async fn insert_if_absent(&self, profile: &NewProfile) -> Result<InsertOutcome>;

    async fn get(&self, id: &str) -> Result<Option<Profile>>;
}

/// Idempotent handler for `UserRegistered`.
#[derive(Clone)]
pub struct ProfileProjector {
    store: Arc<dyn ProfileStore>,
}

impl ProfileProjector {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    /// Apply one event. Duplicates succeed without touching the store's row.
    pub async fn apply(&self, envelope: &Envelope) -> std::result::Result<InsertOutcome, HandlerError> {
        let event = UserRegistered::try_from(envelope)
            .map_err(|e| HandlerError::Invalid(e.to_string()))?;

        let profile = NewProfile {
            id: event.user_id,
            username: event.username,
        };

        let outcome = self
            .store
            .insert_if_absent(&profile)
            .await
            .map_err(into_handler_error)?;

        match outcome {
            InsertOutcome::Inserted => info!(
                event_id = %envelope.event_id,
                subject_id = %profile.id,
                "Profile created"
            ),
            InsertOutcome::AlreadyExists => debug!(
                event_id = %envelope.event_id,
                subject_id = %profile.id,
                "Profile already exists, skipping"
            ),
        }
        Ok(outcome)
    }
}

impl EnvelopeHandler for ProfileProjector {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let projector = self.clone();
        async move { projector.apply(&envelope).await.map(|_| ()) }.boxed()
    }
}

fn into_handler_error(error: StoreError) -> HandlerError {
    match error {
        StoreError::Invalid(reason) => HandlerError::Invalid(reason),
        other => HandlerError::Failed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::UserRegistered;

    fn registered(user_id: &str, username: &str) -> Envelope {
        UserRegistered {
            user_id: user_id.to_string(),
            username: username.to_string(),
        }
        .into_envelope(None)
    }

    // ============================================================================
    // Idempotency
    // ============================================================================

    #[tokio::test]
    async fn test_redelivery_leaves_one_row() {
        let store = Arc::new(MemoryProfileStore::new());
        let projector = ProfileProjector::new(store.clone());
        let envelope = Arc::new(registered("u1", "alice").with_event_id("e1"));

        for _ in 0..3 {
            projector.handle(envelope.clone()).await.unwrap();
        }

        assert_eq!(store.len(), 1);
        assert_eq!(store.insert_calls(), 3);
    }

    #[tokio::test]
    async fn test_existing_row_not_overwritten() {
        let store = Arc::new(MemoryProfileStore::new());
        let projector = ProfileProjector::new(store.clone());

        let first = projector.apply(&registered("u1", "alice")).await.unwrap();
        let second = projector.apply(&registered("u1", "mallory")).await.unwrap();

        assert_eq!(first, InsertOutcome::Inserted);
        assert_eq!(second, InsertOutcome::AlreadyExists);
        let profile = store.get("u1").await.unwrap().unwrap();
        assert_eq!(profile.username, "alice");
        assert!(profile.public_key.is_none());
    }

    // ============================================================================
    // Failures
    // ============================================================================

    #[tokio::test]
    async fn test_missing_username_is_invalid() {
        let store = Arc::new(MemoryProfileStore::new());
        let projector = ProfileProjector::new(store.clone());
        let envelope = Envelope::new("u1", serde_json::Map::new());

        let err = projector.apply(&envelope).await.unwrap_err();

        assert!(matches!(err, HandlerError::Invalid(_)));
        assert_eq!(store.insert_calls(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_retryable() {
        let store = Arc::new(MemoryProfileStore::new());
        store.fail_next_inserts(1);
        let projector = ProfileProjector::new(store.clone());
        let envelope = registered("u1", "alice");

        let err = projector.apply(&envelope).await.unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));
        assert_eq!(store.len(), 0);

        projector.apply(&envelope).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_invalid_record_maps_to_invalid_event() {
        let err = into_handler_error(StoreError::Invalid("bad id".to_string()));
        assert!(matches!(err, HandlerError::Invalid(_)));

        let err = into_handler_error(StoreError::Unavailable("down".to_string()));
        assert!(matches!(err, HandlerError::Failed(_)));
    }
}
