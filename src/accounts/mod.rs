//! Account registration.
//!
//! [`RegistrationService`] is the upstream side of event propagation: it
//! commits the account first, then publishes `UserRegistered` best-effort.
//! A messaging failure never undoes or fails the registration.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};
use uuid::Uuid;

use crate::broker::{PublishReceipt, Publisher};
use crate::envelope::UserRegistered;
use crate::storage::{Result, StoreError};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryAccountStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAccountStore;

/// Longest accepted username.
pub const MAX_USERNAME_LEN: usize = 64;

/// Account storage boundary.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Store a new account, hashing the password.
    ///
    /// Fails with [`StoreError::Conflict`] when the username is taken.
    async fn create(&self, id: Uuid, username: &str, password: &str) -> Result<()>;
}

/// Why a registration was refused.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("{0}")]
    Validation(String),

    #[error("Username already taken")]
    Conflict,

    #[error("Account store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for RegistrationError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(_) => RegistrationError::Conflict,
            other => RegistrationError::Store(other),
        }
    }
}

/// A committed registration.
#[derive(Debug)]
pub struct Registered {
    pub user_id: Uuid,
    /// Pending broker confirmation, if the event was handed off.
    pub receipt: Option<PublishReceipt>,
}

/// Creates accounts and announces them.
#[derive(Clone)]
pub struct RegistrationService {
    accounts: Arc<dyn AccountStore>,
    publisher: Publisher,
}

impl RegistrationService {
    pub fn new(accounts: Arc<dyn AccountStore>, publisher: Publisher) -> Self {
        Self {
            accounts,
            publisher,
        }
    }

    /// Register an account.
    ///
    /// Returns once the account is stored. The `UserRegistered` publish is
    /// bounded by the publisher's handoff timeout and its outcome does not
    /// affect the result.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        trace_id: &str,
    ) -> std::result::Result<Registered, RegistrationError> {
        let username = validate(username, password)?;
        let user_id = Uuid::new_v4();

        self.accounts
            .create(user_id, username, password)
            .await
            .map_err(|e| {
                if !matches!(e, StoreError::Conflict(_)) {
                    error!(trace_id, error = %e, "Failed to store account");
                }
                RegistrationError::from(e)
            })?;

        info!(trace_id, user_id = %user_id, username, "Account created");

        let envelope = UserRegistered {
            user_id: user_id.to_string(),
            username: username.to_string(),
        }
        .into_envelope(Some(trace_id.to_string()));
        let receipt = self.publisher.publish_best_effort(&envelope).await;

        Ok(Registered { user_id, receipt })
    }
}

fn validate<'a>(username: &'a str, password: &str) -> std::result::Result<&'a str, RegistrationError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(RegistrationError::Validation("username is required".to_string()));
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(RegistrationError::Validation(format!(
            "username must be at most {} characters",
            MAX_USERNAME_LEN
        )));
    }
    if password.is_empty() {
        return Err(RegistrationError::Validation("password is required".to_string()));
    }
    Ok(username)
}
