//! In-memory account store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use super::AccountStore;
use crate::storage::{Result, StoreError};

/// Username-keyed [`AccountStore`]. Passwords are not kept.
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<HashMap<String, Uuid>>,
    unavailable: AtomicBool,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn id_of(&self, username: &str) -> Option<Uuid> {
        self.accounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn create(&self, id: Uuid, username: &str, _password: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("account store offline".to_string()));
        }
        let mut accounts = self.accounts.lock().unwrap_or_else(PoisonError::into_inner);
        if accounts.contains_key(username) {
            return Err(StoreError::Conflict(username.to_string()));
        }
        accounts.insert(username.to_string(), id);
        Ok(())
    }
}
