//! In-memory profile store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{InsertOutcome, NewProfile, Profile, ProfileStore};
use crate::storage::{Result, StoreError};

/// HashMap-backed [`ProfileStore`] with injectable failures.
#[derive(Default)]
pub struct MemoryProfileStore {
    rows: Mutex<HashMap<String, Profile>>,
    failures: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` inserts fail with [`StoreError::Unavailable`].
    pub fn fail_next_inserts(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts attempted, including failed ones and duplicates.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn insert_if_absent(&self, profile: &NewProfile) -> Result<InsertOutcome> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        if rows.contains_key(&profile.id) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        rows.insert(
            profile.id.clone(),
            Profile {
                id: profile.id.clone(),
                username: profile.username.clone(),
                public_key: None,
            },
        );
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, id: &str) -> Result<Option<Profile>> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }
}
