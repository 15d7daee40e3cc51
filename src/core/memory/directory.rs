//! In-process user directory
//!
//! Holds the user and merchant profiles the engine needs for enrichment and
//! merchant categories. Registration in the engine and in the directory are
//! separate: the platform owns profiles, the engine owns accounts.

use crate::core::traits::{Directory, MerchantProfile, UserProfile};
use crate::types::{MerchantId, StoreError, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: DashMap<UserId, UserProfile>,
    merchants: DashMap<MerchantId, MerchantProfile>,
    /// Number of batched user lookups served
    user_lookups: AtomicU64,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_user(&self, id: UserId, name: impl Into<String>, email: impl Into<String>) {
        self.users.insert(
            id,
            UserProfile {
                id,
                name: name.into(),
                email: email.into(),
            },
        );
    }

    pub fn upsert_merchant(&self, id: MerchantId, name: impl Into<String>, category: impl Into<String>) {
        self.merchants.insert(
            id,
            MerchantProfile {
                id,
                name: name.into(),
                category: category.into(),
            },
        );
    }

    /// How many times [`Directory::users`] was called.
    pub fn user_lookups(&self) -> u64 {
        self.user_lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn users(&self, ids: &[UserId]) -> Result<HashMap<UserId, UserProfile>, StoreError> {
        self.user_lookups.fetch_add(1, Ordering::Relaxed);
        Ok(ids
            .iter()
            .filter_map(|id| self.users.get(id).map(|entry| (*id, entry.value().clone())))
            .collect())
    }

    async fn merchant(&self, id: MerchantId) -> Result<Option<MerchantProfile>, StoreError> {
        Ok(self.merchants.get(&id).map(|entry| entry.value().clone()))
    }
}
