//! Process-local wallet. Clones share the same map.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::WalletError;
use crate::identity::Identity;

#[derive(Debug, Clone, Default)]
pub struct InMemoryWallet {
    records: Arc<Mutex<BTreeMap<String, Identity>>>,
}

impl InMemoryWallet {
    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Identity>> {
        // A poisoned map is still a consistent map: every mutation is a single insert/remove.
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(super) fn exists(&self, label: &str) -> bool {
        self.records().contains_key(label)
    }

    pub(super) fn put(&self, identity: &Identity) -> Result<(), WalletError> {
        let mut records = self.records();
        if records.contains_key(&identity.label) {
            return Err(WalletError::Occupied(identity.label.clone()));
        }
        records.insert(identity.label.clone(), identity.clone());
        Ok(())
    }

    pub(super) fn get(&self, label: &str) -> Result<Identity, WalletError> {
        self.records()
            .get(label)
            .cloned()
            .ok_or_else(|| WalletError::NotFound(label.to_string()))
    }

    pub(super) fn remove(&self, label: &str) -> bool {
        self.records().remove(label).is_some()
    }

    pub(super) fn list(&self) -> Vec<String> {
        self.records().keys().cloned().collect()
    }
}
