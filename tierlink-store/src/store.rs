//! Account lookup.

use crate::error::StoreError;
use dashmap::DashMap;
use std::fs;
use std::path::Path;
use tierlink_protocol::message::AccountLookup;

/// Source of account records for the core tier.
pub trait AccountStore: Send + Sync {
    /// Returns the account and its owning customer, or `None` if no account
    /// has this number.
    fn find_by_account_number(
        &self,
        account_number: &str,
    ) -> Result<Option<AccountLookup>, StoreError>;

    /// Number of accounts held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory account store keyed by account number.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: DashMap<String, AccountLookup>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from records, rejecting duplicate account numbers.
    pub fn from_records(
        records: impl IntoIterator<Item = AccountLookup>,
    ) -> Result<Self, StoreError> {
        let store = Self::new();
        for record in records {
            store.insert(record)?;
        }
        Ok(store)
    }

    /// Loads a JSON array of account lookups from `path`.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let records: Vec<AccountLookup> = serde_json::from_str(&content)?;
        let store = Self::from_records(records)?;
        tracing::info!("Loaded {} accounts from {}", store.len(), path.display());
        Ok(store)
    }

    /// Adds a record.
    pub fn insert(&self, record: AccountLookup) -> Result<(), StoreError> {
        let number = record.account.account_number.clone();
        if number.is_empty() {
            return Err(StoreError::InvalidRecord(
                "account_number must not be empty".into(),
            ));
        }
        match self.accounts.entry(number) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                Err(StoreError::DuplicateAccount(e.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(record);
                Ok(())
            }
        }
    }
}

impl AccountStore for MemoryAccountStore {
    fn find_by_account_number(
        &self,
        account_number: &str,
    ) -> Result<Option<AccountLookup>, StoreError> {
        Ok(self
            .accounts
            .get(account_number)
            .map(|entry| entry.value().clone()))
    }

    fn len(&self) -> usize {
        self.accounts.len()
    }
}
