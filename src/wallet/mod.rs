//! Identity wallet: durable `label → Identity` store.
//!
//! The wallet is the idempotence gate for enrollment: callers check
//! [`Wallet::exists`] before contacting the CA and never re-issue a credential
//! for a label that is already present. [`Wallet::put`] enforces the same rule
//! and refuses to overwrite an occupied label.
//!
//! Two backends, dispatched by enum:
//!
//! - [`FileSystemWallet`]: one `<label>.id` JSON file per identity.
//! - [`InMemoryWallet`]: process-local map, for tests and throwaway runs.
//!
//! Single writer, single process. Pointing two processes at the same wallet
//! directory is unsupported.

mod fs;
mod memory;

use std::path::Path;

use thiserror::Error;

pub use fs::FileSystemWallet;
pub use memory::InMemoryWallet;

use crate::identity::Identity;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("identity '{0}' not found in wallet")]
    NotFound(String),
    #[error("identity '{0}' already exists in wallet")]
    Occupied(String),
    #[error("invalid wallet label '{0}'")]
    InvalidLabel(String),
    #[error("wallet store error for '{label}': {reason}")]
    Store { label: String, reason: String },
    #[error("corrupt wallet record '{label}': {reason}")]
    Corrupt { label: String, reason: String },
}

// ── Wallet enum ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Wallet {
    FileSystem(FileSystemWallet),
    InMemory(InMemoryWallet),
}

impl Wallet {
    /// Open (and create if needed) a directory-backed wallet.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, WalletError> {
        Ok(Wallet::FileSystem(FileSystemWallet::open(dir).await?))
    }

    pub fn in_memory() -> Self {
        Wallet::InMemory(InMemoryWallet::default())
    }

    pub async fn exists(&self, label: &str) -> Result<bool, WalletError> {
        validate_label(label)?;
        match self {
            Wallet::FileSystem(w) => w.exists(label).await,
            Wallet::InMemory(w) => Ok(w.exists(label)),
        }
    }

    /// Store `identity` under `identity.label`. Fails with
    /// [`WalletError::Occupied`] if the label is taken.
    pub async fn put(&self, identity: &Identity) -> Result<(), WalletError> {
        validate_label(&identity.label)?;
        match self {
            Wallet::FileSystem(w) => w.put(identity).await,
            Wallet::InMemory(w) => w.put(identity),
        }
    }

    pub async fn get(&self, label: &str) -> Result<Identity, WalletError> {
        validate_label(label)?;
        match self {
            Wallet::FileSystem(w) => w.get(label).await,
            Wallet::InMemory(w) => w.get(label),
        }
    }

    /// Returns `true` if a record was removed.
    pub async fn remove(&self, label: &str) -> Result<bool, WalletError> {
        validate_label(label)?;
        match self {
            Wallet::FileSystem(w) => w.remove(label).await,
            Wallet::InMemory(w) => Ok(w.remove(label)),
        }
    }

    /// All labels, sorted.
    pub async fn list(&self) -> Result<Vec<String>, WalletError> {
        match self {
            Wallet::FileSystem(w) => w.list().await,
            Wallet::InMemory(w) => Ok(w.list()),
        }
    }
}

/// Labels become file names, so keep them to a single path component.
fn validate_label(label: &str) -> Result<(), WalletError> {
    let bad = label.is_empty()
        || label.starts_with('.')
        || label.contains(['/', '\\', '\0']);
    if bad {
        return Err(WalletError::InvalidLabel(label.to_string()));
    }
    Ok(())
}

// ── tests ─────────────────────────────────────────────────────────────────────
