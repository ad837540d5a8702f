//! Directory-backed wallet.
//!
//! Layout:
//! ```text
//! wallet/
//! ├── org1admin.id   (JSON identity record, mode 0600)
//! └── appUser.id
//! ```
//!
//! Writes go to a hidden temp file first and are published with a hard link,
//! which fails if the target exists. A crash mid-write leaves no partial
//! `<label>.id` behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use super::WalletError;
use crate::identity::Identity;

const RECORD_EXT: &str = "id";

#[derive(Debug, Clone)]
pub struct FileSystemWallet {
    dir: PathBuf,
}

impl FileSystemWallet {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, WalletError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| WalletError::Store {
            label: String::new(),
            reason: format!("cannot create wallet dir {}: {e}", dir.display()),
        })?;
        debug!(dir = %dir.display(), "wallet opened");
        Ok(Self { dir })
    }

    fn record_path(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{label}.{RECORD_EXT}"))
    }

    pub(super) async fn exists(&self, label: &str) -> Result<bool, WalletError> {
        fs::try_exists(self.record_path(label))
            .await
            .map_err(|e| store_err(label, format!("cannot stat record: {e}")))
    }

    pub(super) async fn put(&self, identity: &Identity) -> Result<(), WalletError> {
        let label = identity.label.as_str();
        let data = serde_json::to_vec_pretty(identity)
            .map_err(|e| store_err(label, format!("cannot serialise record: {e}")))?;

        let tmp = self.dir.join(format!(".{label}.{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp, &data)
            .await
            .map_err(|e| store_err(label, format!("cannot write {}: {e}", tmp.display())))?;

        let published = self.publish(label, &tmp).await;
        // The temp file is only a staging copy; losing it is harmless.
        let _ = fs::remove_file(&tmp).await;
        published?;

        debug!(label, dir = %self.dir.display(), "identity stored");
        Ok(())
    }

    async fn publish(&self, label: &str, tmp: &Path) -> Result<(), WalletError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| store_err(label, format!("cannot set permissions: {e}")))?;
        }

        match fs::hard_link(tmp, self.record_path(label)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(WalletError::Occupied(label.to_string())),
            Err(e) => Err(store_err(label, format!("cannot publish record: {e}"))),
        }
    }

    pub(super) async fn get(&self, label: &str) -> Result<Identity, WalletError> {
        let path = self.record_path(label);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(WalletError::NotFound(label.to_string())),
            Err(e) => return Err(store_err(label, format!("cannot read {}: {e}", path.display()))),
        };
        let mut identity: Identity = serde_json::from_slice(&data).map_err(|e| WalletError::Corrupt {
            label: label.to_string(),
            reason: e.to_string(),
        })?;
        identity.label = label.to_string();
        Ok(identity)
    }

    pub(super) async fn remove(&self, label: &str) -> Result<bool, WalletError> {
        match fs::remove_file(self.record_path(label)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(store_err(label, format!("cannot remove record: {e}"))),
        }
    }

    pub(super) async fn list(&self) -> Result<Vec<String>, WalletError> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| store_err("", format!("cannot read wallet dir: {e}")))?;
        let mut labels = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| store_err("", format!("cannot read wallet dir: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    labels.push(stem.to_string());
                }
            }
        }
        labels.sort();
        Ok(labels)
    }
}

fn store_err(label: &str, reason: String) -> WalletError {
    WalletError::Store { label: label.to_string(), reason }
}
