//! Directory-backed store: one file per key.
//!
//! Writes go to a temporary sibling and are renamed into place, so a crash
//! mid-write leaves either the old or the new value, never a torn one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::store::{KeyValueStore, StoreError};

const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        tracing::debug!(path = ?root, "File store opened");
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/'));
        if !valid || key.contains("..") {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key.replace('/', "!")))
    }
}

fn key_from_file_name(name: &str) -> Option<String> {
    if name.ends_with(TMP_SUFFIX) {
        return None;
    }
    Some(name.replace('!', "/"))
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(key) = name.to_str().and_then(key_from_file_name) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            match fs::read(item.path()).await {
                Ok(bytes) => entries.push((key, bytes)),
                // Deleted between listing and reading.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
