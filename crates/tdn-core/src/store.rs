// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Content-addressed file storage.
//!
//! The fetch subsystem never caches existence in memory; every check is a
//! query against this trait, so the store is always the single source of
//! truth for what the node holds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::ids::ContentHash;

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn exists(&self, hash: &ContentHash) -> anyhow::Result<bool>;
    async fn get(&self, hash: &ContentHash) -> anyhow::Result<Option<Vec<u8>>>;
    async fn put(&self, hash: &ContentHash, bytes: &[u8]) -> anyhow::Result<()>;
    async fn delete(&self, hash: &ContentHash) -> anyhow::Result<()>;
}

/// Filesystem store: one file per content hash, sharded by the first hex
/// byte so a large holding does not degenerate into one huge directory.
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn open(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, hash: &ContentHash) -> PathBuf {
        let hex = hex::encode(hash.0);
        self.root.join(&hex[..2]).join(hex)
    }
}

#[async_trait]
impl ContentStore for DiskStore {
    async fn exists(&self, hash: &ContentHash) -> anyhow::Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(hash)).await?)
    }

    async fn get(&self, hash: &ContentHash) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(hash)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, hash: &ContentHash, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.path_for(hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a crash mid-write never leaves a partial
        // file that would pass the existence check.
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, hash: &ContentHash) -> anyhow::Result<()> {
        match tokio::fs::remove_file(self.path_for(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryStore {
    files: RwLock<HashMap<ContentHash, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn exists(&self, hash: &ContentHash) -> anyhow::Result<bool> {
        Ok(self.files.read().await.contains_key(hash))
    }

    async fn get(&self, hash: &ContentHash) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.files.read().await.get(hash).cloned())
    }

    async fn put(&self, hash: &ContentHash, bytes: &[u8]) -> anyhow::Result<()> {
        self.files.write().await.insert(*hash, bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, hash: &ContentHash) -> anyhow::Result<()> {
        self.files.write().await.remove(hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disk_store_put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::open(dir.path()).expect("open");
        let bytes = vec![42u8; 1024];
        let hash = ContentHash::from_bytes(&bytes);

        assert!(!store.exists(&hash).await.expect("exists"));
        store.put(&hash, &bytes).await.expect("put");
        assert!(store.exists(&hash).await.expect("exists"));
        assert_eq!(store.get(&hash).await.expect("get"), Some(bytes));

        store.delete(&hash).await.expect("delete");
        assert!(!store.exists(&hash).await.expect("exists"));
        assert_eq!(store.get(&hash).await.expect("get"), None);
    }

    #[tokio::test]
    async fn disk_store_delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::open(dir.path()).expect("open");
        let hash = ContentHash::from_bytes(b"never stored");
        store.delete(&hash).await.expect("delete of absent file");
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        let hash = ContentHash::from_bytes(b"payload");
        store.put(&hash, b"payload").await.expect("put");
        assert!(store.exists(&hash).await.expect("exists"));
        store.delete(&hash).await.expect("delete");
        assert!(!store.exists(&hash).await.expect("exists"));
    }
}
