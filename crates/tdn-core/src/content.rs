// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use serde::{Deserialize, Serialize};

use crate::{
    ids::{ContentHash, Signature},
    store::ContentStore,
    wire::{from_cbor, to_cbor},
};

/// What a transaction declares about its data file: the file's content
/// hash and, for split files, the hash of the chunk manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDescriptor {
    pub data_hash: ContentHash,
    pub metadata_hash: Option<ContentHash>,
}

/// Manifest listing the ordered chunk hashes of a split file.  Itself
/// content-addressed: its hash is the transaction's metadata hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub chunks: Vec<[u8; 32]>,
}

impl ChunkManifest {
    pub fn new(chunks: Vec<ContentHash>) -> Self {
        Self {
            chunks: chunks.into_iter().map(|h| h.0).collect(),
        }
    }

    pub fn chunk_hashes(&self) -> Vec<ContentHash> {
        self.chunks.iter().copied().map(ContentHash).collect()
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        to_cbor(self)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        from_cbor(bytes)
    }
}

/// Handle for one logical data file.  Holds identifiers only; every
/// existence question is answered by the content store at call time.
///
/// A file without a metadata hash is atomic: one hash, one unit to fetch.
/// A file with one is complete only once the manifest file and every
/// chunk it lists are present locally.
#[derive(Debug, Clone)]
pub struct DataFile {
    pub hash: ContentHash,
    pub signature: Signature,
    pub metadata_hash: Option<ContentHash>,
}

impl DataFile {
    /// Build a handle from a transaction's declared descriptor.  Pure;
    /// does not touch the store.
    pub fn resolve(signature: Signature, descriptor: &DataDescriptor) -> Self {
        Self {
            hash: descriptor.data_hash,
            signature,
            metadata_hash: descriptor.metadata_hash,
        }
    }

    /// The hashes a fetch pass should go after right now.
    ///
    /// Without a metadata hash that is the file itself.  With one, the
    /// manifest must be fetched first — until it is present locally the
    /// chunk hashes are simply unknown, so only the metadata hash is
    /// returned and a later pass picks up the chunks.
    pub async fn required_hashes(
        &self,
        store: &dyn ContentStore,
    ) -> anyhow::Result<Vec<ContentHash>> {
        let Some(metadata_hash) = self.metadata_hash else {
            return Ok(vec![self.hash]);
        };
        if !store.exists(&metadata_hash).await? {
            return Ok(vec![metadata_hash]);
        }
        let manifest = self.read_manifest(store).await?;
        Ok(manifest.chunk_hashes())
    }

    /// True iff the manifest (when applicable) and every chunk it lists
    /// exist locally.  Re-queries the store every time.
    pub async fn is_complete(&self, store: &dyn ContentStore) -> anyhow::Result<bool> {
        let Some(metadata_hash) = self.metadata_hash else {
            return store.exists(&self.hash).await;
        };
        if !store.exists(&metadata_hash).await? {
            return Ok(false);
        }
        let manifest = self.read_manifest(store).await?;
        for chunk in manifest.chunk_hashes() {
            if !store.exists(&chunk).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn read_manifest(&self, store: &dyn ContentStore) -> anyhow::Result<ChunkManifest> {
        let metadata_hash = self
            .metadata_hash
            .ok_or_else(|| anyhow::anyhow!("data file has no metadata hash"))?;
        let bytes = store
            .get(&metadata_hash)
            .await?
            .ok_or_else(|| anyhow::anyhow!("manifest {} vanished from store", metadata_hash))?;
        ChunkManifest::decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn sig(byte: u8) -> Signature {
        Signature([byte; 64])
    }

    #[test]
    fn manifest_cbor_roundtrip() {
        let manifest = ChunkManifest::new(vec![
            ContentHash::from_bytes(b"chunk-0"),
            ContentHash::from_bytes(b"chunk-1"),
        ]);
        let decoded = ChunkManifest::decode(&manifest.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, manifest);
    }

    #[tokio::test]
    async fn atomic_file_requires_its_own_hash() {
        let store = MemoryStore::new();
        let file = DataFile::resolve(
            sig(1),
            &DataDescriptor {
                data_hash: ContentHash::from_bytes(b"whole file"),
                metadata_hash: None,
            },
        );

        let required = file.required_hashes(&store).await.expect("required");
        assert_eq!(required, vec![file.hash]);
        assert!(!file.is_complete(&store).await.expect("complete"));

        store.put(&file.hash, b"whole file").await.expect("put");
        assert!(file.is_complete(&store).await.expect("complete"));
    }

    #[tokio::test]
    async fn split_file_requires_manifest_before_chunks() {
        let store = MemoryStore::new();
        let chunk_a = ContentHash::from_bytes(b"a");
        let chunk_b = ContentHash::from_bytes(b"b");
        let manifest = ChunkManifest::new(vec![chunk_a, chunk_b]);
        let manifest_bytes = manifest.encode().expect("encode");
        let metadata_hash = ContentHash::from_bytes(&manifest_bytes);

        let file = DataFile::resolve(
            sig(2),
            &DataDescriptor {
                data_hash: ContentHash::from_bytes(b"logical file"),
                metadata_hash: Some(metadata_hash),
            },
        );

        // Pass 1: chunks are unknowable until the manifest is local.
        let required = file.required_hashes(&store).await.expect("required");
        assert_eq!(required, vec![metadata_hash]);

        store
            .put(&metadata_hash, &manifest_bytes)
            .await
            .expect("put manifest");

        // Pass 2: the manifest's chunk list drives the fetch.
        let required = file.required_hashes(&store).await.expect("required");
        assert_eq!(required, vec![chunk_a, chunk_b]);
        assert!(!file.is_complete(&store).await.expect("complete"));

        store.put(&chunk_a, b"a").await.expect("put chunk");
        assert!(!file.is_complete(&store).await.expect("complete"));
        store.put(&chunk_b, b"b").await.expect("put chunk");
        assert!(file.is_complete(&store).await.expect("complete"));
    }

    #[tokio::test]
    async fn is_complete_is_idempotent_without_storage_changes() {
        let store = MemoryStore::new();
        let file = DataFile::resolve(
            sig(3),
            &DataDescriptor {
                data_hash: ContentHash::from_bytes(b"idempotent"),
                metadata_hash: None,
            },
        );
        store.put(&file.hash, b"idempotent").await.expect("put");

        let first = file.is_complete(&store).await.expect("complete");
        let second = file.is_complete(&store).await.expect("complete");
        assert_eq!(first, second);
        assert!(first);
    }
}
