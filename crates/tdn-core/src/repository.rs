// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Collaborator interfaces consumed by the fetch subsystem, plus the
//! persisted peer-association repository.
//!
//! Associations record "this peer was observed serving data for this
//! signature".  They are many-to-many, written after any successful
//! fetch and never proactively invalidated here; staleness is tolerated
//! and pruning is someone else's policy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::{
    content::DataDescriptor,
    ids::Signature,
    peer::PeerAddr,
};

/// Producer of `signature → data descriptor` mappings; backed by the
/// blockchain transaction store, external to this subsystem.
#[async_trait]
pub trait TransactionLookup: Send + Sync {
    /// `None` when the signature is unknown or the transaction carries
    /// no data reference.
    async fn data_descriptor(
        &self,
        signature: &Signature,
    ) -> anyhow::Result<Option<DataDescriptor>>;
}

#[async_trait]
pub trait PeerAssociations: Send + Sync {
    async fn save(&self, signature: &Signature, peer: &PeerAddr) -> anyhow::Result<()>;
    async fn for_signature(&self, signature: &Signature) -> anyhow::Result<Vec<PeerAddr>>;
}

/// Storage-quota/policy engine, consumed as a predicate plus a
/// holdings-changed notification.
#[async_trait]
pub trait StoragePolicy: Send + Sync {
    async fn can_retain(&self, signature: &Signature) -> bool;
    /// Invalidate any cached "what do we host" view; called whenever a
    /// fetch lands new files.
    async fn holdings_changed(&self);
}

/// Cache of rendered transaction data, invalidated once a transaction's
/// files become complete so the next serve rebuilds it.
#[async_trait]
pub trait ContentCache: Send + Sync {
    async fn invalidate(&self, signature: &Signature);
}

/// Policy that retains everything and caches nothing — the defaults a
/// node runs with until a real policy engine is wired in.
#[derive(Debug, Default)]
pub struct RetainAll;

#[async_trait]
impl StoragePolicy for RetainAll {
    async fn can_retain(&self, _signature: &Signature) -> bool {
        true
    }

    async fn holdings_changed(&self) {}
}

#[async_trait]
impl ContentCache for RetainAll {
    async fn invalidate(&self, _signature: &Signature) {}
}

// ── SQLite-backed associations ──────────────────────────────────────────

pub struct SqliteAssociations {
    path: PathBuf,
}

impl SqliteAssociations {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let repo = Arc::new(Self {
            path: path.as_ref().to_path_buf(),
        });
        repo.ensure_schema()?;
        Ok(repo)
    }

    fn open_connection(&self) -> anyhow::Result<Connection> {
        Ok(Connection::open(&self.path)?)
    }

    fn ensure_schema(&self) -> anyhow::Result<()> {
        let conn = self.open_connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS peer_associations (
                signature BLOB NOT NULL,
                peer_addr TEXT NOT NULL,
                PRIMARY KEY (signature, peer_addr)
            );",
        )?;
        Ok(())
    }
}

#[async_trait]
impl PeerAssociations for SqliteAssociations {
    async fn save(&self, signature: &Signature, peer: &PeerAddr) -> anyhow::Result<()> {
        let path = self.path.clone();
        let signature = signature.0.to_vec();
        let addr = peer.to_string();
        tokio::task::spawn_blocking(move || {
            let repo = SqliteAssociations { path };
            let conn = repo.open_connection()?;
            conn.execute(
                "INSERT INTO peer_associations(signature, peer_addr) VALUES(?1, ?2)
                 ON CONFLICT(signature, peer_addr) DO NOTHING",
                params![signature, addr],
            )?;
            Ok(())
        })
        .await?
    }

    async fn for_signature(&self, signature: &Signature) -> anyhow::Result<Vec<PeerAddr>> {
        let path = self.path.clone();
        let signature = signature.0.to_vec();
        tokio::task::spawn_blocking(move || {
            let repo = SqliteAssociations { path };
            let conn = repo.open_connection()?;
            let mut stmt =
                conn.prepare("SELECT peer_addr FROM peer_associations WHERE signature = ?1")?;
            let rows = stmt.query_map(params![signature], |row| row.get::<_, String>(0))?;

            let mut peers = Vec::new();
            for row in rows {
                let addr = row?;
                match PeerAddr::from_str(&addr) {
                    Ok(peer) => peers.push(peer),
                    Err(e) => {
                        tracing::warn!("discarding unparseable peer association {addr}: {e}")
                    }
                }
            }
            Ok(peers)
        })
        .await?
    }
}

/// In-memory associations for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryAssociations {
    entries: Mutex<HashMap<Signature, Vec<PeerAddr>>>,
}

impl MemoryAssociations {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerAssociations for MemoryAssociations {
    async fn save(&self, signature: &Signature, peer: &PeerAddr) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        let peers = entries.entry(*signature).or_default();
        if !peers.contains(peer) {
            peers.push(peer.clone());
        }
        Ok(())
    }

    async fn for_signature(&self, signature: &Signature) -> anyhow::Result<Vec<PeerAddr>> {
        Ok(self
            .entries
            .lock()
            .await
            .get(signature)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(byte: u8) -> Signature {
        Signature([byte; 64])
    }

    fn peer(last_octet: u8) -> PeerAddr {
        PeerAddr {
            ip: format!("10.0.0.{last_octet}").parse().expect("valid ip"),
            port: 7320,
        }
    }

    #[tokio::test]
    async fn sqlite_associations_roundtrip_and_dedupe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = SqliteAssociations::open(dir.path().join("associations.db")).expect("open");

        repo.save(&sig(1), &peer(1)).await.expect("save");
        repo.save(&sig(1), &peer(2)).await.expect("save");
        repo.save(&sig(1), &peer(1)).await.expect("duplicate save");
        repo.save(&sig(2), &peer(3)).await.expect("save");

        let mut peers = repo.for_signature(&sig(1)).await.expect("lookup");
        peers.sort_by_key(|p| p.to_string());
        assert_eq!(peers, vec![peer(1), peer(2)]);

        let other = repo.for_signature(&sig(2)).await.expect("lookup");
        assert_eq!(other, vec![peer(3)]);

        let none = repo.for_signature(&sig(9)).await.expect("lookup");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn sqlite_associations_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("associations.db");
        {
            let repo = SqliteAssociations::open(&db).expect("open");
            repo.save(&sig(4), &peer(4)).await.expect("save");
        }
        let repo = SqliteAssociations::open(&db).expect("reopen");
        assert_eq!(repo.for_signature(&sig(4)).await.expect("lookup"), vec![peer(4)]);
    }

    #[tokio::test]
    async fn memory_associations_dedupe() {
        let repo = MemoryAssociations::new();
        repo.save(&sig(5), &peer(5)).await.expect("save");
        repo.save(&sig(5), &peer(5)).await.expect("save");
        assert_eq!(repo.for_signature(&sig(5)).await.expect("lookup").len(), 1);
    }
}
