// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::{
    ids::{ContentHash, Signature},
    peer::PeerAddr,
};

/// "Peer `source` is believed to hold the file for `hash`" — learned from
/// other protocol traffic before any request arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayLead {
    pub signature: Signature,
    pub source: PeerAddr,
    pub created_at: u64,
}

/// Relay-intent cache: at most one lead per hash, each usable exactly
/// once.  `record` is fed by an external signal; the serving path only
/// ever consumes.
#[derive(Default)]
pub struct RelayCache {
    leads: Mutex<HashMap<ContentHash, RelayLead>>,
}

impl RelayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a lead.  A repeated request for a hash already being
    /// relayed simply refreshes the entry; last write wins.
    pub async fn record(&self, hash: ContentHash, signature: Signature, source: PeerAddr, now: u64) {
        self.leads.lock().await.insert(
            hash,
            RelayLead {
                signature,
                source,
                created_at: now,
            },
        );
    }

    /// Look up and remove in one step.  Two racing relay attempts for
    /// the same hash get exactly one lead between them.
    pub async fn consume(&self, hash: &ContentHash) -> Option<RelayLead> {
        self.leads.lock().await.remove(hash)
    }

    /// Drop every lead whose age has reached `ttl_millis`.
    pub async fn sweep(&self, now: u64, ttl_millis: u64) {
        self.leads
            .lock()
            .await
            .retain(|_, lead| now.saturating_sub(lead.created_at) < ttl_millis);
    }

    pub async fn len(&self) -> usize {
        self.leads.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.leads.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> ContentHash {
        ContentHash([byte; 32])
    }

    fn peer(last_octet: u8) -> PeerAddr {
        PeerAddr {
            ip: format!("10.0.0.{last_octet}").parse().expect("valid ip"),
            port: 7320,
        }
    }

    #[tokio::test]
    async fn record_overwrites_existing_lead_for_hash() {
        let cache = RelayCache::new();
        cache.record(hash(1), Signature([1u8; 64]), peer(1), 100).await;
        cache.record(hash(1), Signature([2u8; 64]), peer(2), 200).await;

        assert_eq!(cache.len().await, 1);
        let lead = cache.consume(&hash(1)).await.expect("lead");
        assert_eq!(lead.source, peer(2));
        assert_eq!(lead.created_at, 200);
    }

    #[tokio::test]
    async fn consume_is_single_use() {
        let cache = RelayCache::new();
        cache.record(hash(2), Signature([3u8; 64]), peer(3), 100).await;

        assert!(cache.consume(&hash(2)).await.is_some());
        assert!(cache.consume(&hash(2)).await.is_none());
    }

    #[tokio::test]
    async fn sweep_honours_ttl_boundary() {
        let cache = RelayCache::new();
        cache.record(hash(3), Signature([4u8; 64]), peer(4), 1_000).await;
        cache.record(hash(4), Signature([5u8; 64]), peer(5), 20_000).await;

        cache.sweep(31_000, 30_000).await;
        assert!(cache.consume(&hash(3)).await.is_none());
        assert!(cache.consume(&hash(4)).await.is_some());
    }
}
