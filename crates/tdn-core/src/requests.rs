// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::ids::{ContentHash, Signature};

/// Registry of in-flight outbound file requests, keyed by content hash.
///
/// Content hashes are location-independent, so the at-most-one-pending
/// invariant holds globally across all requesters: whoever wins
/// `try_begin` owns the fetch and everyone else skips it.  The periodic
/// sweep is the safety net against entries leaked by network calls that
/// never return.
#[derive(Default)]
pub struct PendingRequests {
    in_flight: Mutex<HashMap<ContentHash, u64>>,
    signature_marks: Mutex<HashMap<Signature, u64>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically insert `(hash, now)` iff no request for `hash` is in
    /// flight.  Returns whether this caller should issue the request.
    pub async fn try_begin(&self, hash: ContentHash, now: u64) -> bool {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.contains_key(&hash) {
            return false;
        }
        in_flight.insert(hash, now);
        true
    }

    /// Release the pending slot.  Idempotent; called on response,
    /// timeout and error alike.
    pub async fn end(&self, hash: &ContentHash) {
        self.in_flight.lock().await.remove(hash);
    }

    /// Record that a fetch for this signature's data is outstanding —
    /// a dedup hint consumed by the announce-handling path.
    pub async fn mark_signature_requested(&self, signature: Signature, now: u64) {
        self.signature_marks.lock().await.insert(signature, now);
    }

    pub async fn is_signature_requested(&self, signature: &Signature) -> bool {
        self.signature_marks.lock().await.contains_key(signature)
    }

    /// Drop every entry whose age has reached `ttl_millis`.
    pub async fn sweep(&self, now: u64, ttl_millis: u64) {
        self.in_flight
            .lock()
            .await
            .retain(|_, issued| now.saturating_sub(*issued) < ttl_millis);
        self.signature_marks
            .lock()
            .await
            .retain(|_, marked| now.saturating_sub(*marked) < ttl_millis);
    }

    pub async fn pending_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn hash(byte: u8) -> ContentHash {
        ContentHash([byte; 32])
    }

    #[tokio::test]
    async fn second_begin_for_same_hash_loses_until_end() {
        let pending = PendingRequests::new();
        assert!(pending.try_begin(hash(1), 100).await);
        assert!(!pending.try_begin(hash(1), 101).await);

        pending.end(&hash(1)).await;
        assert!(pending.try_begin(hash(1), 102).await);
    }

    #[tokio::test]
    async fn concurrent_begins_have_exactly_one_winner() {
        let pending = Arc::new(PendingRequests::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let pending = pending.clone();
            tasks.push(tokio::spawn(
                async move { pending.try_begin(hash(7), 5).await },
            ));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(pending.pending_count().await, 1);
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let pending = PendingRequests::new();
        assert!(pending.try_begin(hash(2), 10).await);
        pending.end(&hash(2)).await;
        pending.end(&hash(2)).await;
        assert_eq!(pending.pending_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_removes_aged_entries_and_keeps_young_ones() {
        let pending = PendingRequests::new();
        assert!(pending.try_begin(hash(3), 1_000).await);
        assert!(pending.try_begin(hash(4), 5_000).await);

        // Age of hash(3) is exactly the TTL: swept.  hash(4) is younger.
        pending.sweep(11_000, 10_000).await;
        assert!(!pending.try_begin(hash(4), 11_001).await);
        assert!(pending.try_begin(hash(3), 11_001).await);
    }

    #[tokio::test]
    async fn signature_marks_are_recorded_and_swept() {
        let pending = PendingRequests::new();
        let sig = Signature([9u8; 64]);
        pending.mark_signature_requested(sig, 2_000).await;
        assert!(pending.is_signature_requested(&sig).await);

        pending.sweep(13_000, 10_000).await;
        assert!(!pending.is_signature_requested(&sig).await);
    }
}
