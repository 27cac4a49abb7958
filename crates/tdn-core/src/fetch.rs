// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Fetch orchestration and inbound request handling.
//!
//! One explicitly constructed service owns the in-flight registries and
//! talks to everything else through injected collaborator traits.  The
//! registries are the sole source of truth for in-flight and relay
//! state; file existence is always re-queried from the content store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::task::JoinHandle;

use crate::{
    clock::Clock,
    config::NodeConfig,
    content::DataFile,
    ids::{ContentHash, Signature},
    net::Network,
    peer::PeerAddr,
    relay::RelayCache,
    repository::{ContentCache, PeerAssociations, StoragePolicy, TransactionLookup},
    requests::PendingRequests,
    store::ContentStore,
    wire::{self, Envelope, SignaturesAnnounce, WirePayload, FLAG_RESPONSE},
};

pub struct FetchService {
    store: Arc<dyn ContentStore>,
    transactions: Arc<dyn TransactionLookup>,
    associations: Arc<dyn PeerAssociations>,
    policy: Arc<dyn StoragePolicy>,
    cache: Arc<dyn ContentCache>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    config: NodeConfig,
    pending: PendingRequests,
    relay: RelayCache,
    next_req_id: AtomicU32,
}

impl FetchService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ContentStore>,
        transactions: Arc<dyn TransactionLookup>,
        associations: Arc<dyn PeerAssociations>,
        policy: Arc<dyn StoragePolicy>,
        cache: Arc<dyn ContentCache>,
        network: Arc<dyn Network>,
        clock: Arc<dyn Clock>,
        config: NodeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transactions,
            associations,
            policy,
            cache,
            network,
            clock,
            config,
            pending: PendingRequests::new(),
            relay: RelayCache::new(),
            next_req_id: AtomicU32::new(1),
        })
    }

    /// Relay leads are recorded here by whatever orchestration learns of
    /// hash availability through other protocol traffic; this service
    /// only consumes them.
    pub fn relay(&self) -> &RelayCache {
        &self.relay
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    // ── Fetch orchestration ─────────────────────────────────────────────

    /// Fetch whatever is missing for `signature`'s data from `peer`.
    /// Returns whether at least one new file was received.
    pub async fn fetch_for_transaction(&self, peer: &PeerAddr, signature: &Signature) -> bool {
        let descriptor = match self.transactions.data_descriptor(signature).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                tracing::debug!(
                    "signature {} has no data reference, nothing to fetch",
                    signature.short()
                );
                return false;
            }
            Err(e) => {
                tracing::warn!("transaction lookup for {} failed: {e}", signature.short());
                return false;
            }
        };

        let file = DataFile::resolve(*signature, &descriptor);
        match self.fetch_files(peer, &file).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!("fetch for signature {} aborted: {e}", signature.short());
                false
            }
        }
    }

    async fn fetch_files(&self, peer: &PeerAddr, file: &DataFile) -> anyhow::Result<bool> {
        let signature = file.signature;
        let hashes = file.required_hashes(self.store.as_ref()).await?;

        let mut received_any = false;
        for hash in hashes {
            if self.store.exists(&hash).await? {
                continue;
            }
            match self.request_file(peer, &signature, &hash).await {
                Some(_) => {
                    tracing::info!("received data file {} from peer {peer}", hash.short());
                    received_any = true;
                }
                None => {
                    tracing::info!(
                        "peer {peer} didn't respond with data file {} for signature {}",
                        hash.short(),
                        signature.short()
                    );
                }
            }
        }

        if received_any {
            // This peer evidently serves data for the signature; remember
            // that for future direct fetches.
            tracing::info!(
                "adding peer association {peer} for signature {}",
                signature.short()
            );
            self.associations.save(&signature, peer).await?;
            self.policy.holdings_changed().await;
        }

        if file.is_complete(self.store.as_ref()).await? {
            self.cache.invalidate(&signature).await;

            if self.policy.can_retain(&signature).await {
                let announce = WirePayload::SignaturesAnnounce(SignaturesAnnounce {
                    origin: None,
                    signatures: vec![signature.0],
                });
                let envelope = Envelope::from_typed(self.next_req_id(), 0, &announce)?;
                self.network.broadcast(envelope).await;
            }
        }

        Ok(received_any)
    }

    /// Directed fetch with no open connection context: pick a random
    /// peer previously observed serving this signature's data.
    pub async fn fetch_from_known_peers(&self, signature: &Signature) -> bool {
        self.pending
            .mark_signature_requested(*signature, self.clock.now_millis())
            .await;

        let peers = match self.associations.for_signature(signature).await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::info!("unable to fetch peer list for {}: {e}", signature.short());
                return false;
            }
        };
        if peers.is_empty() {
            tracing::info!("no known peers for signature {}", signature.short());
            return false;
        }

        // Uniform choice spreads load; no ranking by recency or
        // reliability.
        let index = rand::thread_rng().gen_range(0..peers.len());
        let peer = &peers[index];
        tracing::info!(
            "attempting direct fetch from {peer} for signature {}",
            signature.short()
        );
        self.fetch_for_transaction(peer, signature).await
    }

    // ── Per-hash request primitive ──────────────────────────────────────

    /// Request one file from one peer, bounded by the fixed timeout.
    ///
    /// Skips the round trip when the content is already local (the
    /// relay-target case).  Returns the received payload, or `None` on
    /// duplicate request, timeout, transport failure, unexpected
    /// response kind, or hash mismatch — all equivalent to the caller.
    async fn request_file(
        &self,
        peer: &PeerAddr,
        signature: &Signature,
        hash: &ContentHash,
    ) -> Option<wire::DataFile> {
        match self.store.get(hash).await {
            Ok(Some(bytes)) => {
                return Some(wire::DataFile {
                    signature: signature.0,
                    hash: hash.0,
                    bytes,
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("store lookup for {} failed: {e}", hash.short());
                return None;
            }
        }

        if !self.pending.try_begin(*hash, self.clock.now_millis()).await {
            tracing::info!(
                "already requesting data file {} for signature {}",
                hash.short(),
                signature.short()
            );
            return None;
        }

        tracing::info!("fetching data file {} from peer {peer}", hash.short());
        let request = WirePayload::GetDataFile(wire::GetDataFile {
            signature: signature.0,
            hash: hash.0,
        });
        let req_id = self.next_req_id();
        let response = match Envelope::from_typed(req_id, 0, &request) {
            Ok(envelope) => {
                self.network
                    .request(peer, envelope, self.config.request_timeout)
                    .await
            }
            Err(e) => {
                tracing::warn!("failed to encode request for {}: {e}", hash.short());
                None
            }
        };
        // Release the slot whatever happened; the sweep would catch a
        // leak, this just does it promptly.
        self.pending.end(hash).await;

        let payload = match response {
            Some(envelope) if envelope.req_id == req_id => match envelope.decode_typed() {
                Ok(WirePayload::DataFile(payload)) => payload,
                Ok(other) => {
                    tracing::info!(
                        "peer {peer} answered {} request with {:?}",
                        hash.short(),
                        other.msg_type()
                    );
                    return None;
                }
                Err(e) => {
                    tracing::info!("undecodable response from {peer}: {e}");
                    return None;
                }
            },
            Some(envelope) => {
                tracing::info!(
                    "response from {peer} has req_id {} instead of {req_id}",
                    envelope.req_id
                );
                return None;
            }
            None => return None,
        };

        if ContentHash::from_bytes(&payload.bytes) != *hash {
            tracing::warn!("peer {peer} sent bytes that do not hash to {}", hash.short());
            return None;
        }
        if let Err(e) = self.store.put(hash, &payload.bytes).await {
            tracing::warn!("failed to store data file {}: {e}", hash.short());
            return None;
        }
        Some(payload)
    }

    // ── Inbound handling ────────────────────────────────────────────────

    /// Dispatch one inbound envelope.  The returned envelope, if any, is
    /// the response to write back on the same connection.
    pub async fn handle_envelope(&self, peer: &PeerAddr, envelope: Envelope) -> Option<Envelope> {
        let req_id = envelope.req_id;
        match envelope.decode_typed() {
            Ok(WirePayload::GetDataFile(msg)) => self.handle_get_file(peer, req_id, msg).await,
            Ok(WirePayload::SignaturesAnnounce(msg)) => {
                tracing::debug!(
                    "peer {peer} announced {} signature(s)",
                    msg.signatures.len()
                );
                None
            }
            Ok(other) => {
                tracing::debug!("ignoring unsolicited {:?} from {peer}", other.msg_type());
                None
            }
            Err(e) => {
                tracing::debug!("undecodable envelope from {peer}: {e}");
                None
            }
        }
    }

    /// Serve, relay, or decline an inbound file request.
    ///
    /// Terminal in all branches; any retry policy lives with whoever
    /// initiated the original outbound request.
    async fn handle_get_file(
        &self,
        peer: &PeerAddr,
        req_id: u32,
        msg: wire::GetDataFile,
    ) -> Option<Envelope> {
        if !self.config.serving_enabled {
            return None;
        }

        let signature = Signature(msg.signature);
        let hash = ContentHash(msg.hash);
        tracing::info!("peer {peer} requested data file {}", hash.short());

        match self.store.get(&hash).await {
            Ok(Some(bytes)) => {
                // Local copy: serve it directly under the request's id.
                let payload = WirePayload::DataFile(wire::DataFile {
                    signature: msg.signature,
                    hash: msg.hash,
                    bytes,
                });
                return match Envelope::from_typed(req_id, FLAG_RESPONSE, &payload) {
                    Ok(envelope) => Some(envelope),
                    Err(e) => {
                        tracing::warn!("failed to encode data file {}: {e}", hash.short());
                        None
                    }
                };
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("store lookup for {} failed: {e}", hash.short());
                return None;
            }
        }

        if self.config.relay_enabled {
            // Single-use: the lead is gone regardless of the attempt's
            // outcome, so a failed hop is never retried at this layer.
            if let Some(lead) = self.relay.consume(&hash).await {
                tracing::info!(
                    "relaying request for {} from {peer} to {}",
                    hash.short(),
                    lead.source
                );
                return self
                    .relay_fetch(peer, req_id, &signature, &hash, &lead.source)
                    .await;
            }
        }

        // No copy, no lead: decline explicitly so the requester's wait
        // resolves now instead of running out its timeout.
        tracing::info!("data file {} unknown, declining", hash.short());
        let decline = WirePayload::FileUnknown(wire::FileUnknown { hash: msg.hash });
        match Envelope::from_typed(req_id, FLAG_RESPONSE, &decline) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::warn!("failed to encode decline: {e}");
                None
            }
        }
    }

    /// Fetch `hash` from `source` on behalf of `requester`, answering
    /// under the original request id.  Data materialised purely for
    /// forwarding is deleted again: a relay is not obliged to retain
    /// what it only transited.
    async fn relay_fetch(
        &self,
        requester: &PeerAddr,
        original_req_id: u32,
        signature: &Signature,
        hash: &ContentHash,
        source: &PeerAddr,
    ) -> Option<Envelope> {
        let existed_before = self.store.exists(hash).await.unwrap_or(false);

        let payload = match self.request_file(source, signature, hash).await {
            Some(payload) => payload,
            None => {
                // Decline-by-silence: the requester's own timeout path
                // resolves this attempt.
                tracing::info!(
                    "relay source {source} had nothing for {}, dropping request from {requester}",
                    hash.short()
                );
                return None;
            }
        };

        let forward = WirePayload::DataFile(payload);
        let envelope = match Envelope::from_typed(original_req_id, FLAG_RESPONSE, &forward) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("failed to encode forwarded file {}: {e}", hash.short());
                return None;
            }
        };
        tracing::info!("forwarding data file {} to {requester}", hash.short());

        if !existed_before {
            tracing::info!(
                "deleting data file {} held for forwarding only",
                hash.short()
            );
            if let Err(e) = self.store.delete(hash).await {
                tracing::warn!("failed to delete transit file {}: {e}", hash.short());
            }
        }

        Some(envelope)
    }

    // ── Periodic sweep ──────────────────────────────────────────────────

    /// Safety net against entries leaked by network calls that never
    /// return: drop pending requests and relay leads past their TTLs on
    /// a fixed cadence, decoupled from request traffic.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                service.sweep_once().await;
            }
        })
    }

    pub async fn sweep_once(&self) {
        let now = self.clock.now_millis();
        let request_ttl = self.config.request_timeout.as_millis() as u64;
        let relay_ttl = self.config.relay_timeout.as_millis() as u64;
        self.pending.sweep(now, request_ttl).await;
        self.relay.sweep(now, relay_ttl).await;
    }

    fn next_req_id(&self) -> u32 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }
}
