// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::{
    fetch::FetchService,
    peer::PeerAddr,
    wire::{Envelope, MAX_ENVELOPE_BYTES, MAX_ENVELOPE_PAYLOAD_BYTES},
};

pub async fn write_envelope<S>(io: &mut S, envelope: &Envelope) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let encoded = envelope.encode()?;
    if encoded.len() > MAX_ENVELOPE_BYTES {
        anyhow::bail!("envelope exceeds max size");
    }
    write_frame(io, &encoded).await
}

pub async fn read_envelope<S>(io: &mut S) -> anyhow::Result<Envelope>
where
    S: AsyncRead + Unpin,
{
    let encoded = read_frame(io, MAX_ENVELOPE_BYTES).await?;
    Envelope::decode_with_limits(&encoded, MAX_ENVELOPE_BYTES, MAX_ENVELOPE_PAYLOAD_BYTES)
}

/// Write a length-prefixed frame: 4-byte big-endian length, then payload.
async fn write_frame<S>(io: &mut S, data: &[u8]) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).context("frame too large for u32 length prefix")?;
    io.write_u32(len).await?;
    io.write_all(data).await?;
    io.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame, rejecting anything above `max_len`
/// before allocating.
async fn read_frame<S>(io: &mut S, max_len: usize) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = io.read_u32().await? as usize;
    if len > max_len {
        anyhow::bail!("frame exceeds max size");
    }
    let mut data = vec![0u8; len];
    io.read_exact(&mut data).await?;
    Ok(data)
}

/// Peer/network collaborator.  Each call is a single, independent
/// exchange; the implementation owns connection lifetimes and reuse.
#[async_trait]
pub trait Network: Send + Sync {
    /// Send a correlated request and wait up to `timeout` for the
    /// answer.  `None` on dial failure, transport error or timeout —
    /// the caller treats all three the same way.
    async fn request(
        &self,
        peer: &PeerAddr,
        request: Envelope,
        timeout: Duration,
    ) -> Option<Envelope>;

    /// Fire-and-forget send.  Returns whether the bytes were written.
    async fn send_message(&self, peer: &PeerAddr, envelope: Envelope) -> bool;

    /// Fire-and-forget fan-out to every currently known peer.
    async fn broadcast(&self, envelope: Envelope);

    async fn disconnect(&self, peer: &PeerAddr, reason: &str);
}

/// TCP implementation with per-peer session reuse: a session is taken
/// out of the pool for the duration of an exchange and returned on
/// success, so concurrent requests to one peer each get their own
/// connection.  A broken session is dropped and redialled once.
pub struct TcpNetwork {
    connect_timeout: Duration,
    sessions: Mutex<HashMap<PeerAddr, TcpStream>>,
}

impl TcpNetwork {
    pub fn new(connect_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            connect_timeout,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    async fn checkout(&self, peer: &PeerAddr) -> anyhow::Result<TcpStream> {
        if let Some(stream) = self.sessions.lock().await.remove(peer) {
            return Ok(stream);
        }
        self.dial(peer).await
    }

    async fn dial(&self, peer: &PeerAddr) -> anyhow::Result<TcpStream> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((peer.ip, peer.port)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("connect to {peer} timed out"))??;
        Ok(stream)
    }

    async fn checkin(&self, peer: &PeerAddr, stream: TcpStream) {
        self.sessions.lock().await.insert(peer.clone(), stream);
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        request: &Envelope,
        timeout: Duration,
    ) -> anyhow::Result<Envelope> {
        tokio::time::timeout(timeout, write_envelope(stream, request))
            .await
            .map_err(|_| anyhow::anyhow!("request write timed out"))??;
        tokio::time::timeout(timeout, read_envelope(stream))
            .await
            .map_err(|_| anyhow::anyhow!("response read timed out"))?
    }
}

#[async_trait]
impl Network for TcpNetwork {
    async fn request(
        &self,
        peer: &PeerAddr,
        request: Envelope,
        timeout: Duration,
    ) -> Option<Envelope> {
        let mut stream = match self.checkout(peer).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("dial {peer} failed: {e}");
                return None;
            }
        };

        match self.exchange(&mut stream, &request, timeout).await {
            Ok(response) => {
                self.checkin(peer, stream).await;
                Some(response)
            }
            Err(first_err) => {
                // Pooled session may have gone stale; redial once.
                let mut fresh = match self.dial(peer).await {
                    Ok(stream) => stream,
                    Err(_) => {
                        tracing::debug!("request to {peer} failed: {first_err}");
                        return None;
                    }
                };
                match self.exchange(&mut fresh, &request, timeout).await {
                    Ok(response) => {
                        self.checkin(peer, fresh).await;
                        Some(response)
                    }
                    Err(e) => {
                        tracing::debug!("request retry to {peer} failed: {e}");
                        None
                    }
                }
            }
        }
    }

    async fn send_message(&self, peer: &PeerAddr, envelope: Envelope) -> bool {
        let mut stream = match self.checkout(peer).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("dial {peer} failed: {e}");
                return false;
            }
        };
        match write_envelope(&mut stream, &envelope).await {
            Ok(()) => {
                self.checkin(peer, stream).await;
                true
            }
            Err(e) => {
                tracing::debug!("send to {peer} failed: {e}");
                false
            }
        }
    }

    async fn broadcast(&self, envelope: Envelope) {
        let peers: Vec<PeerAddr> = self.sessions.lock().await.keys().cloned().collect();
        for peer in peers {
            if !self.send_message(&peer, envelope.clone()).await {
                tracing::debug!("broadcast to {peer} failed");
            }
        }
    }

    async fn disconnect(&self, peer: &PeerAddr, reason: &str) {
        if self.sessions.lock().await.remove(peer).is_some() {
            tracing::info!("disconnected {peer}: {reason}");
        }
    }
}

/// Accept loop: one task per inbound connection so a slow relay fetch on
/// one connection never stalls another peer's requests.
pub async fn serve(listener: TcpListener, service: Arc<FetchService>) -> anyhow::Result<()> {
    loop {
        let (stream, remote) = listener.accept().await?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let peer = PeerAddr {
                ip: remote.ip(),
                port: remote.port(),
            };
            if let Err(e) = handle_connection(stream, &peer, service).await {
                tracing::debug!("connection from {peer} closed: {e}");
            }
        });
    }
}

/// Read-dispatch-respond loop for one inbound connection.  A failed
/// response write terminates the connection, which is the only
/// disconnect primitive an inbound peer has.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: &PeerAddr,
    service: Arc<FetchService>,
) -> anyhow::Result<()> {
    loop {
        let incoming = read_envelope(&mut stream).await?;
        if let Some(response) = service.handle_envelope(peer, incoming).await {
            write_envelope(&mut stream, &response)
                .await
                .context("failed to send response")?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::SystemClock,
        config::NodeConfig,
        content::DataDescriptor,
        ids::{ContentHash, Signature},
        repository::{MemoryAssociations, RetainAll, TransactionLookup},
        store::{ContentStore, MemoryStore},
        wire::{self, FileUnknown, MsgType, WirePayload, FLAG_RESPONSE},
    };

    struct NoTransactions;

    #[async_trait]
    impl TransactionLookup for NoTransactions {
        async fn data_descriptor(
            &self,
            _signature: &Signature,
        ) -> anyhow::Result<Option<DataDescriptor>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn envelope_framing_roundtrip() {
        let payload = WirePayload::FileUnknown(FileUnknown { hash: [6u8; 32] });
        let env = Envelope::from_typed(44, FLAG_RESPONSE, &payload).expect("build envelope");

        let (mut a, mut b) = tokio::io::duplex(2048);
        let send = tokio::spawn(async move { write_envelope(&mut a, &env).await });
        let recv = tokio::spawn(async move { read_envelope(&mut b).await });

        send.await.expect("send task").expect("send envelope");
        let decoded = recv.await.expect("recv task").expect("receive envelope");
        assert_eq!(decoded.r#type, MsgType::FileUnknown as u16);
        assert_eq!(decoded.req_id, 44);
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_payload() {
        let (mut writer, mut reader) = tokio::io::duplex(128);
        let send = tokio::spawn(async move {
            writer.write_u32(65).await.expect("len prefix");
            writer.flush().await.expect("flush");
        });

        let err = read_frame(&mut reader, 64)
            .await
            .expect_err("should reject oversized frame");
        assert!(err.to_string().contains("frame exceeds max size"));
        send.await.expect("join");
    }

    /// Full loop over real TCP: a serving node answers a `TcpNetwork`
    /// client's file request with correlated responses, reusing one
    /// connection for consecutive exchanges.
    #[tokio::test]
    async fn tcp_serve_and_request_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let bytes = b"served over tcp".to_vec();
        let hash = ContentHash::from_bytes(&bytes);
        store.put(&hash, &bytes).await.expect("put");

        let policy = Arc::new(RetainAll);
        let service = FetchService::new(
            store,
            Arc::new(NoTransactions),
            Arc::new(MemoryAssociations::new()),
            policy.clone(),
            policy,
            TcpNetwork::new(Duration::from_secs(1)),
            Arc::new(SystemClock),
            NodeConfig::default(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let bound = listener.local_addr().expect("local addr");
        let server = tokio::spawn(serve(listener, service));

        let client = TcpNetwork::new(Duration::from_secs(1));
        let server_peer = PeerAddr {
            ip: bound.ip(),
            port: bound.port(),
        };

        let request = Envelope::from_typed(
            33,
            0,
            &WirePayload::GetDataFile(wire::GetDataFile {
                signature: [1u8; 64],
                hash: hash.0,
            }),
        )
        .expect("request");
        let response = client
            .request(&server_peer, request, Duration::from_secs(2))
            .await
            .expect("response");
        assert_eq!(response.req_id, 33);
        let WirePayload::DataFile(payload) = response.decode_typed().expect("typed") else {
            panic!("expected data file response");
        };
        assert_eq!(payload.bytes, bytes);

        // Second exchange on the pooled session: an unknown hash gets
        // the explicit decline, still under its own request id.
        let missing = ContentHash::from_bytes(b"not stored");
        let request = Envelope::from_typed(
            34,
            0,
            &WirePayload::GetDataFile(wire::GetDataFile {
                signature: [1u8; 64],
                hash: missing.0,
            }),
        )
        .expect("request");
        let response = client
            .request(&server_peer, request, Duration::from_secs(2))
            .await
            .expect("decline response");
        assert_eq!(response.req_id, 34);
        assert!(matches!(
            response.decode_typed().expect("typed"),
            WirePayload::FileUnknown(_)
        ));

        server.abort();
    }
}
