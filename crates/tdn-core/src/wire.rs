// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

/// Serialize `value` into a CBOR byte vector.
pub(crate) fn to_cbor<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    Ok(buf)
}

/// Deserialize `T` from a CBOR byte slice.
pub(crate) fn from_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    Ok(ciborium::from_reader(bytes)?)
}

// ── Integer-keyed CBOR helpers ──────────────────────────────────────────
//
// File-transfer payloads are encoded as CBOR maps with integer keys
// (rather than string field names) to reduce bandwidth.  Hand-written
// impls are also what lets 64-byte signature arrays cross serde, which
// stops at 32 for derived array support.

mod int_cbor {
    use ciborium::Value;

    pub fn into_map(val: Value) -> Result<Vec<(Value, Value)>, String> {
        match val {
            Value::Map(m) => Ok(m),
            other => Err(format!("expected CBOR map, got {:?}", other)),
        }
    }

    pub fn find_field(map: &[(Value, Value)], int_key: i64) -> Option<&Value> {
        map.iter()
            .find(|(k, _)| {
                k.as_integer()
                    .map(|i| i128::from(i) == int_key as i128)
                    .unwrap_or(false)
            })
            .map(|(_, v)| v)
    }

    /// Extract a required byte-array field of exactly `N` bytes.
    pub fn extract_byte_array<const N: usize>(
        map: &[(Value, Value)],
        int_key: i64,
        name: &str,
    ) -> Result<[u8; N], String> {
        let val = find_field(map, int_key).ok_or_else(|| format!("missing field {name}"))?;
        let bytes = val
            .as_bytes()
            .ok_or_else(|| format!("field {name}: expected bytes"))?;
        if bytes.len() != N {
            return Err(format!(
                "field {name}: expected {N} bytes, got {}",
                bytes.len()
            ));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn extract_bytes(
        map: &[(Value, Value)],
        int_key: i64,
        name: &str,
    ) -> Result<Vec<u8>, String> {
        let val = find_field(map, int_key).ok_or_else(|| format!("missing field {name}"))?;
        val.as_bytes()
            .cloned()
            .ok_or_else(|| format!("field {name}: expected bytes"))
    }

    /// Extract an optional text field; CBOR null and absence both map to `None`.
    pub fn extract_opt_text(map: &[(Value, Value)], int_key: i64) -> Option<String> {
        match find_field(map, int_key) {
            Some(Value::Text(text)) => Some(text.clone()),
            _ => None,
        }
    }

    /// Extract a required array of byte arrays, each exactly `N` bytes.
    pub fn extract_byte_array_list<const N: usize>(
        map: &[(Value, Value)],
        int_key: i64,
        name: &str,
    ) -> Result<Vec<[u8; N]>, String> {
        let val = find_field(map, int_key).ok_or_else(|| format!("missing field {name}"))?;
        let items = val
            .as_array()
            .ok_or_else(|| format!("field {name}: expected array"))?;
        items
            .iter()
            .map(|item| {
                let bytes = item
                    .as_bytes()
                    .ok_or_else(|| format!("field {name}: expected bytes element"))?;
                if bytes.len() != N {
                    return Err(format!(
                        "field {name}: expected {N}-byte element, got {}",
                        bytes.len()
                    ));
                }
                let mut out = [0u8; N];
                out.copy_from_slice(bytes);
                Ok(out)
            })
            .collect()
    }

    pub fn kv_bytes(key: i64, bytes: &[u8]) -> (Value, Value) {
        (Value::Integer(key.into()), Value::Bytes(bytes.to_vec()))
    }

    pub fn kv_opt_text(key: i64, text: &Option<String>) -> (Value, Value) {
        let value = match text {
            Some(text) => Value::Text(text.clone()),
            None => Value::Null,
        };
        (Value::Integer(key.into()), value)
    }

    pub fn kv_byte_array_list<const N: usize>(key: i64, items: &[[u8; N]]) -> (Value, Value) {
        (
            Value::Integer(key.into()),
            Value::Array(items.iter().map(|b| Value::Bytes(b.to_vec())).collect()),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub r#type: u16,
    pub req_id: u32,
    pub flags: u16,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

pub const FLAG_RESPONSE: u16 = 0x0001;
pub const FLAG_ERROR: u16 = 0x0002;

/// Default upper bound for serialized envelope size accepted from the wire.
pub const MAX_ENVELOPE_BYTES: usize = 4 * 1024 * 1024;
/// Default upper bound for decoded payload bytes accepted from the wire.
/// Sized to carry one full data-file chunk plus codec overhead.
pub const MAX_ENVELOPE_PAYLOAD_BYTES: usize = 2 * 1024 * 1024;

impl Envelope {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        to_cbor(self)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Self::decode_with_limits(bytes, MAX_ENVELOPE_BYTES, MAX_ENVELOPE_PAYLOAD_BYTES)
    }

    pub fn decode_with_limits(
        bytes: &[u8],
        max_envelope_bytes: usize,
        max_payload_bytes: usize,
    ) -> anyhow::Result<Self> {
        if bytes.len() > max_envelope_bytes {
            anyhow::bail!(
                "envelope exceeds max size: {} > {}",
                bytes.len(),
                max_envelope_bytes
            );
        }

        let envelope: Self = from_cbor(bytes)?;
        if envelope.payload.len() > max_payload_bytes {
            anyhow::bail!(
                "envelope payload exceeds max size: {} > {}",
                envelope.payload.len(),
                max_payload_bytes
            );
        }
        Ok(envelope)
    }

    /// Decode the envelope payload into a typed protocol message.
    pub fn decode_typed(&self) -> anyhow::Result<WirePayload> {
        WirePayload::decode(self.r#type, &self.payload)
    }

    /// Build an envelope from a typed protocol payload.
    pub fn from_typed(req_id: u32, flags: u16, payload: &WirePayload) -> anyhow::Result<Self> {
        Ok(Self {
            r#type: u16::from(payload.msg_type()),
            req_id,
            flags,
            payload: payload.encode()?,
        })
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Request one data file by content hash + owning signature.
    GetDataFile = 500,
    /// Data-file payload response.
    DataFile = 501,
    /// Explicit "we don't have it" response, so the requester's wait
    /// resolves immediately instead of running out the timeout.
    FileUnknown = 502,
    /// Fire-and-forget advertisement of newly complete holdings.
    SignaturesAnnounce = 510,
}

impl MsgType {
    /// Stable `u16` registry for protocol envelope types.
    pub const ALL: [Self; 4] = [
        Self::GetDataFile,
        Self::DataFile,
        Self::FileUnknown,
        Self::SignaturesAnnounce,
    ];
}

impl From<MsgType> for u16 {
    fn from(value: MsgType) -> Self {
        value as u16
    }
}

impl TryFrom<u16> for MsgType {
    type Error = anyhow::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            500 => Ok(Self::GetDataFile),
            501 => Ok(Self::DataFile),
            502 => Ok(Self::FileUnknown),
            510 => Ok(Self::SignaturesAnnounce),
            _ => anyhow::bail!("unknown message type {value}"),
        }
    }
}

/// Data-file request.  Wire format: `{0: signature, 1: hash}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDataFile {
    pub signature: [u8; 64],
    pub hash: [u8; 32],
}

impl Serialize for GetDataFile {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ciborium::Value::Map(vec![
            int_cbor::kv_bytes(0, &self.signature),
            int_cbor::kv_bytes(1, &self.hash),
        ])
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for GetDataFile {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let val = ciborium::Value::deserialize(deserializer)?;
        let map = int_cbor::into_map(val).map_err(serde::de::Error::custom)?;
        Ok(GetDataFile {
            signature: int_cbor::extract_byte_array(&map, 0, "signature")
                .map_err(serde::de::Error::custom)?,
            hash: int_cbor::extract_byte_array(&map, 1, "hash")
                .map_err(serde::de::Error::custom)?,
        })
    }
}

/// Data-file payload response.  Wire format: `{0: signature, 1: hash, 2: bytes}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    pub signature: [u8; 64],
    pub hash: [u8; 32],
    pub bytes: Vec<u8>,
}

impl Serialize for DataFile {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ciborium::Value::Map(vec![
            int_cbor::kv_bytes(0, &self.signature),
            int_cbor::kv_bytes(1, &self.hash),
            int_cbor::kv_bytes(2, &self.bytes),
        ])
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DataFile {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let val = ciborium::Value::deserialize(deserializer)?;
        let map = int_cbor::into_map(val).map_err(serde::de::Error::custom)?;
        Ok(DataFile {
            signature: int_cbor::extract_byte_array(&map, 0, "signature")
                .map_err(serde::de::Error::custom)?,
            hash: int_cbor::extract_byte_array(&map, 1, "hash")
                .map_err(serde::de::Error::custom)?,
            bytes: int_cbor::extract_bytes(&map, 2, "bytes").map_err(serde::de::Error::custom)?,
        })
    }
}

/// Not-found response.  Wire format: `{0: hash}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUnknown {
    pub hash: [u8; 32],
}

impl Serialize for FileUnknown {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ciborium::Value::Map(vec![int_cbor::kv_bytes(0, &self.hash)]).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileUnknown {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let val = ciborium::Value::deserialize(deserializer)?;
        let map = int_cbor::into_map(val).map_err(serde::de::Error::custom)?;
        Ok(FileUnknown {
            hash: int_cbor::extract_byte_array(&map, 0, "hash")
                .map_err(serde::de::Error::custom)?,
        })
    }
}

/// Holdings advertisement.  Wire format: `{0: origin_or_null, 1: signatures}`.
/// A null origin means "the sender itself".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignaturesAnnounce {
    pub origin: Option<String>,
    pub signatures: Vec<[u8; 64]>,
}

impl Serialize for SignaturesAnnounce {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ciborium::Value::Map(vec![
            int_cbor::kv_opt_text(0, &self.origin),
            int_cbor::kv_byte_array_list(1, &self.signatures),
        ])
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SignaturesAnnounce {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let val = ciborium::Value::deserialize(deserializer)?;
        let map = int_cbor::into_map(val).map_err(serde::de::Error::custom)?;
        Ok(SignaturesAnnounce {
            origin: int_cbor::extract_opt_text(&map, 0),
            signatures: int_cbor::extract_byte_array_list(&map, 1, "signatures")
                .map_err(serde::de::Error::custom)?,
        })
    }
}

/// Typed envelope payloads used by dispatcher-style message handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePayload {
    GetDataFile(GetDataFile),
    DataFile(DataFile),
    FileUnknown(FileUnknown),
    SignaturesAnnounce(SignaturesAnnounce),
}

impl WirePayload {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::GetDataFile(_) => MsgType::GetDataFile,
            Self::DataFile(_) => MsgType::DataFile,
            Self::FileUnknown(_) => MsgType::FileUnknown,
            Self::SignaturesAnnounce(_) => MsgType::SignaturesAnnounce,
        }
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            Self::GetDataFile(msg) => to_cbor(msg),
            Self::DataFile(msg) => to_cbor(msg),
            Self::FileUnknown(msg) => to_cbor(msg),
            Self::SignaturesAnnounce(msg) => to_cbor(msg),
        }
    }

    pub fn decode(message_type: u16, payload: &[u8]) -> anyhow::Result<Self> {
        let msg_type = MsgType::try_from(message_type)?;
        Ok(match msg_type {
            MsgType::GetDataFile => Self::GetDataFile(from_cbor(payload)?),
            MsgType::DataFile => Self::DataFile(from_cbor(payload)?),
            MsgType::FileUnknown => Self::FileUnknown(from_cbor(payload)?),
            MsgType::SignaturesAnnounce => Self::SignaturesAnnounce(from_cbor(payload)?),
        })
    }
}
