// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Opaque encoded values carried by events, commands and channels.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// An encoded value.
///
/// The engine never looks inside a payload; it only moves bytes between
/// history events, commands and workflow code. The `encode`/`decode`
/// helpers use JSON so workflow code and tests can work with typed values.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Wrap raw bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// An empty payload.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Encode a value as JSON.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(Self)
    }

    /// Decode a JSON payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the payload, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Number of encoded bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 64;
        let text = String::from_utf8_lossy(&self.0[..self.0.len().min(PREVIEW)]);
        if self.0.len() > PREVIEW {
            write!(f, "Payload({text}...; {} bytes)", self.0.len())
        } else {
            write!(f, "Payload({text})")
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_json() {
        let payload = Payload::encode(&vec![1, 2, 3]).unwrap();
        assert_eq!(payload.as_bytes(), b"[1,2,3]");
        let back: Vec<i32> = payload.decode().unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn test_decode_failure() {
        let payload = Payload::from("not json");
        assert!(payload.decode::<u32>().is_err());
    }

    #[test]
    fn test_debug_truncates_long_payloads() {
        let payload = Payload::new(vec![b'a'; 100]);
        let rendered = format!("{payload:?}");
        assert!(rendered.contains("100 bytes"));
    }
}
