//! Content fingerprints of record groups
//!
//! A fingerprint is the SHA-256 of a version tag followed by the canonical JSON
//! of one model's record sequence (keys sorted at every level, no whitespace).
//! Record order is part of the content; the normalizer already sorts by `@id`.

use crate::document::{canonical_json, Record};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

const FINGERPRINT_TAG: &[u8] = b"ttlsync-fingerprint-v1\0";

/// Digest of one (dataset, model) record group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the fingerprint of a record sequence
    pub fn of_records(records: &[Record]) -> Self {
        let array = Value::Array(records.iter().map(Record::to_value).collect());
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_TAG);
        hasher.update(canonical_json(&array).as_bytes());
        Self(hasher.finalize().into())
    }

    /// Fingerprint of the empty sequence ("model absent or empty")
    pub fn empty() -> Self {
        Self::of_records(&[])
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for display
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        Self::from_hex(&hex_str).map_err(serde::de::Error::custom)
    }
}
