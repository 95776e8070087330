//! Substrate JSON-RPC types
//!
//! Type definitions for block hashes, headers and the untyped event records
//! produced by a runtime decode context.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Block height.
pub type BlockNumber = u64;

/// Runtime spec version identifying a decode schema.
pub type RuntimeVersion = u32;

/// Raw 32-byte account id as it appears in event fields.
pub type AccountBytes = [u8; 32];

/// 32-byte block hash, rendered as `0x`-prefixed hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `0x`-prefixed lowercase hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl FromStr for BlockHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = parse_hex_bytes(s)?;
        if bytes.len() != 32 {
            anyhow::bail!("Expected 32 bytes for block hash, got {}", bytes.len());
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        Ok(Self(hash))
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A block number paired with its hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub number: BlockNumber,
    pub hash: BlockHash,
}

/// Block header as returned by `chain_getHeader`.
///
/// Only the number is needed; the remaining header fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Header {
    /// Block number (hex string in JSON, parsed to u64)
    #[serde(rename = "number", deserialize_with = "deserialize_hex_u64")]
    pub number: BlockNumber,

    /// Parent block hash
    #[serde(rename = "parentHash")]
    pub parent_hash: Option<BlockHash>,
}

/// A single decoded field value of an event.
///
/// The decode context flattens runtime types into the three shapes the
/// event decoder cares about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    /// A 32-byte account id (coldkey or hotkey)
    Account(AccountBytes),
    /// Any unsigned integer (balances, net uids)
    Uint(u128),
    /// Anything else, kept only for diagnostics
    Other(String),
}

impl FieldValue {
    pub fn as_account(&self) -> Option<&AccountBytes> {
        match self {
            FieldValue::Account(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u128> {
        match self {
            FieldValue::Uint(n) => Some(*n),
            _ => None,
        }
    }
}

/// A named or positional event field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawField {
    pub name: Option<String>,
    pub value: FieldValue,
}

/// An event as decoded by the runtime, before any typing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawEvent {
    /// Pallet name, e.g. `Balances` or `SubtensorModule`
    pub pallet: String,
    /// Event variant name, e.g. `Transfer` or `StakeAdded`
    pub variant: String,
    /// Event fields in declaration order
    pub fields: Vec<RawField>,
}

impl RawEvent {
    /// Look a field up by name, falling back to its position.
    ///
    /// Older runtimes emit positional fields only, newer ones name them.
    pub fn field(&self, name: &str, position: usize) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|f| f.name.as_deref() == Some(name))
            .or_else(|| self.fields.get(position))
            .map(|f| &f.value)
    }

    pub fn field_at(&self, position: usize) -> Option<&FieldValue> {
        self.fields.get(position).map(|f| &f.value)
    }
}

/// All events of one block.
pub type RawEventBatch = Vec<RawEvent>;

// Hex helpers

/// Pad an odd-length hex string with a leading zero.
/// This handles cases where RPC returns hex strings without leading zeros.
fn pad_hex_string(s: &str) -> String {
    if s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

/// Decode a hex string (with or without 0x prefix) to bytes.
pub fn parse_hex_bytes(s: &str) -> anyhow::Result<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(Vec::new());
    }
    let s = pad_hex_string(s);
    hex::decode(&s).map_err(|e| anyhow::anyhow!("Invalid hex string: {}", e))
}

/// Deserialize a hex string to u64.
fn deserialize_hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let s = s.strip_prefix("0x").unwrap_or(&s);
    u64::from_str_radix(s, 16).map_err(serde::de::Error::custom)
}
