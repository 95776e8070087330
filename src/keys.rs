//! Key encoding and decoding utilities
//!
//! All keys use a single-byte prefix followed by binary data, so RocksDB
//! orders them deterministically: score keys sort by miner, then by
//! creation time.

use crate::records::MinerKey;
use anyhow::Result;
use uuid::Uuid;

/// Encode the prefix shared by every score of one miner.
///
/// Format: byte 'S' (0x53) + uid (2 bytes, big-endian) + hotkey length
/// (1 byte) + hotkey (UTF-8)
/// Total length: 4 + hotkey length
pub fn encode_miner_prefix(miner: &MinerKey) -> Result<Vec<u8>> {
    let hotkey = miner.hotkey.as_bytes();
    let len = u8::try_from(hotkey.len())
        .map_err(|_| anyhow::anyhow!("Hotkey too long for a score key: {} bytes", hotkey.len()))?;

    let mut key = Vec::with_capacity(4 + hotkey.len() + 24);
    key.push(b'S');
    key.extend_from_slice(&miner.uid.to_be_bytes());
    key.push(len);
    key.extend_from_slice(hotkey);
    Ok(key)
}

/// Encode a score key.
///
/// Format: miner prefix + created_at (8 bytes, big-endian) + record id (16 bytes)
/// Total length: 28 + hotkey length
pub fn encode_score_key(miner: &MinerKey, created_at: u64, id: Uuid) -> Result<Vec<u8>> {
    let mut key = encode_miner_prefix(miner)?;
    key.extend_from_slice(&created_at.to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    Ok(key)
}

/// Decode a score key into (miner, created_at, id).
pub fn decode_score_key(key: &[u8]) -> Result<(MinerKey, u64, Uuid)> {
    if key.len() < 4 || key[0] != b'S' {
        anyhow::bail!("Invalid score key prefix");
    }
    let uid = u16::from_be_bytes([key[1], key[2]]);
    let len = key[3] as usize;
    if key.len() != 4 + len + 24 {
        anyhow::bail!(
            "Invalid score key length: expected {}, got {}",
            4 + len + 24,
            key.len()
        );
    }

    let hotkey = std::str::from_utf8(&key[4..4 + len])
        .map_err(|e| anyhow::anyhow!("Score key hotkey is not UTF-8: {}", e))?
        .to_string();
    let rest = &key[4 + len..];
    let created_at = u64::from_be_bytes(rest[..8].try_into()?);
    let id = Uuid::from_slice(&rest[8..])?;

    Ok((MinerKey { hotkey, uid }, created_at, id))
}
