//! Delegate hotkey → owning coldkey resolution

use crate::client::ChainClient;
use crate::codec::{format_account, owner_storage_key};
use crate::types::AccountBytes;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait OwnerLookup: Send + Sync {
    /// SS58 address of the coldkey owning `hotkey`.
    async fn resolve_owner(&self, hotkey: &AccountBytes) -> Result<String>;
}

/// Reads `SubtensorModule.Owner` at the chain head.
pub struct ChainOwnerLookup {
    client: Arc<ChainClient>,
}

impl ChainOwnerLookup {
    pub fn new(client: Arc<ChainClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OwnerLookup for ChainOwnerLookup {
    async fn resolve_owner(&self, hotkey: &AccountBytes) -> Result<String> {
        let value = self
            .client
            .storage(owner_storage_key(hotkey), None)
            .await
            .with_context(|| format!("Owner lookup failed for hotkey {}", format_account(hotkey)))?;

        // Unregistered hotkeys read as the storage default: the all-zero account
        let Some(bytes) = value else {
            debug!("No owner registered for hotkey {}", format_account(hotkey));
            return Ok(format_account(&[0u8; 32]));
        };
        let owner: AccountBytes = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Owner record has {} bytes, expected 32", bytes.len()))?;
        Ok(format_account(&owner))
    }
}
