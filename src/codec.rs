//! Runtime decode contexts
//!
//! A decode context turns the raw SCALE bytes of `System.Events` into
//! [`RawEvent`]s using the metadata of one runtime version. Storage key
//! builders and account formatting live here too, since both depend on the
//! same Substrate conventions.

use crate::types::{AccountBytes, FieldValue, RawEvent, RawField};
use anyhow::{Context, Result};
use subxt::events::Events;
use subxt::ext::codec::Decode;
use subxt::ext::scale_value::{Composite, Primitive, Value, ValueDef};
use subxt::utils::AccountId32;
use subxt::{Metadata, PolkadotConfig};

/// Decodes the event storage of one runtime version.
pub trait RuntimeCodec: Send + Sync {
    fn decode_events(&self, bytes: &[u8]) -> Result<Vec<RawEvent>>;
}

/// Decode context backed by the runtime metadata of a version.
pub struct MetadataCodec {
    metadata: Metadata,
}

impl MetadataCodec {
    /// Build from the SCALE-encoded metadata returned by `state_getMetadata`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let metadata = Metadata::decode(&mut &bytes[..]).context("Failed to decode runtime metadata")?;
        Ok(Self { metadata })
    }
}

impl RuntimeCodec for MetadataCodec {
    fn decode_events(&self, bytes: &[u8]) -> Result<Vec<RawEvent>> {
        let events = Events::<PolkadotConfig>::decode_from(bytes.to_vec(), self.metadata.clone());

        let mut decoded = Vec::with_capacity(events.len() as usize);
        for event in events.iter() {
            // Events are length-less in storage; one bad record poisons the rest
            let event = event.context("Failed to decode event record")?;
            let fields = match event.field_values() {
                Ok(fields) => flatten_fields(fields),
                Err(e) => {
                    tracing::warn!(
                        "Skipping {}::{} with undecodable fields: {}",
                        event.pallet_name(),
                        event.variant_name(),
                        e
                    );
                    continue;
                }
            };
            decoded.push(RawEvent {
                pallet: event.pallet_name().to_string(),
                variant: event.variant_name().to_string(),
                fields,
            });
        }
        Ok(decoded)
    }
}

fn flatten_fields(fields: Composite<u32>) -> Vec<RawField> {
    match fields {
        Composite::Named(named) => named
            .into_iter()
            .map(|(name, value)| RawField {
                name: Some(name),
                value: flatten_value(&value),
            })
            .collect(),
        Composite::Unnamed(values) => values
            .into_iter()
            .map(|value| RawField {
                name: None,
                value: flatten_value(&value),
            })
            .collect(),
    }
}

/// Reduce a decoded value to the shapes the event decoder understands.
///
/// Newtype wrappers (`AccountId32([u8; 32])`, `NetUid(u16)`, …) decode as
/// single-element composites and are unwrapped first.
fn flatten_value(value: &Value<u32>) -> FieldValue {
    let mut current = value;
    loop {
        match &current.value {
            ValueDef::Composite(inner) if inner.len() == 1 => match inner.values().next() {
                Some(only) => current = only,
                None => break,
            },
            _ => break,
        }
    }

    match &current.value {
        ValueDef::Primitive(Primitive::U128(n)) => FieldValue::Uint(*n),
        ValueDef::Composite(inner) => match account_bytes(inner) {
            Some(bytes) => FieldValue::Account(bytes),
            None => FieldValue::Other(current.to_string()),
        },
        _ => FieldValue::Other(current.to_string()),
    }
}

fn account_bytes(composite: &Composite<u32>) -> Option<AccountBytes> {
    if composite.len() != 32 {
        return None;
    }
    let mut bytes = [0u8; 32];
    for (slot, value) in bytes.iter_mut().zip(composite.values()) {
        match &value.value {
            ValueDef::Primitive(Primitive::U128(n)) => *slot = u8::try_from(*n).ok()?,
            _ => return None,
        }
    }
    Some(bytes)
}

// Storage keys

fn storage_prefix(pallet: &str, item: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(&sp_crypto_hashing::twox_128(pallet.as_bytes()));
    key.extend_from_slice(&sp_crypto_hashing::twox_128(item.as_bytes()));
    key
}

/// Storage key of `System.Events`.
pub fn system_events_key() -> Vec<u8> {
    storage_prefix("System", "Events")
}

/// Storage key of `SubtensorModule.Owner(hotkey)` (`Blake2_128Concat` hasher).
pub fn owner_storage_key(hotkey: &AccountBytes) -> Vec<u8> {
    let mut key = storage_prefix("SubtensorModule", "Owner");
    key.extend_from_slice(&sp_crypto_hashing::blake2_128(hotkey));
    key.extend_from_slice(hotkey);
    key
}

/// SS58 address of a raw account id (generic Substrate prefix 42).
pub fn format_account(bytes: &AccountBytes) -> String {
    AccountId32(*bytes).to_string()
}

/// Parse an SS58 address back to raw bytes.
pub fn parse_account(address: &str) -> Result<AccountBytes> {
    let account: AccountId32 = address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid SS58 address {}: {:?}", address, e))?;
    Ok(account.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_events_key() {
        assert_eq!(
            hex::encode(system_events_key()),
            "26aa394eea5630e07c48ae0c9558cef780d41e5e16056765bc8461851072c9d7"
        );
    }

    #[test]
    fn test_owner_key_layout() {
        let hotkey = [7u8; 32];
        let key = owner_storage_key(&hotkey);
        assert_eq!(key.len(), 32 + 16 + 32);
        assert_eq!(&key[48..], &hotkey);
        assert_eq!(&key[..16], &sp_crypto_hashing::twox_128(b"SubtensorModule"));
    }

    #[test]
    fn test_account_formatting_roundtrip() {
        let bytes = [0xd4u8; 32];
        let address = format_account(&bytes);
        assert!(address.starts_with('5'));
        assert_eq!(parse_account(&address).unwrap(), bytes);
        assert!(parse_account("not an address").is_err());
    }

    #[test]
    fn test_flatten_account_newtype() {
        let inner = Value::unnamed_composite((0..32u128).map(Value::u128));
        let wrapped = Value::unnamed_composite(vec![inner]);

        let mut expected = [0u8; 32];
        for (i, b) in expected.iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(flatten_value(&wrapped.map_context(|_| 0u32)), FieldValue::Account(expected));
    }

    #[test]
    fn test_flatten_primitives() {
        let amount = Value::u128(500).map_context(|_| 0u32);
        assert_eq!(flatten_value(&amount), FieldValue::Uint(500));

        let net_uid = Value::unnamed_composite(vec![Value::u128(3)]).map_context(|_| 0u32);
        assert_eq!(flatten_value(&net_uid), FieldValue::Uint(3));

        let flag = Value::bool(true).map_context(|_| 0u32);
        assert!(matches!(flatten_value(&flag), FieldValue::Other(_)));
    }

    #[test]
    fn test_flatten_named_fields() {
        let fields = Composite::Named(vec![
            ("who".to_string(), Value::unnamed_composite((0..32u128).map(|_| Value::u128(1))).map_context(|_| 0u32)),
            ("amount".to_string(), Value::u128(42).map_context(|_| 0u32)),
        ]);
        let flat = flatten_fields(fields);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].name.as_deref(), Some("who"));
        assert_eq!(flat[0].value, FieldValue::Account([1u8; 32]));
        assert_eq!(flat[1].value, FieldValue::Uint(42));
    }
}
