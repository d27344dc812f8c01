// PORTAL DURABLE STORE INTERFACE
//
// SAFETY INVARIANTS:
// 1. Keys are derived deterministically from (entity kind, identifier)
// 2. Prefix scans return entries in ascending key order
// 3. A block's writes are staged and committed only after every instruction
//    of the block applied cleanly (no partial application)
// 4. A consumed external transaction id is never released

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("codec error: {0}")]
    Codec(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Byte-keyed state store (the trie layer sits behind this)
pub trait PortalStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;
    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError>;
    /// Every entry whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

/// In-memory store used by simulations and tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PortalStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Write overlay on top of a read-only base store.
///
/// `None` in the overlay marks a pending delete.
pub struct StagedStore<'a> {
    base: &'a dyn PortalStore,
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

pub type StagedWrites = Vec<(Vec<u8>, Option<Vec<u8>>)>;

impl<'a> StagedStore<'a> {
    pub fn new(base: &'a dyn PortalStore) -> Self {
        StagedStore {
            base,
            overlay: BTreeMap::new(),
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.overlay.len()
    }

    pub fn into_writes(self) -> StagedWrites {
        self.overlay.into_iter().collect()
    }
}

impl<'a> PortalStore for StagedStore<'a> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.overlay.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.base.get(key),
        }
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.overlay.insert(key.to_vec(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.overlay.insert(key.to_vec(), None);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.base.scan_prefix(prefix)?.into_iter().collect();
        for (key, staged) in self
            .overlay
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match staged {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

/// Apply staged writes to the durable store
pub fn commit(store: &mut dyn PortalStore, writes: StagedWrites) -> Result<(), StoreError> {
    for (key, value) in writes {
        match value {
            Some(value) => store.set(&key, value)?,
            None => store.delete(&key)?,
        }
    }
    Ok(())
}

pub fn put_bincode<T: Serialize>(
    store: &mut dyn PortalStore,
    key: &[u8],
    value: &T,
) -> Result<(), StoreError> {
    let bytes = bincode::serialize(value).map_err(|e| StoreError::Codec(e.to_string()))?;
    store.set(key, bytes)
}

pub fn get_bincode<T: DeserializeOwned>(
    store: &dyn PortalStore,
    key: &[u8],
) -> Result<Option<T>, StoreError> {
    match store.get(key)? {
        Some(bytes) => bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Codec(e.to_string())),
        None => Ok(None),
    }
}

pub fn decode_bincode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Key layout
pub mod keys {
    pub const CUSTODIAN_PREFIX: &[u8] = b"portal/custodian/";
    pub const WAITING_PORTING_PREFIX: &[u8] = b"portal/porting/waiting/";
    pub const WAITING_REDEEM_PREFIX: &[u8] = b"portal/redeem/waiting/";
    pub const MATCHED_REDEEM_PREFIX: &[u8] = b"portal/redeem/matched/";
    pub const LIQUIDATION_POOL: &[u8] = b"portal/liquidation-pool";
    pub const META: &[u8] = b"portal/meta";
    pub const PORTING_STATUS_PREFIX: &[u8] = b"portal/status/porting/";
    pub const REDEEM_STATUS_PREFIX: &[u8] = b"portal/status/redeem/";
    pub const TX_STATUS_PREFIX: &[u8] = b"portal/status/tx/";
    pub const EXTERNAL_TX_PREFIX: &[u8] = b"portal/external-tx/";

    pub fn with_id(prefix: &[u8], id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + id.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(id.as_bytes());
        key
    }

    pub fn custodian(address: &str) -> Vec<u8> {
        with_id(CUSTODIAN_PREFIX, address)
    }

    pub fn waiting_porting(porting_id: &str) -> Vec<u8> {
        with_id(WAITING_PORTING_PREFIX, porting_id)
    }

    pub fn waiting_redeem(redeem_id: &str) -> Vec<u8> {
        with_id(WAITING_REDEEM_PREFIX, redeem_id)
    }

    pub fn matched_redeem(redeem_id: &str) -> Vec<u8> {
        with_id(MATCHED_REDEEM_PREFIX, redeem_id)
    }

    pub fn external_tx(unique_id: &str) -> Vec<u8> {
        with_id(EXTERNAL_TX_PREFIX, unique_id)
    }
}

/// Replay guard: has this external transaction already been credited?
pub fn is_external_tx_consumed(store: &dyn PortalStore, unique_id: &str) -> Result<bool, StoreError> {
    Ok(store.get(&keys::external_tx(unique_id))?.is_some())
}

pub fn mark_external_tx_consumed(store: &mut dyn PortalStore, unique_id: &str) -> Result<(), StoreError> {
    store.set(&keys::external_tx(unique_id), vec![1])
}
