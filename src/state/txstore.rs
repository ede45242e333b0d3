//! Append-only transaction-bytes store, idempotent by txid.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::ledger::TransactionID;

/// Storage for raw transaction bytes plus optional persistence metadata.
pub trait TxBytesStore: Send + Sync {
    fn save_tx_bytes(&self, txid: &TransactionID, bytes: &[u8]);
    fn get_tx_bytes(&self, txid: &TransactionID) -> Option<Vec<u8>>;
    fn has_tx_bytes(&self, txid: &TransactionID) -> bool {
        self.get_tx_bytes(txid).is_some()
    }
}

/// In-memory store; the `tx_store.type = "dummy"` option.
#[derive(Default)]
pub struct DummyTxBytesStore {
    map: Mutex<HashMap<TransactionID, Vec<u8>>>,
}

impl DummyTxBytesStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TxBytesStore for DummyTxBytesStore {
    fn save_tx_bytes(&self, txid: &TransactionID, bytes: &[u8]) {
        self.map
            .lock()
            .expect("txstore lock")
            .entry(*txid)
            .or_insert_with(|| bytes.to_vec());
    }

    fn get_tx_bytes(&self, txid: &TransactionID) -> Option<Vec<u8>> {
        self.map.lock().expect("txstore lock").get(txid).cloned()
    }
}

/// Sled-backed store; the default `tx_store.type = "db"` option.
pub struct SledTxBytesStore {
    tree: sled::Tree,
}

impl SledTxBytesStore {
    pub fn open(path: &std::path::Path) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        Ok(SledTxBytesStore {
            tree: db.open_tree("txbytes")?,
        })
    }
}

impl TxBytesStore for SledTxBytesStore {
    fn save_tx_bytes(&self, txid: &TransactionID, bytes: &[u8]) {
        // idempotent by txid; first write wins
        if let Err(err) = self
            .tree
            .compare_and_swap(txid.as_bytes(), None as Option<&[u8]>, Some(bytes))
        {
            tracing::warn!(error = %err, "tx bytes store write failed");
        }
    }

    fn get_tx_bytes(&self, txid: &TransactionID) -> Option<Vec<u8>> {
        self.tree
            .get(txid.as_bytes())
            .ok()
            .flatten()
            .map(|v| v.to_vec())
    }

    fn has_tx_bytes(&self, txid: &TransactionID) -> bool {
        self.tree.contains_key(txid.as_bytes()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LogicalTime, TransactionID};

    fn txid(seed: u8) -> TransactionID {
        TransactionID::new(LogicalTime::must_new(1, 1), [seed; 28], false, false)
    }

    #[test]
    fn dummy_store_is_idempotent() {
        let store = DummyTxBytesStore::new();
        store.save_tx_bytes(&txid(1), b"first");
        store.save_tx_bytes(&txid(1), b"second");
        assert_eq!(store.get_tx_bytes(&txid(1)).unwrap(), b"first");
        assert!(!store.has_tx_bytes(&txid(2)));
    }

    #[test]
    fn sled_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledTxBytesStore::open(dir.path()).unwrap();
        store.save_tx_bytes(&txid(3), b"bytes");
        store.save_tx_bytes(&txid(3), b"other");
        assert_eq!(store.get_tx_bytes(&txid(3)).unwrap(), b"bytes");
        assert!(store.has_tx_bytes(&txid(3)));
    }
}
