//! Committed multi-state: one immutable state per branch, addressed by the
//! branch transaction id.
//!
//! Backed by sled trees. The original trie is modelled as copy-on-write key
//! prefixes: every committed root owns a full keyspace `root || key`, written
//! once at branch commit and never mutated. The root commitment is a
//! Blake2b-256 digest over the sorted UTXO set.
//!
//! Trees:
//! - `roots`      branch txid -> RootRecord
//! - `utxo`       root || output id -> output bytes
//! - `accounts`   root || account id || output id -> ()
//! - `chains`     root || chain id -> output id
//! - `committed`  root || txid -> ()
//! - `meta`       ledger identity

pub mod txstore;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ledger::coverage::LedgerCoverage;
use crate::ledger::identity::{
    genesis_output, genesis_stem_output, genesis_stem_output_id, genesis_tx_id,
    bootstrap_sequencer_id, LedgerIdentity,
};
use crate::ledger::output::{AccountID, Output, OutputWithID};
use crate::ledger::{ChainID, OutputID, Slot, TransactionID};
use crate::{Blake2b256, Hash};
use blake2::Digest;

const META_IDENTITY_KEY: &[u8] = b"ledger_identity";

/// Errors of the state layer.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("state database is not initialized (run 'db genesis' first)")]
    NotInitialized,
    #[error("state database is already initialized")]
    AlreadyInitialized,
    #[error("root record for branch {0} has not been found")]
    RootRecordNotFound(String),
    #[error("baseline state {0} has not been found")]
    BaselineNotFound(String),
}

/// Persistent record of one committed branch state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRecord {
    /// Commitment to the UTXO set of this state.
    pub root: Hash,
    pub ledger_coverage: LedgerCoverage,
    pub sequencer_id: ChainID,
    pub slot_inflation: u64,
    pub supply: u64,
    /// The stem output produced by this branch.
    pub stem_output_id: OutputID,
    /// Branch this one extends; genesis references itself.
    pub predecessor_branch: TransactionID,
}

/// Mutations a branch applies on top of its baseline.
#[derive(Clone, Debug, Default)]
pub struct BranchMutations {
    pub consumed: Vec<OutputID>,
    pub produced: Vec<(OutputID, Output)>,
    pub committed_txids: Vec<TransactionID>,
}

/// The multi-state database.
pub struct StateStore {
    #[allow(dead_code)]
    db: sled::Db,
    roots: sled::Tree,
    utxo: sled::Tree,
    accounts: sled::Tree,
    chains: sled::Tree,
    committed: sled::Tree,
    meta: sled::Tree,
    identity: LedgerIdentity,
}

fn prefixed(root: &Hash, key: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(32 + key.len());
    ret.extend_from_slice(root);
    ret.extend_from_slice(key);
    ret
}

impl StateStore {
    /// Open an initialized state database.
    pub fn open(path: &Path) -> Result<Self, StateError> {
        let db = sled::open(path)?;
        let meta = db.open_tree("meta")?;
        let identity_bytes = meta.get(META_IDENTITY_KEY)?.ok_or(StateError::NotInitialized)?;
        let identity: LedgerIdentity = bincode::deserialize(&identity_bytes)?;
        Self::with_identity(db, identity)
    }

    /// Create the database and commit the genesis state.
    pub fn init(path: &Path, identity: LedgerIdentity) -> Result<Self, StateError> {
        let db = sled::open(path)?;
        let meta = db.open_tree("meta")?;
        if meta.get(META_IDENTITY_KEY)?.is_some() {
            return Err(StateError::AlreadyInitialized);
        }
        meta.insert(META_IDENTITY_KEY, bincode::serialize(&identity)?)?;
        let store = Self::with_identity(db, identity.clone())?;

        let g_out = genesis_output(&identity);
        let g_stem = genesis_stem_output(&identity);
        let mutations = BranchMutations {
            consumed: vec![],
            produced: vec![
                (g_out.id, g_out.output.clone()),
                (g_stem.id, g_stem.output.clone()),
            ],
            committed_txids: vec![genesis_tx_id()],
        };
        store.commit_branch(
            genesis_tx_id(),
            None,
            &mutations,
            RootRecordData {
                ledger_coverage: LedgerCoverage::from_delta(identity.initial_supply),
                sequencer_id: bootstrap_sequencer_id(),
                slot_inflation: 0,
                supply: identity.initial_supply,
                stem_output_id: genesis_stem_output_id(),
            },
        )?;
        Ok(store)
    }

    fn with_identity(db: sled::Db, identity: LedgerIdentity) -> Result<Self, StateError> {
        Ok(StateStore {
            roots: db.open_tree("roots")?,
            utxo: db.open_tree("utxo")?,
            accounts: db.open_tree("accounts")?,
            chains: db.open_tree("chains")?,
            committed: db.open_tree("committed")?,
            meta: db.open_tree("meta")?,
            db,
            identity,
        })
    }

    pub fn identity(&self) -> &LedgerIdentity {
        &self.identity
    }

    pub fn root_record(&self, branch: &TransactionID) -> Result<Option<RootRecord>, StateError> {
        match self.roots.get(branch.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has_root_record(&self, branch: &TransactionID) -> bool {
        matches!(self.root_record(branch), Ok(Some(_)))
    }

    /// All (branch id, record) pairs, unordered.
    pub fn all_root_records(&self) -> Result<Vec<(TransactionID, RootRecord)>, StateError> {
        let mut ret = Vec::new();
        for item in self.roots.iter() {
            let (k, v) = item?;
            if let Ok(txid) = TransactionID::from_bytes(&k) {
                ret.push((txid, bincode::deserialize(&v)?));
            }
        }
        Ok(ret)
    }

    /// The greatest slot with a committed branch.
    pub fn latest_committed_slot(&self) -> Result<Slot, StateError> {
        Ok(self
            .all_root_records()?
            .iter()
            .map(|(txid, _)| txid.slot())
            .max()
            .unwrap_or(0))
    }

    /// Read view of the branch's state.
    pub fn reader(&self, branch: &TransactionID) -> Result<IndexedStateReader, StateError> {
        let record = self
            .root_record(branch)?
            .ok_or_else(|| StateError::RootRecordNotFound(branch.short_string()))?;
        Ok(IndexedStateReader {
            utxo: self.utxo.clone(),
            accounts: self.accounts.clone(),
            chains: self.chains.clone(),
            committed: self.committed.clone(),
            branch: *branch,
            record,
        })
    }

    /// `later` extends (transitively) `earlier`. Branches are their own
    /// descendants.
    pub fn branch_is_descendant(
        &self,
        later: &TransactionID,
        earlier: &TransactionID,
    ) -> Result<bool, StateError> {
        let mut cursor = *later;
        loop {
            if cursor == *earlier {
                return Ok(true);
            }
            let Some(record) = self.root_record(&cursor)? else {
                return Ok(false);
            };
            if record.predecessor_branch == cursor {
                // reached genesis
                return Ok(false);
            }
            if cursor.slot() < earlier.slot() {
                return Ok(false);
            }
            cursor = record.predecessor_branch;
        }
    }

    /// Commit a new branch state on top of `baseline` (None only at genesis).
    pub fn commit_branch(
        &self,
        branch: TransactionID,
        baseline: Option<TransactionID>,
        mutations: &BranchMutations,
        data: RootRecordData,
    ) -> Result<RootRecord, StateError> {
        if self.has_root_record(&branch) {
            // commits are idempotent by branch id
            return self
                .root_record(&branch)
                .map(|r| r.expect("present by check"));
        }

        // materialize the resulting UTXO set
        let mut set: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut committed_txids: Vec<Vec<u8>> = Vec::new();
        if let Some(baseline) = baseline {
            let base_record = self
                .root_record(&baseline)?
                .ok_or_else(|| StateError::BaselineNotFound(baseline.short_string()))?;
            for item in self.utxo.scan_prefix(base_record.root) {
                let (k, v) = item?;
                set.insert(k[32..].to_vec(), v.to_vec());
            }
            for item in self.committed.scan_prefix(base_record.root) {
                let (k, _) = item?;
                committed_txids.push(k[32..].to_vec());
            }
        }
        for oid in &mutations.consumed {
            set.remove(oid.to_bytes().as_slice());
        }
        for (oid, out) in &mutations.produced {
            set.insert(oid.to_bytes().to_vec(), out.to_bytes());
        }
        for txid in &mutations.committed_txids {
            committed_txids.push(txid.as_bytes().to_vec());
        }

        // the root commits to the sorted UTXO set
        let mut hasher = Blake2b256::new();
        for (k, v) in &set {
            hasher.update(k);
            hasher.update(v);
        }
        let root: Hash = hasher.finalize().into();

        // write the new keyspace
        let mut batch = sled::Batch::default();
        for (k, v) in &set {
            batch.insert(prefixed(&root, k), v.clone());
        }
        self.utxo.apply_batch(batch)?;

        let mut accounts_batch = sled::Batch::default();
        let mut chains_batch = sled::Batch::default();
        for (k, v) in &set {
            let output = Output::from_bytes(v).map_err(|e| {
                StateError::Codec(Box::new(bincode::ErrorKind::Custom(e.to_string())))
            })?;
            let account = output.lock.account().to_bytes();
            let mut acc_key = Vec::with_capacity(32 + 33 + k.len());
            acc_key.extend_from_slice(&root);
            acc_key.extend_from_slice(&account);
            acc_key.extend_from_slice(k);
            accounts_batch.insert(acc_key, &[][..]);

            if let Ok(oid) = OutputID::from_bytes(k) {
                if let Some(chain_id) = output.chain_id_at(&oid) {
                    chains_batch.insert(prefixed(&root, chain_id.as_bytes()), k.clone());
                }
            }
        }
        self.accounts.apply_batch(accounts_batch)?;
        self.chains.apply_batch(chains_batch)?;

        let mut committed_batch = sled::Batch::default();
        for txid in &committed_txids {
            committed_batch.insert(prefixed(&root, txid), &[][..]);
        }
        self.committed.apply_batch(committed_batch)?;

        let record = RootRecord {
            root,
            ledger_coverage: data.ledger_coverage,
            sequencer_id: data.sequencer_id,
            slot_inflation: data.slot_inflation,
            supply: data.supply,
            stem_output_id: data.stem_output_id,
            predecessor_branch: baseline.unwrap_or(branch),
        };
        self.roots
            .insert(branch.as_bytes(), bincode::serialize(&record)?)?;
        self.roots.flush()?;
        Ok(record)
    }
}

/// The non-derived fields of a root record, supplied at commit.
#[derive(Clone, Debug)]
pub struct RootRecordData {
    pub ledger_coverage: LedgerCoverage,
    pub sequencer_id: ChainID,
    pub slot_inflation: u64,
    pub supply: u64,
    pub stem_output_id: OutputID,
}

/// Read view of one committed branch state, with account and chain indices.
#[derive(Clone)]
pub struct IndexedStateReader {
    utxo: sled::Tree,
    accounts: sled::Tree,
    chains: sled::Tree,
    committed: sled::Tree,
    branch: TransactionID,
    record: RootRecord,
}

impl IndexedStateReader {
    pub fn branch(&self) -> TransactionID {
        self.branch
    }

    pub fn root_record(&self) -> &RootRecord {
        &self.record
    }

    pub fn coverage(&self) -> LedgerCoverage {
        self.record.ledger_coverage
    }

    pub fn supply(&self) -> u64 {
        self.record.supply
    }

    pub fn has_utxo(&self, oid: &OutputID) -> bool {
        self.utxo
            .contains_key(prefixed(&self.record.root, &oid.to_bytes()))
            .unwrap_or(false)
    }

    pub fn get_output(&self, oid: &OutputID) -> Option<Output> {
        let bytes = self
            .utxo
            .get(prefixed(&self.record.root, &oid.to_bytes()))
            .ok()??;
        Output::from_bytes(&bytes).ok()
    }

    pub fn get_output_with_id(&self, oid: &OutputID) -> Option<OutputWithID> {
        self.get_output(oid).map(|output| OutputWithID {
            id: *oid,
            output,
        })
    }

    /// The current tip output of a chain in this state.
    pub fn get_chain_output(&self, chain_id: &ChainID) -> Option<OutputWithID> {
        let oid_bytes = self
            .chains
            .get(prefixed(&self.record.root, chain_id.as_bytes()))
            .ok()??;
        let oid = OutputID::from_bytes(&oid_bytes).ok()?;
        self.get_output_with_id(&oid)
    }

    pub fn knows_committed_tx(&self, txid: &TransactionID) -> bool {
        self.committed
            .contains_key(prefixed(&self.record.root, txid.as_bytes()))
            .unwrap_or(false)
    }

    /// The stem output of this branch state.
    pub fn stem_output(&self) -> Option<OutputWithID> {
        self.get_output_with_id(&self.record.stem_output_id)
    }

    /// All outputs indexed under an account, unordered.
    pub fn outputs_for_account(&self, account: &AccountID) -> Vec<OutputWithID> {
        let mut prefix = Vec::with_capacity(32 + 33);
        prefix.extend_from_slice(&self.record.root);
        prefix.extend_from_slice(&account.to_bytes());
        let mut ret = Vec::new();
        for item in self.accounts.scan_prefix(prefix) {
            let Ok((k, _)) = item else { continue };
            let oid_bytes = &k[32 + 33..];
            if let Ok(oid) = OutputID::from_bytes(oid_bytes) {
                if let Some(out) = self.get_output_with_id(&oid) {
                    ret.push(out);
                }
            }
        }
        ret
    }

    pub fn balance_of(&self, account: &AccountID) -> u64 {
        self.outputs_for_account(account)
            .iter()
            .map(|o| o.output.amount)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::identity::genesis_output_id;
    use crate::ledger::output::{AccountID, Lock};
    use crate::ledger::LogicalTime;

    fn identity() -> LedgerIdentity {
        LedgerIdentity::new("test".into(), 0, 3_000_000, [7u8; 32])
    }

    fn new_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::init(dir.path(), identity()).unwrap();
        (dir, store)
    }

    #[test]
    fn genesis_state_is_committed() {
        let (_dir, store) = new_store();
        let reader = store.reader(&genesis_tx_id()).unwrap();
        assert!(reader.has_utxo(&genesis_output_id()));
        assert!(reader.has_utxo(&genesis_stem_output_id()));
        assert!(reader.knows_committed_tx(&genesis_tx_id()));
        assert_eq!(reader.supply(), 3_000_000);
        let chain_out = reader.get_chain_output(&bootstrap_sequencer_id()).unwrap();
        assert_eq!(chain_out.id, genesis_output_id());
        let stem = reader.stem_output().unwrap();
        assert_eq!(stem.output.stem_lock().unwrap().supply, 3_000_000);
    }

    #[test]
    fn reopen_after_init() {
        let dir = tempfile::tempdir().unwrap();
        {
            StateStore::init(dir.path(), identity()).unwrap();
        }
        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.identity().initial_supply, 3_000_000);
        drop(store);
        assert!(matches!(
            StateStore::init(dir.path(), identity()),
            Err(StateError::AlreadyInitialized)
        ));
    }

    #[test]
    fn open_uninitialized_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            StateStore::open(dir.path()),
            Err(StateError::NotInitialized)
        ));
    }

    fn branch_id(slot: Slot, seed: u8) -> TransactionID {
        TransactionID::new(LogicalTime::must_new(slot, 0), [seed; 28], true, true)
    }

    #[test]
    fn commit_and_read_back() {
        let (_dir, store) = new_store();
        let b1 = branch_id(1, 1);
        let addr_a = AccountID::Address([10u8; 32]);
        let new_oid = OutputID::new(b1, 0);
        let stem_oid = OutputID::new(b1, 1);
        let mutations = BranchMutations {
            consumed: vec![genesis_output_id()],
            produced: vec![
                (new_oid, Output::new(3_000_000, Lock::Ed25519([10u8; 32]))),
                (
                    stem_oid,
                    genesis_stem_output(&identity()).output.clone(),
                ),
            ],
            committed_txids: vec![b1],
        };
        store
            .commit_branch(
                b1,
                Some(genesis_tx_id()),
                &mutations,
                RootRecordData {
                    ledger_coverage: LedgerCoverage::from_delta(3_000_000),
                    sequencer_id: bootstrap_sequencer_id(),
                    slot_inflation: 0,
                    supply: 3_000_000,
                    stem_output_id: stem_oid,
                },
            )
            .unwrap();

        let reader = store.reader(&b1).unwrap();
        assert!(!reader.has_utxo(&genesis_output_id()));
        assert!(reader.has_utxo(&new_oid));
        assert!(reader.knows_committed_tx(&genesis_tx_id()));
        assert!(reader.knows_committed_tx(&b1));
        assert_eq!(reader.balance_of(&addr_a), 3_000_000);

        // genesis state unchanged
        let g = store.reader(&genesis_tx_id()).unwrap();
        assert!(g.has_utxo(&genesis_output_id()));
        assert!(!g.knows_committed_tx(&b1));
    }

    #[test]
    fn descendant_walk() {
        let (_dir, store) = new_store();
        let b1 = branch_id(1, 1);
        let b2 = branch_id(2, 2);
        let stem1 = OutputID::new(b1, 1);
        let stem2 = OutputID::new(b2, 1);
        for (branch, baseline, stem) in [
            (b1, genesis_tx_id(), stem1),
            (b2, b1, stem2),
        ] {
            store
                .commit_branch(
                    branch,
                    Some(baseline),
                    &BranchMutations {
                        consumed: vec![],
                        produced: vec![(stem, genesis_stem_output(&identity()).output.clone())],
                        committed_txids: vec![branch],
                    },
                    RootRecordData {
                        ledger_coverage: LedgerCoverage::default(),
                        sequencer_id: bootstrap_sequencer_id(),
                        slot_inflation: 0,
                        supply: 3_000_000,
                        stem_output_id: stem,
                    },
                )
                .unwrap();
        }
        assert!(store.branch_is_descendant(&b2, &b1).unwrap());
        assert!(store.branch_is_descendant(&b2, &genesis_tx_id()).unwrap());
        assert!(store.branch_is_descendant(&b1, &b1).unwrap());
        assert!(!store.branch_is_descendant(&b1, &b2).unwrap());
        let other = branch_id(1, 9);
        assert!(!store.branch_is_descendant(&b2, &other).unwrap());
        assert_eq!(store.latest_committed_slot().unwrap(), 2);
    }
}
