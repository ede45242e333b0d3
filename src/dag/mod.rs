//! The tangle DAG: process-wide registry of wrapped transactions and branch
//! state readers.

pub mod attacher;
pub mod incremental;
pub mod milestone;
pub mod vertex;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::ledger::coverage::LedgerCoverage;
use crate::ledger::{OutputID, Slot, TransactionID};
use crate::state::{IndexedStateReader, StateError, StateStore};
use vertex::{Vid, WrappedTx};

/// Terminal and transient failures of attachment. Cached on the vertex once
/// terminal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AttachError {
    #[error("baseline solidification failed: {0}")]
    BaselineSolidificationFailed(String),
    #[error("conflict in the past cone (double spend): {0}")]
    ConflictInPastCone(OutputID),
    #[error("branches are incompatible: {0} and {1}")]
    BranchesIncompatible(TransactionID, TransactionID),
    #[error("parasitic chain horizon broken at output {0}")]
    ParasiticChainViolation(OutputID),
    #[error("output {0} is already consumed in the baseline state")]
    ConsumedInBaseline(OutputID),
    #[error("constraint validation failed: {0}")]
    ConstraintValidationFailed(String),
    #[error("dependency is bad: {0}")]
    DependencyBad(String),
    #[error("attacher has been cancelled")]
    Cancelled,
    #[error("deleted vertex accessed")]
    DeletedVertexAccessed,
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

/// The DAG registry. A single reader-writer lock guards the two maps; vertex
/// mutations take the vertex's own lock, never this one.
pub struct Dag {
    state_store: Arc<StateStore>,
    inner: RwLock<DagInner>,
}

struct DagInner {
    vertices: HashMap<TransactionID, Vid>,
    branches: HashMap<TransactionID, BranchEntry>,
}

struct BranchEntry {
    vid: Vid,
    reader: Arc<IndexedStateReader>,
}

impl Dag {
    pub fn new(state_store: Arc<StateStore>) -> Self {
        Dag {
            state_store,
            inner: RwLock::new(DagInner {
                vertices: HashMap::new(),
                branches: HashMap::new(),
            }),
        }
    }

    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.state_store
    }

    pub fn get_vertex(&self, txid: &TransactionID) -> Option<Vid> {
        self.inner
            .read()
            .expect("dag lock")
            .vertices
            .get(txid)
            .cloned()
    }

    pub fn num_vertices(&self) -> usize {
        self.inner.read().expect("dag lock").vertices.len()
    }

    /// Get or create the vertex for `txid`. Creation yields a virtual vertex;
    /// idempotent and atomic under the registry write lock. Branches already
    /// committed to the state store come out `Good` with their recorded
    /// coverage, and the branch reader is cached.
    pub fn attach_txid(&self, txid: TransactionID) -> Vid {
        if let Some(vid) = self.get_vertex(&txid) {
            return vid;
        }
        let mut inner = self.inner.write().expect("dag lock");
        if let Some(vid) = inner.vertices.get(&txid) {
            return vid.clone();
        }
        let vid = WrappedTx::new_virtual(txid);
        inner.vertices.insert(txid, vid.clone());
        drop(inner);

        if txid.is_branch() {
            if let Ok(Some(record)) = self.state_store.root_record(&txid) {
                vid.set_coverage(record.ledger_coverage);
                vid.set_status_good();
                if let Err(err) = self.add_branch(&vid) {
                    tracing::error!(branch = %txid.short_string(), error = %err, "can't cache branch state reader");
                }
            }
        }
        vid
    }

    /// Insert a full vertex for a parsed transaction, or promote the existing
    /// virtual one. Returns the (single) vertex for this txid and whether the
    /// payload was newly installed.
    pub fn attach_transaction(&self, tx: Arc<crate::transaction::Transaction>) -> (Vid, bool) {
        let txid = tx.id();
        let vid = self.attach_txid(txid);
        let installed = vid.convert_virtual_to_vertex(tx);
        (vid, installed)
    }

    /// Cache the committed state reader of a branch vertex.
    pub fn add_branch(&self, branch: &Vid) -> Result<(), StateError> {
        assert!(branch.id().is_branch(), "add_branch: not a branch vertex");
        {
            let inner = self.inner.read().expect("dag lock");
            if inner.branches.contains_key(&branch.id()) {
                return Ok(());
            }
        }
        let reader = Arc::new(self.state_store.reader(&branch.id())?);
        let mut inner = self.inner.write().expect("dag lock");
        inner.branches.entry(branch.id()).or_insert(BranchEntry {
            vid: branch.clone(),
            reader,
        });
        Ok(())
    }

    /// Read view of a branch's committed state.
    pub fn state_reader_for_branch(
        &self,
        branch: &Vid,
    ) -> Result<Arc<IndexedStateReader>, StateError> {
        {
            let inner = self.inner.read().expect("dag lock");
            if let Some(entry) = inner.branches.get(&branch.id()) {
                return Ok(entry.reader.clone());
            }
        }
        // not cached yet; fall back to the store
        let reader = Arc::new(self.state_store.reader(&branch.id())?);
        Ok(reader)
    }

    /// The greatest slot with a known branch.
    pub fn latest_branch_slot(&self) -> Slot {
        self.inner
            .read()
            .expect("dag lock")
            .branches
            .keys()
            .map(|txid| txid.slot())
            .max()
            .unwrap_or(0)
    }

    fn branches_for_slot(inner: &DagInner, slot: Slot) -> Vec<Vid> {
        inner
            .branches
            .values()
            .filter(|e| e.vid.id().slot() == slot)
            .map(|e| e.vid.clone())
            .collect()
    }

    /// Among branches of the latest slot, the one with the largest coverage;
    /// ties broken by greater lexicographic id. Deterministic given identical
    /// DAG state.
    pub fn heaviest_branch_of_latest_slot(&self) -> Option<Vid> {
        let inner = self.inner.read().expect("dag lock");
        let slot = inner
            .branches
            .keys()
            .map(|txid| txid.slot())
            .max()?;
        Self::branches_for_slot(&inner, slot)
            .into_iter()
            .max_by(|a, b| {
                let ca = a.coverage().unwrap_or_default().sum();
                let cb = b.coverage().unwrap_or_default().sum();
                ca.cmp(&cb).then_with(|| a.id().cmp(&b.id()))
            })
    }

    /// Reader of the heaviest branch state, with the branch vertex.
    pub fn heaviest_state_for_latest_slot(
        &self,
    ) -> Option<(Arc<IndexedStateReader>, Vid)> {
        let branch = self.heaviest_branch_of_latest_slot()?;
        let reader = self.state_reader_for_branch(&branch).ok()?;
        Some((reader, branch))
    }

    /// Traverse all vertices under the read lock; stop when `f` returns false.
    pub fn for_each_vertex(&self, mut f: impl FnMut(&Vid) -> bool) {
        let inner = self.inner.read().expect("dag lock");
        for vid in inner.vertices.values() {
            if !f(vid) {
                return;
            }
        }
    }

    /// Poll until `txid` is known by the heaviest committed state.
    pub async fn wait_until_tx_in_heaviest_state(
        &self,
        txid: TransactionID,
        timeout: Duration,
    ) -> Result<Vid, String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some((reader, baseline)) = self.heaviest_state_for_latest_slot() {
                if reader.knows_committed_tx(&txid) {
                    return Ok(baseline);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!(
                    "timeout waiting for {} in the heaviest state",
                    txid.short_string()
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Tombstone vertices that have fallen out of the retention window and
    /// drop their branch readers. Returns the number of pruned vertices.
    pub fn prune(&self, keep_slots: Slot) -> usize {
        let latest = self.latest_branch_slot();
        let horizon = latest.saturating_sub(keep_slots);
        if horizon == 0 {
            return 0;
        }
        let mut to_delete = Vec::new();
        {
            let inner = self.inner.read().expect("dag lock");
            for (txid, vid) in &inner.vertices {
                if txid.slot() < horizon && !vid.is_deleted() {
                    to_delete.push((*txid, vid.clone()));
                }
            }
        }
        for (_, vid) in &to_delete {
            vid.mark_deleted();
        }
        let mut inner = self.inner.write().expect("dag lock");
        for (txid, _) in &to_delete {
            inner.vertices.remove(txid);
            inner.branches.remove(txid);
        }
        to_delete.len()
    }

    /// Per-branch cached coverage, for diagnostics and the branch tree dump.
    pub fn branches_with_coverage(&self) -> Vec<(TransactionID, LedgerCoverage)> {
        let inner = self.inner.read().expect("dag lock");
        inner
            .branches
            .values()
            .map(|e| (e.vid.id(), e.vid.coverage().unwrap_or_default()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::identity::{genesis_tx_id, LedgerIdentity};
    use crate::ledger::LogicalTime;

    fn new_dag() -> (tempfile::TempDir, Dag) {
        let dir = tempfile::tempdir().unwrap();
        let identity = LedgerIdentity::new("test".into(), 0, 1_000_000, [7u8; 32]);
        let store = Arc::new(StateStore::init(dir.path(), identity).unwrap());
        (dir, Dag::new(store))
    }

    #[test]
    fn attach_txid_is_idempotent() {
        let (_dir, dag) = new_dag();
        let txid = TransactionID::new(LogicalTime::must_new(1, 10), [1u8; 28], false, false);
        let v1 = dag.attach_txid(txid);
        let v2 = dag.attach_txid(txid);
        assert!(Arc::ptr_eq(&v1, &v2));
        assert_eq!(dag.num_vertices(), 1);
    }

    #[test]
    fn known_branch_comes_out_good() {
        let (_dir, dag) = new_dag();
        let genesis = dag.attach_txid(genesis_tx_id());
        assert_eq!(genesis.status(), vertex::TxStatus::Good);
        assert!(genesis.coverage().is_some());
        let heaviest = dag.heaviest_branch_of_latest_slot().unwrap();
        assert!(Arc::ptr_eq(&heaviest, &genesis));
    }

    #[test]
    fn heaviest_branch_is_deterministic() {
        let (_dir, dag) = new_dag();
        dag.attach_txid(genesis_tx_id());
        let a = dag.heaviest_branch_of_latest_slot().unwrap();
        let b = dag.heaviest_branch_of_latest_slot().unwrap();
        assert_eq!(a.id(), b.id());
    }
}
