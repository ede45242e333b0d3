//! Wrapped transactions (VIDs): the process-lifetime handles the DAG and the
//! attachers operate on.
//!
//! A vertex carries one of three payloads:
//! - **Vertex** — the full parsed transaction plus resolved dependency links
//! - **Virtual** — only the outputs learned so far (by pull or from state)
//! - **Deleted** — tombstone; any payload access fails
//!
//! Runtime state (status, reason, consumers, coverage, poke waiters) lives
//! next to the payload behind one lock. Nothing is ever called on another
//! vertex while this lock is held.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::Notify;

use super::AttachError;
use crate::ledger::coverage::LedgerCoverage;
use crate::ledger::output::Output;
use crate::ledger::{ChainID, LogicalTime, OutputID, Slot, TransactionID};
use crate::transaction::Transaction;

/// Shared handle to a wrapped transaction.
pub type Vid = Arc<WrappedTx>;

/// Attachment status. Terminal once Good or Bad.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Undefined,
    Good,
    Bad,
}

/// Vertex flags tracked during attachment.
pub const FLAG_BASELINE_SOLID: u8 = 0b0000_0001;
pub const FLAG_ENDORSEMENTS_SOLID: u8 = 0b0000_0010;
pub const FLAG_INPUTS_SOLID: u8 = 0b0000_0100;
pub const FLAG_TX_BYTES_PERSISTED: u8 = 0b0000_1000;
pub const FLAG_CONSTRAINTS_VALID: u8 = 0b0001_0000;

/// Full payload: parsed transaction plus dependency links filled in by the
/// attacher.
pub struct VertexData {
    pub tx: Arc<Transaction>,
    pub inputs: Vec<Option<Vid>>,
    pub endorsements: Vec<Option<Vid>>,
    pub baseline: Option<Vid>,
    pub flags: u8,
}

impl VertexData {
    fn new(tx: Arc<Transaction>) -> Self {
        let num_inputs = tx.num_inputs();
        let num_endorsements = tx.num_endorsements();
        VertexData {
            tx,
            inputs: vec![None; num_inputs],
            endorsements: vec![None; num_endorsements],
            baseline: None,
            flags: 0,
        }
    }

    pub fn flags_up(&self, mask: u8) -> bool {
        self.flags & mask == mask
    }
}

/// Sparse payload of a transaction known only by reference.
#[derive(Default)]
pub struct VirtualTx {
    pub outputs: BTreeMap<u8, Output>,
    pub sequencer_output_index: Option<u8>,
}

enum Payload {
    Vertex(VertexData),
    Virtual(VirtualTx),
    Deleted,
}

struct Inner {
    status: TxStatus,
    reason: Option<AttachError>,
    payload: Payload,
    /// Reverse edges: output index -> consumers of that output.
    consumers: HashMap<u8, Vec<Vid>>,
    /// Milestones endorsing this one.
    endorsers: Vec<Vid>,
    coverage: Option<LedgerCoverage>,
    /// Attachers waiting for this vertex to change; drained on wake.
    waiters: Vec<Weak<Notify>>,
}

pub struct WrappedTx {
    id: TransactionID,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for WrappedTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedTx").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Result of a consumer insertion attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachConsumerResult {
    /// Rejected by the conflict predicate.
    Conflict,
    /// Inserted now.
    Attached,
    /// Was already present.
    AlreadyAttached,
}

impl WrappedTx {
    pub fn new_virtual(id: TransactionID) -> Vid {
        Arc::new(WrappedTx {
            id,
            inner: RwLock::new(Inner {
                status: TxStatus::Undefined,
                reason: None,
                payload: Payload::Virtual(VirtualTx::default()),
                consumers: HashMap::new(),
                endorsers: Vec::new(),
                coverage: None,
                waiters: Vec::new(),
            }),
        })
    }

    pub fn new_from_transaction(tx: Arc<Transaction>) -> Vid {
        Arc::new(WrappedTx {
            id: tx.id(),
            inner: RwLock::new(Inner {
                status: TxStatus::Undefined,
                reason: None,
                payload: Payload::Vertex(VertexData::new(tx)),
                consumers: HashMap::new(),
                endorsers: Vec::new(),
                coverage: None,
                waiters: Vec::new(),
            }),
        })
    }

    // ── id-derived accessors (no lock) ──

    pub fn id(&self) -> TransactionID {
        self.id
    }

    pub fn timestamp(&self) -> LogicalTime {
        self.id.timestamp()
    }

    pub fn slot(&self) -> Slot {
        self.id.slot()
    }

    pub fn is_sequencer_milestone(&self) -> bool {
        self.id.is_sequencer_milestone()
    }

    pub fn is_branch(&self) -> bool {
        self.id.is_branch()
    }

    // ── status ──

    pub fn status(&self) -> TxStatus {
        self.inner.read().expect("vid lock").status
    }

    pub fn reason(&self) -> Option<AttachError> {
        self.inner.read().expect("vid lock").reason.clone()
    }

    /// Good is terminal; must not overwrite Bad.
    pub fn set_status_good(&self) {
        let mut inner = self.inner.write().expect("vid lock");
        debug_assert!(
            inner.status != TxStatus::Bad,
            "status Bad is terminal for {}",
            self.id.short_string()
        );
        inner.status = TxStatus::Good;
    }

    /// Bad is terminal; the first reason wins.
    pub fn set_status_bad(&self, reason: AttachError) {
        let mut inner = self.inner.write().expect("vid lock");
        if inner.status == TxStatus::Bad {
            return;
        }
        inner.status = TxStatus::Bad;
        inner.reason = Some(reason);
    }

    pub fn is_bad_or_deleted(&self) -> bool {
        let inner = self.inner.read().expect("vid lock");
        inner.status == TxStatus::Bad || matches!(inner.payload, Payload::Deleted)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(
            self.inner.read().expect("vid lock").payload,
            Payload::Deleted
        )
    }

    // ── coverage ──

    pub fn coverage(&self) -> Option<LedgerCoverage> {
        self.inner.read().expect("vid lock").coverage
    }

    pub fn set_coverage(&self, coverage: LedgerCoverage) {
        self.inner.write().expect("vid lock").coverage = Some(coverage);
    }

    // ── payload dispatch ──

    /// Run exactly one closure depending on the current payload, under the
    /// read lock. Closures must not call back into this vertex.
    pub fn unwrap<R>(
        &self,
        on_vertex: impl FnOnce(&VertexData) -> R,
        on_virtual: impl FnOnce(&VirtualTx) -> R,
        on_deleted: impl FnOnce() -> R,
    ) -> R {
        let inner = self.inner.read().expect("vid lock");
        match &inner.payload {
            Payload::Vertex(v) => on_vertex(v),
            Payload::Virtual(v) => on_virtual(v),
            Payload::Deleted => on_deleted(),
        }
    }

    /// Run `f` on the full payload, if present.
    pub fn with_vertex<R>(&self, f: impl FnOnce(&VertexData) -> R) -> Option<R> {
        let inner = self.inner.read().expect("vid lock");
        match &inner.payload {
            Payload::Vertex(v) => Some(f(v)),
            _ => None,
        }
    }

    fn with_vertex_mut<R>(&self, f: impl FnOnce(&mut VertexData) -> R) -> Option<R> {
        let mut inner = self.inner.write().expect("vid lock");
        match &mut inner.payload {
            Payload::Vertex(v) => Some(f(v)),
            _ => None,
        }
    }

    /// The parsed transaction, if the payload is full.
    pub fn tx(&self) -> Option<Arc<Transaction>> {
        self.with_vertex(|v| v.tx.clone())
    }

    pub fn is_virtual(&self) -> bool {
        matches!(
            self.inner.read().expect("vid lock").payload,
            Payload::Virtual(_)
        )
    }

    // ── payload transitions ──

    /// Promote Virtual -> Vertex when the full bytes arrive. Returns false if
    /// the payload already was full (idempotent ingress) and panics on
    /// deleted access.
    pub fn convert_virtual_to_vertex(&self, tx: Arc<Transaction>) -> bool {
        assert_eq!(tx.id(), self.id, "transaction id mismatch");
        let mut inner = self.inner.write().expect("vid lock");
        match &inner.payload {
            Payload::Virtual(_) => {
                inner.payload = Payload::Vertex(VertexData::new(tx));
                true
            }
            Payload::Vertex(_) => false,
            Payload::Deleted => panic!(
                "deleted vertex should not be accessed: {}",
                self.id.short_string()
            ),
        }
    }

    /// Demote Vertex -> Virtual after a branch closes: the full past cone is
    /// no longer referenced, only the produced outputs remain reachable.
    pub fn convert_vertex_to_virtual(&self) {
        let mut inner = self.inner.write().expect("vid lock");
        let (outputs, seq_idx) = match &inner.payload {
            Payload::Vertex(v) => {
                let mut outputs = BTreeMap::new();
                for (i, out) in v.tx.produced_outputs().iter().enumerate() {
                    outputs.insert(i as u8, out.clone());
                }
                let seq_idx = v.tx.sequencer_data().map(|d| d.sequencer_output_index);
                (outputs, seq_idx)
            }
            Payload::Virtual(_) => return,
            Payload::Deleted => panic!(
                "deleted vertex should not be accessed: {}",
                self.id.short_string()
            ),
        };
        inner.payload = Payload::Virtual(VirtualTx {
            outputs,
            sequencer_output_index: seq_idx,
        });
    }

    /// Tombstone transition; terminal.
    pub fn mark_deleted(&self) {
        let mut inner = self.inner.write().expect("vid lock");
        inner.payload = Payload::Deleted;
        inner.consumers.clear();
        inner.endorsers.clear();
        inner.waiters.clear();
    }

    // ── outputs ──

    /// Output at index: `Ok(None)` means not known yet (virtual), error means
    /// a wrong index or deleted access.
    pub fn output_at(&self, idx: u8) -> Result<Option<Output>, AttachError> {
        let inner = self.inner.read().expect("vid lock");
        match &inner.payload {
            Payload::Vertex(v) => match v.tx.produced_output_at(idx) {
                Some(out) => Ok(Some(out.clone())),
                None => Err(AttachError::DependencyBad(format!(
                    "wrong output index {} in {}",
                    idx,
                    self.id.short_string()
                ))),
            },
            Payload::Virtual(v) => Ok(v.outputs.get(&idx).cloned()),
            Payload::Deleted => Err(AttachError::DeletedVertexAccessed),
        }
    }

    /// Lazily populate a virtual vertex's output slot on first discovery.
    /// Returns false on content mismatch with an already-known output.
    pub fn ensure_output(&self, idx: u8, output: &Output) -> bool {
        let mut inner = self.inner.write().expect("vid lock");
        match &mut inner.payload {
            Payload::Virtual(v) => match v.outputs.get(&idx) {
                Some(existing) => existing == output,
                None => {
                    v.outputs.insert(idx, output.clone());
                    true
                }
            },
            Payload::Vertex(v) => v
                .tx
                .produced_output_at(idx)
                .map(|o| o == output)
                .unwrap_or(false),
            Payload::Deleted => false,
        }
    }

    // ── dependency links ──

    pub fn input_dep(&self, idx: usize) -> Option<Vid> {
        self.with_vertex(|v| v.inputs.get(idx).cloned().flatten())
            .flatten()
    }

    pub fn set_input_dep(&self, idx: usize, dep: Vid) {
        self.with_vertex_mut(|v| {
            if let Some(slot) = v.inputs.get_mut(idx) {
                *slot = Some(dep);
            }
        });
    }

    pub fn endorsement_dep(&self, idx: usize) -> Option<Vid> {
        self.with_vertex(|v| v.endorsements.get(idx).cloned().flatten())
            .flatten()
    }

    pub fn set_endorsement_dep(&self, idx: usize, dep: Vid) {
        self.with_vertex_mut(|v| {
            if let Some(slot) = v.endorsements.get_mut(idx) {
                *slot = Some(dep);
            }
        });
    }

    /// Release all dependency links (on failure or cancellation).
    pub fn unreference_dependencies(&self) {
        self.with_vertex_mut(|v| {
            for slot in v.inputs.iter_mut() {
                *slot = None;
            }
            for slot in v.endorsements.iter_mut() {
                *slot = None;
            }
            v.baseline = None;
        });
    }

    // ── baseline ──

    pub fn set_baseline(&self, baseline: Vid) {
        self.with_vertex_mut(|v| v.baseline = Some(baseline));
    }

    /// The baseline branch: self if this is a good branch, else the cached
    /// baseline of the full payload.
    pub fn baseline_branch(self: &Arc<Self>) -> Option<Vid> {
        let inner = self.inner.read().expect("vid lock");
        match &inner.payload {
            Payload::Vertex(v) => {
                if self.id.is_branch() && inner.status == TxStatus::Good {
                    Some(self.clone())
                } else {
                    v.baseline.clone()
                }
            }
            Payload::Virtual(_) => {
                if self.id.is_branch() && inner.status == TxStatus::Good {
                    Some(self.clone())
                } else {
                    None
                }
            }
            Payload::Deleted => None,
        }
    }

    // ── flags ──

    pub fn flags_up(&self, mask: u8) -> bool {
        self.with_vertex(|v| v.flags_up(mask)).unwrap_or(false)
    }

    pub fn set_flag_up(&self, mask: u8) {
        self.with_vertex_mut(|v| v.flags |= mask);
    }

    // ── sequencer data ──

    /// The sequencer chain id, when derivable from the payload.
    pub fn sequencer_id_if_available(&self) -> Option<ChainID> {
        let inner = self.inner.read().expect("vid lock");
        match &inner.payload {
            Payload::Vertex(v) => v.tx.sequencer_data().map(|d| d.sequencer_id),
            Payload::Virtual(v) => {
                let idx = v.sequencer_output_index?;
                let out = v.outputs.get(&idx)?;
                out.chain_id_at(&OutputID::new(self.id, idx))
            }
            Payload::Deleted => None,
        }
    }

    /// The consumed chain-predecessor vertex of a sequencer milestone.
    pub fn sequencer_predecessor(&self) -> Option<Vid> {
        self.with_vertex(|v| {
            let (_, idx) = v.tx.sequencer_chain_predecessor()?;
            v.inputs.get(idx as usize).cloned().flatten()
        })
        .flatten()
    }

    // ── consumers ──

    /// Atomically insert `consumer` into `consumers[index]` unless the
    /// conflict predicate rejects the existing consumer set. The predicate
    /// must not take any vertex lock.
    pub fn attach_consumer(
        &self,
        index: u8,
        consumer: &Vid,
        conflict: impl FnOnce(&[Vid]) -> bool,
    ) -> AttachConsumerResult {
        let mut inner = self.inner.write().expect("vid lock");
        let list = inner.consumers.entry(index).or_default();
        if list.iter().any(|c| c.id() == consumer.id()) {
            return AttachConsumerResult::AlreadyAttached;
        }
        if conflict(list) {
            return AttachConsumerResult::Conflict;
        }
        list.push(consumer.clone());
        AttachConsumerResult::Attached
    }

    /// Undo of [`WrappedTx::attach_consumer`], for transactional rollbacks.
    pub fn remove_consumer(&self, index: u8, consumer_id: &TransactionID) {
        let mut inner = self.inner.write().expect("vid lock");
        if let Some(list) = inner.consumers.get_mut(&index) {
            list.retain(|c| c.id() != *consumer_id);
        }
    }

    pub fn consumers_of(&self, index: u8) -> Vec<Vid> {
        self.inner
            .read()
            .expect("vid lock")
            .consumers
            .get(&index)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_endorser(&self, endorser: &Vid) {
        let mut inner = self.inner.write().expect("vid lock");
        if !inner.endorsers.iter().any(|e| e.id() == endorser.id()) {
            inner.endorsers.push(endorser.clone());
        }
    }

    // ── pokes ──

    /// Register an attacher's wake-up signal; fired (and dropped) on the next
    /// [`WrappedTx::wake_waiters`].
    pub fn add_waiter(&self, notify: &Arc<Notify>) {
        let mut inner = self.inner.write().expect("vid lock");
        let exists = inner.waiters.iter().any(|w| {
            w.upgrade()
                .map(|n| Arc::ptr_eq(&n, notify))
                .unwrap_or(false)
        });
        if !exists {
            inner.waiters.push(Arc::downgrade(notify));
        }
    }

    /// Fan a poke out to every waiting attacher.
    pub fn wake_waiters(&self) {
        let waiters = {
            let mut inner = self.inner.write().expect("vid lock");
            std::mem::take(&mut inner.waiters)
        };
        for w in waiters {
            if let Some(n) = w.upgrade() {
                n.notify_one();
            }
        }
    }

    /// Poke everything downstream: consumers and endorsers.
    pub fn wake_future_cone(&self) {
        let downstream: Vec<Vid> = {
            let inner = self.inner.read().expect("vid lock");
            inner
                .consumers
                .values()
                .flatten()
                .chain(inner.endorsers.iter())
                .cloned()
                .collect()
        };
        self.wake_waiters();
        for vid in downstream {
            vid.wake_waiters();
        }
    }
}

/// One produced output addressed through its wrapped producer.
#[derive(Clone)]
pub struct WrappedOutput {
    pub vid: Vid,
    pub index: u8,
}

impl WrappedOutput {
    pub fn new(vid: Vid, index: u8) -> Self {
        WrappedOutput { vid, index }
    }

    pub fn id(&self) -> OutputID {
        OutputID::new(self.vid.id(), self.index)
    }

    pub fn timestamp(&self) -> LogicalTime {
        self.vid.timestamp()
    }

    pub fn output(&self) -> Result<Option<Output>, AttachError> {
        self.vid.output_at(self.index)
    }

    /// Resolve into an output-with-id, when the output is known.
    pub fn unwrap_output(&self) -> Option<crate::ledger::output::OutputWithID> {
        self.output()
            .ok()
            .flatten()
            .map(|output| crate::ledger::output::OutputWithID {
                id: self.id(),
                output,
            })
    }
}

impl PartialEq for WrappedOutput {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.vid.id() == other.vid.id()
    }
}

impl Eq for WrappedOutput {}

impl std::hash::Hash for WrappedOutput {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.vid.id().hash(state);
        self.index.hash(state);
    }
}

impl std::fmt::Debug for WrappedOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WrappedOutput({})", self.id().short_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::output::Lock;
    use crate::ledger::LogicalTime;

    fn txid(seed: u8) -> TransactionID {
        TransactionID::new(LogicalTime::must_new(1, 10), [seed; 28], false, false)
    }

    #[test]
    fn status_is_monotonic() {
        let vid = WrappedTx::new_virtual(txid(1));
        assert_eq!(vid.status(), TxStatus::Undefined);
        vid.set_status_bad(AttachError::Cancelled);
        assert_eq!(vid.status(), TxStatus::Bad);
        // second reason does not overwrite
        vid.set_status_bad(AttachError::DeletedVertexAccessed);
        assert!(matches!(vid.reason(), Some(AttachError::Cancelled)));
    }

    #[test]
    fn virtual_outputs_are_lazily_populated() {
        let vid = WrappedTx::new_virtual(txid(2));
        assert_eq!(vid.output_at(0).unwrap(), None);
        let out = Output::new(100, Lock::Ed25519([1u8; 32]));
        assert!(vid.ensure_output(0, &out));
        assert_eq!(vid.output_at(0).unwrap(), Some(out.clone()));
        // mismatching re-ensure fails
        let other = Output::new(200, Lock::Ed25519([1u8; 32]));
        assert!(!vid.ensure_output(0, &other));
    }

    #[test]
    fn deleted_access_fails() {
        let vid = WrappedTx::new_virtual(txid(3));
        vid.mark_deleted();
        assert!(matches!(
            vid.output_at(0),
            Err(AttachError::DeletedVertexAccessed)
        ));
        assert!(vid.is_deleted());
        let called = vid.unwrap(|_| "vertex", |_| "virtual", || "deleted");
        assert_eq!(called, "deleted");
    }

    #[test]
    fn attach_consumer_conflict_detection() {
        let producer = WrappedTx::new_virtual(txid(4));
        let consumer1 = WrappedTx::new_virtual(txid(5));
        let consumer2 = WrappedTx::new_virtual(txid(6));

        assert_eq!(
            producer.attach_consumer(0, &consumer1, |_| false),
            AttachConsumerResult::Attached
        );
        assert_eq!(
            producer.attach_consumer(0, &consumer1, |_| false),
            AttachConsumerResult::AlreadyAttached
        );
        // predicate sees the existing consumer
        let result = producer.attach_consumer(0, &consumer2, |existing| {
            existing.iter().any(|c| c.id() == consumer1.id())
        });
        assert_eq!(result, AttachConsumerResult::Conflict);
        assert_eq!(producer.consumers_of(0).len(), 1);

        producer.remove_consumer(0, &consumer1.id());
        assert!(producer.consumers_of(0).is_empty());
    }

    #[tokio::test]
    async fn waiters_are_drained_on_wake() {
        let vid = WrappedTx::new_virtual(txid(7));
        let notify = Arc::new(Notify::new());
        vid.add_waiter(&notify);
        vid.add_waiter(&notify); // deduplicated
        vid.wake_waiters();
        // the stored permit wakes the first await immediately
        notify.notified().await;
        // a second wake finds no waiters and must not panic
        vid.wake_waiters();
    }

    #[test]
    fn wrapped_output_identity() {
        let vid = WrappedTx::new_virtual(txid(8));
        let a = WrappedOutput::new(vid.clone(), 0);
        let b = WrappedOutput::new(vid.clone(), 0);
        let c = WrappedOutput::new(vid, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
