//! Sequencer tip pool: tag-along candidates and the latest milestone seen
//! for every known sequencer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::dag::vertex::{Vid, WrappedOutput};
use crate::ledger::output::AccountID;
use crate::ledger::{valid_sequencer_pace, ChainID, LogicalTime, OutputID};
use crate::workflow::Workflow;

struct TipPoolInner {
    /// Tag-along eligible outputs chain-locked to this sequencer.
    outputs: HashMap<OutputID, WrappedOutput>,
    /// Latest milestone per sequencer id, including our own.
    latest_milestones: HashMap<ChainID, Vid>,
    last_purged: Instant,
    output_count: usize,
    removed_since_reset: usize,
}

pub struct SequencerTipPool {
    name: String,
    chain_id: ChainID,
    slot_duration_ms: u64,
    inner: Mutex<TipPoolInner>,
}

/// Snapshot counters for periodic logging.
#[derive(Clone, Copy, Debug, Default)]
pub struct TipPoolStats {
    pub num_other_sequencers: usize,
    pub num_outputs: usize,
    pub output_count: usize,
    pub removed_since_reset: usize,
}

impl SequencerTipPool {
    /// Create the pool, subscribe to the chain-locked account and to
    /// sequencer milestones, and load the current tips from the heaviest
    /// state.
    pub fn new(workflow: &Arc<Workflow>, name: &str, chain_id: ChainID) -> Arc<Self> {
        let pool = Arc::new(SequencerTipPool {
            name: format!("tippool-{}", name),
            chain_id,
            slot_duration_ms: workflow.identity().slot_duration_ms(),
            inner: Mutex::new(TipPoolInner {
                outputs: HashMap::new(),
                latest_milestones: HashMap::new(),
                last_purged: Instant::now(),
                output_count: 0,
                removed_since_reset: 0,
            }),
        });

        // chain-locked outputs are tag-along candidates
        let listener = pool.clone();
        workflow.listen_to_account(AccountID::ChainLock(chain_id), move |wout| {
            listener.on_account_output(wout);
        });

        // track the latest milestone of every sequencer
        let listener = pool.clone();
        workflow.listen_to_sequencers(move |vid| {
            listener.on_sequencer_milestone(vid);
        });

        pool.load_tips(workflow);
        pool
    }

    fn load_tips(&self, workflow: &Arc<Workflow>) {
        let Some((reader, _)) = workflow.dag().heaviest_state_for_latest_slot() else {
            return;
        };
        let mut inner = self.inner.lock().expect("tippool lock");
        for out in reader.outputs_for_account(&AccountID::ChainLock(self.chain_id)) {
            let vid = workflow.dag().attach_txid(out.id.tx_id());
            vid.ensure_output(out.id.index(), &out.output);
            let wout = WrappedOutput::new(vid, out.id.index());
            if is_candidate_to_tag_along(&wout) {
                inner.outputs.insert(out.id, wout);
                inner.output_count += 1;
            }
        }
        // our own chain tip seeds the milestone map
        if let Some(chain_out) = reader.get_chain_output(&self.chain_id) {
            let vid = workflow.dag().attach_txid(chain_out.id.tx_id());
            vid.ensure_output(chain_out.id.index(), &chain_out.output);
            inner.latest_milestones.insert(self.chain_id, vid);
        }
        tracing::debug!(
            tippool = %self.name,
            outputs = inner.outputs.len(),
            "tip pool loaded"
        );
    }

    fn on_account_output(&self, wout: &WrappedOutput) {
        self.purge();
        if !is_candidate_to_tag_along(wout) {
            return;
        }
        let mut inner = self.inner.lock().expect("tippool lock");
        if inner.outputs.insert(wout.id(), wout.clone()).is_none() {
            inner.output_count += 1;
            tracing::trace!(target: "tippool", pool = %self.name, output = %wout.id().short_string(), "output in");
        }
    }

    fn on_sequencer_milestone(&self, vid: &Vid) {
        let Some(seq_id) = vid.sequencer_id_if_available() else {
            return;
        };
        let mut inner = self.inner.lock().expect("tippool lock");
        let newer = match inner.latest_milestones.get(&seq_id) {
            Some(old) => vid.timestamp() >= old.timestamp(),
            None => true,
        };
        if newer {
            inner.latest_milestones.insert(seq_id, vid.clone());
            tracing::trace!(target: "tippool", pool = %self.name, milestone = %vid.id().short_string(), "milestone in");
        }
    }

    /// Drop bad or deleted entries. Runs at most every half slot.
    pub fn purge(&self) {
        let cleanup_period = Duration::from_millis(self.slot_duration_ms / 2);
        let mut inner = self.inner.lock().expect("tippool lock");
        if inner.last_purged.elapsed() < cleanup_period {
            return;
        }
        let before = inner.outputs.len();
        inner.outputs.retain(|_, wout| is_candidate_to_tag_along(wout));
        let removed = before - inner.outputs.len();
        inner.removed_since_reset += removed;
        inner
            .latest_milestones
            .retain(|_, vid| !vid.is_bad_or_deleted());
        inner.last_purged = Instant::now();
    }

    pub fn chain_id(&self) -> ChainID {
        self.chain_id
    }

    /// Eligible outputs passing `filter`, sorted by ascending timestamp.
    pub fn filter_and_sort_outputs(
        &self,
        filter: impl Fn(&WrappedOutput) -> bool,
    ) -> Vec<WrappedOutput> {
        self.purge();
        let inner = self.inner.lock().expect("tippool lock");
        let mut ret: Vec<WrappedOutput> =
            inner.outputs.values().filter(|w| filter(w)).cloned().collect();
        ret.sort_by(|a, b| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| a.id().cmp(&b.id()))
        });
        ret
    }

    /// Milestones endorsable at `target_ts`: same slot, valid time pace,
    /// ordered most-preferred first (coverage, then id).
    pub fn pre_select_endorsable_milestones(&self, target_ts: LogicalTime) -> Vec<Vid> {
        self.purge();
        let inner = self.inner.lock().expect("tippool lock");
        let mut ret: Vec<Vid> = inner
            .latest_milestones
            .values()
            .filter(|vid| {
                vid.slot() == target_ts.slot()
                    && valid_sequencer_pace(vid.timestamp(), target_ts)
            })
            .cloned()
            .collect();
        ret.sort_by(|a, b| {
            if is_preferred_milestone(a, b) {
                std::cmp::Ordering::Less
            } else if is_preferred_milestone(b, a) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        ret
    }

    /// The latest milestone of our own chain.
    pub fn own_latest_milestone(&self) -> Option<Vid> {
        self.inner
            .lock()
            .expect("tippool lock")
            .latest_milestones
            .get(&self.chain_id)
            .cloned()
    }

    pub fn latest_milestone(&self, seq_id: &ChainID) -> Option<Vid> {
        self.inner
            .lock()
            .expect("tippool lock")
            .latest_milestones
            .get(seq_id)
            .cloned()
    }

    pub fn num_outputs(&self) -> usize {
        self.inner.lock().expect("tippool lock").outputs.len()
    }

    pub fn stats_and_reset(&self) -> TipPoolStats {
        let mut inner = self.inner.lock().expect("tippool lock");
        let ret = TipPoolStats {
            num_other_sequencers: inner.latest_milestones.len().saturating_sub(1),
            num_outputs: inner.outputs.len(),
            output_count: inner.output_count,
            removed_since_reset: inner.removed_since_reset,
        };
        inner.removed_since_reset = 0;
        ret
    }
}

/// Pure tag-along candidates only: alive, not produced by a branch, no
/// chain constraint.
fn is_candidate_to_tag_along(wout: &WrappedOutput) -> bool {
    if wout.vid.is_bad_or_deleted() {
        return false;
    }
    if wout.vid.is_branch() {
        return false;
    }
    match wout.output() {
        Ok(Some(out)) => out.chain_constraint().is_none(),
        _ => true,
    }
}

/// Strict preference between milestones: larger coverage first, greater id
/// on ties.
pub fn is_preferred_milestone(a: &Vid, b: &Vid) -> bool {
    if a.id() == b.id() {
        return false;
    }
    let ca = a.coverage().unwrap_or_default().sum();
    let cb = b.coverage().unwrap_or_default().sum();
    match ca.cmp(&cb) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Equal => a.id() > b.id(),
        std::cmp::Ordering::Less => false,
    }
}
