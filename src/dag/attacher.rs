//! Past-cone attacher: incremental solidification of a vertex against a
//! baseline committed state.
//!
//! The attacher walks endorsements depth-first and inputs breadth-wise,
//! proving every consumed output either *rooted* (present unconsumed in the
//! baseline state, contributing to the coverage delta) or produced by a fully
//! validated past vertex. Double spends are detected through the consumer
//! back-edges; unrooted ancestry older than the parasitic horizon is
//! rejected.
//!
//! No lock is held across any call into another vertex, the DAG, or the
//! environment.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Notify;

use super::vertex::{
    AttachConsumerResult, TxStatus, Vid, WrappedOutput, FLAG_BASELINE_SOLID,
    FLAG_CONSTRAINTS_VALID, FLAG_ENDORSEMENTS_SOLID, FLAG_INPUTS_SOLID, FLAG_TX_BYTES_PERSISTED,
};
use super::{AttachError, Dag};
use crate::constants::PARASITIC_CHAIN_SLOTS;
use crate::ledger::coverage::LedgerCoverage;
use crate::ledger::output::Output;
use crate::ledger::{LogicalTime, OutputID, TransactionID};
use crate::state::{IndexedStateReader, StateStore};
use crate::transaction::evaluate::ConstraintEvaluator;
use crate::transaction::Transaction;

/// Everything the attacher needs from the hosting process.
pub trait AttacherEnv: Send + Sync {
    fn dag(&self) -> &Dag;
    fn state_store(&self) -> &Arc<StateStore>;
    fn evaluator(&self) -> &dyn ConstraintEvaluator;
    /// Register a pull request for a missing transaction.
    fn pull(&self, txid: TransactionID);
    /// Remove a pull request (the requesting attacher terminated).
    fn stop_pull(&self, txid: &TransactionID);
    /// Asynchronously persist validated transaction bytes.
    fn persist_tx_bytes(&self, tx: &Transaction);
    /// A vertex passed constraint validation inside some past cone.
    fn on_tx_validated(&self, vid: &Vid);
    /// A milestone attachment finished Good.
    fn on_milestone_good(&self, vid: &Vid);
}

/// Result of one solidification pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Fully solid and validated.
    Done,
    /// Something is still undefined; re-run after a poke.
    Pending,
}

/// Mutable per-attacher state shared by the milestone and incremental
/// attachers.
pub struct PastCone {
    env: Arc<dyn AttacherEnv>,
    name: String,
    baseline: Option<Vid>,
    baseline_reader: Option<Arc<IndexedStateReader>>,
    prev_coverage: LedgerCoverage,
    /// Outputs proven to exist unconsumed in the baseline state.
    rooted: HashMap<TransactionID, (Vid, BTreeSet<u8>)>,
    /// Fully validated past-cone vertices.
    valid: HashMap<TransactionID, Vid>,
    /// Discovered but not yet validated.
    undefined: HashMap<TransactionID, Vid>,
    /// Outputs consumed within this cone; `None` marks consumption by a
    /// transaction still under construction (incremental attacher).
    consumed: HashMap<OutputID, Option<TransactionID>>,
    /// Undo log of consumer insertions for transactional rollback.
    consumer_log: Vec<(Vid, u8, TransactionID)>,
    /// Sum of amounts of newly rooted outputs.
    coverage_delta: u64,
    reason: Option<AttachError>,
    /// Wake-up signal registered with pending dependencies.
    poke: Option<Arc<Notify>>,
    /// Pulls requested by this attacher, removed on termination.
    pulled: HashSet<TransactionID>,
}

impl PastCone {
    pub fn new(
        env: Arc<dyn AttacherEnv>,
        name: impl Into<String>,
        poke: Option<Arc<Notify>>,
    ) -> Self {
        PastCone {
            env,
            name: name.into(),
            baseline: None,
            baseline_reader: None,
            prev_coverage: LedgerCoverage::default(),
            rooted: HashMap::new(),
            valid: HashMap::new(),
            undefined: HashMap::new(),
            consumed: HashMap::new(),
            consumer_log: Vec::new(),
            coverage_delta: 0,
            reason: None,
            poke,
            pulled: HashSet::new(),
        }
    }

    fn request_pull(&mut self, txid: TransactionID) {
        self.pulled.insert(txid);
        self.env.pull(txid);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &Arc<dyn AttacherEnv> {
        &self.env
    }

    pub fn reason(&self) -> Option<&AttachError> {
        self.reason.as_ref()
    }

    pub fn baseline(&self) -> Option<&Vid> {
        self.baseline.as_ref()
    }

    pub fn coverage_delta(&self) -> u64 {
        self.coverage_delta
    }

    pub fn num_undefined(&self) -> usize {
        self.undefined.len()
    }

    pub fn is_complete(&self) -> bool {
        self.reason.is_none() && self.undefined.is_empty() && self.baseline.is_some()
    }

    fn set_reason(&mut self, err: AttachError) -> AttachError {
        tracing::trace!(target: "attach", attacher = %self.name, reason = %err, "set reason");
        if self.reason.is_none() {
            self.reason = Some(err.clone());
        }
        err
    }

    fn poke_me(&self, dep: &Vid) {
        if let Some(notify) = &self.poke {
            tracing::trace!(target: "attach", attacher = %self.name, dep = %dep.id().short_string(), "poke me");
            dep.add_waiter(notify);
        }
    }

    /// Fix the baseline branch and load its coverage from the root record.
    pub fn set_baseline(&mut self, baseline: Vid) -> Result<(), AttachError> {
        debug_assert!(baseline.is_branch());
        let record = self
            .env
            .state_store()
            .root_record(&baseline.id())
            .ok()
            .flatten()
            .ok_or_else(|| {
                AttachError::BaselineSolidificationFailed(format!(
                    "no root record for baseline {}",
                    baseline.id().short_string()
                ))
            })?;
        self.prev_coverage = record.ledger_coverage;
        let reader = self
            .env
            .dag()
            .state_reader_for_branch(&baseline)
            .map_err(|e| AttachError::BaselineSolidificationFailed(e.to_string()))?;
        self.baseline_reader = Some(reader);
        self.baseline = Some(baseline);
        Ok(())
    }

    pub fn prev_coverage(&self) -> LedgerCoverage {
        self.prev_coverage
    }

    fn baseline_reader(&self) -> &Arc<IndexedStateReader> {
        self.baseline_reader
            .as_ref()
            .expect("baseline must be solid before past-cone work")
    }

    /// Coverage of a milestone at `ts` on top of the baseline.
    pub fn ledger_coverage(&self, ts: LogicalTime) -> LedgerCoverage {
        let baseline_slot = self
            .baseline
            .as_ref()
            .map(|b| b.slot())
            .unwrap_or(ts.slot());
        let shift = ts.slot().saturating_sub(baseline_slot) as usize;
        self.prev_coverage.make_next(shift, self.coverage_delta)
    }

    fn mark_vertex_visited(&mut self, vid: &Vid, good: bool) {
        if good {
            self.undefined.remove(&vid.id());
            self.valid.insert(vid.id(), vid.clone());
        } else {
            debug_assert!(!self.valid.contains_key(&vid.id()));
            self.undefined.insert(vid.id(), vid.clone());
        }
    }

    pub fn is_known_valid(&self, txid: &TransactionID) -> bool {
        self.valid.contains_key(txid)
    }

    fn is_known(&self, txid: &TransactionID) -> bool {
        self.valid.contains_key(txid) || self.undefined.contains_key(txid)
    }

    pub fn is_rooted(&self, txid: &TransactionID) -> bool {
        self.rooted
            .get(txid)
            .map(|(_, set)| !set.is_empty())
            .unwrap_or(false)
    }

    /// Snapshot of the rooted output ids, for branch commit.
    pub fn rooted_outputs(&self) -> Vec<OutputID> {
        let mut ret = Vec::new();
        for (txid, (_, indices)) in &self.rooted {
            for idx in indices {
                ret.push(OutputID::new(*txid, *idx));
            }
        }
        ret
    }

    /// The fully validated past vertices.
    pub fn valid_vertices(&self) -> Vec<Vid> {
        self.valid.values().cloned().collect()
    }

    /// Whether `oid` is consumed within this cone.
    pub fn is_consumed_in_cone(&self, oid: &OutputID) -> bool {
        self.consumed.contains_key(oid)
    }

    // ── baseline solidification ──

    /// Drive attachment toward the deterministically known baseline of a
    /// sequencer milestone. `Ok(true)` when the baseline is set.
    pub fn solidify_baseline(&mut self, vid: &Vid) -> Result<bool, AttachError> {
        let Some(tx) = vid.tx() else {
            return Err(self.set_reason(AttachError::BaselineSolidificationFailed(format!(
                "unexpected virtual payload of {}",
                vid.id().short_string()
            ))));
        };
        if vid.flags_up(FLAG_BASELINE_SOLID) {
            return Ok(true);
        }
        let input_tx = if tx.is_branch() {
            self.stem_predecessor_vid(vid, &tx)?
        } else {
            self.sequencer_baseline_direction(vid, &tx)?
        };
        match input_tx.status() {
            TxStatus::Good => {
                let baseline = input_tx.baseline_branch().ok_or_else(|| {
                    self.set_reason(AttachError::BaselineSolidificationFailed(format!(
                        "good dependency {} has no baseline",
                        input_tx.id().short_string()
                    )))
                })?;
                vid.set_baseline(baseline.clone());
                vid.set_flag_up(FLAG_BASELINE_SOLID);
                self.set_baseline(baseline)
                    .map_err(|e| self.set_reason(e))?;
                Ok(true)
            }
            TxStatus::Undefined => {
                self.poke_me(&input_tx);
                Ok(false)
            }
            TxStatus::Bad => {
                let reason = input_tx
                    .reason()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".into());
                Err(self.set_reason(AttachError::DependencyBad(reason)))
            }
        }
    }

    /// The predecessor stem's producer, attached if needed.
    fn stem_predecessor_vid(&mut self, vid: &Vid, tx: &Transaction) -> Result<Vid, AttachError> {
        let stem_out = tx.stem_output().ok_or_else(|| {
            self.set_reason(AttachError::BaselineSolidificationFailed(
                "branch without stem output".into(),
            ))
        })?;
        let pred_oid = stem_out
            .output
            .stem_lock()
            .expect("stem output scanned at parse")
            .predecessor_output_id;
        let stem_input_idx = tx
            .inputs()
            .iter()
            .position(|oid| *oid == pred_oid)
            .ok_or_else(|| {
                self.set_reason(AttachError::BaselineSolidificationFailed(
                    "predecessor stem is not among the inputs".into(),
                ))
            })?;
        let dep = match vid.input_dep(stem_input_idx) {
            Some(dep) => dep,
            None => {
                let dep = self.env.dag().attach_txid(pred_oid.tx_id());
                vid.set_input_dep(stem_input_idx, dep.clone());
                dep
            }
        };
        Ok(dep)
    }

    /// For a non-branch milestone: follow the chain predecessor when it is a
    /// same-slot sequencer transaction, otherwise the first endorsement.
    fn sequencer_baseline_direction(
        &mut self,
        vid: &Vid,
        tx: &Transaction,
    ) -> Result<Vid, AttachError> {
        let (pred_oid, pred_idx) = tx.sequencer_chain_predecessor().ok_or_else(|| {
            self.set_reason(AttachError::BaselineSolidificationFailed(
                "sequencer milestone cannot be a chain origin".into(),
            ))
        })?;
        let follow_endorsement = pred_oid.slot() != tx.slot()
            || !pred_oid.tx_id().is_sequencer_milestone();
        if follow_endorsement {
            if tx.num_endorsements() == 0 {
                return Err(self.set_reason(AttachError::BaselineSolidificationFailed(
                    "cross-slot predecessor without endorsement".into(),
                )));
            }
            let endorsed_id = tx.endorsement_at(0).expect("checked non-empty");
            let dep = match vid.endorsement_dep(0) {
                Some(dep) => dep,
                None => {
                    let dep = self.ensure_vid_with_pull(endorsed_id);
                    vid.set_endorsement_dep(0, dep.clone());
                    dep.add_endorser(vid);
                    dep
                }
            };
            Ok(dep)
        } else {
            let dep = match vid.input_dep(pred_idx as usize) {
                Some(dep) => dep,
                None => {
                    let dep = self.ensure_vid_with_pull(pred_oid.tx_id());
                    vid.set_input_dep(pred_idx as usize, dep.clone());
                    dep
                }
            };
            Ok(dep)
        }
    }

    /// Attach by txid and pull the bytes when unknown (non-branch only;
    /// branch bytes always come from the state store or gossip).
    fn ensure_vid_with_pull(&mut self, txid: TransactionID) -> Vid {
        let vid = self.env.dag().attach_txid(txid);
        if vid.is_virtual() && !txid.is_branch() {
            self.request_pull(txid);
        }
        vid
    }

    // ── past-cone traversal ──

    /// Solidify the past cone of `vid`. Returns `Err` on terminal failure;
    /// `Ok(Pending)` when something is still undefined.
    pub fn attach_vertex(
        &mut self,
        vid: &Vid,
        horizon: Option<LogicalTime>,
        visited: &mut HashSet<TransactionID>,
    ) -> Result<Progress, AttachError> {
        if vid.status() == TxStatus::Bad {
            let reason = vid
                .reason()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".into());
            return Err(self.set_reason(AttachError::DependencyBad(reason)));
        }
        if !visited.insert(vid.id()) {
            return Ok(Progress::Done);
        }
        if self.is_known_valid(&vid.id()) {
            return Ok(Progress::Done);
        }
        tracing::trace!(target: "attach", attacher = %self.name, vid = %vid.id().short_string(), "attach vertex");
        self.mark_vertex_visited(vid, false);

        let Some(tx) = vid.tx() else {
            // virtual: ask for the bytes and resume on arrival
            if !vid.id().is_branch() {
                self.request_pull(vid.id());
            }
            self.poke_me(vid);
            return Ok(Progress::Pending);
        };

        let endorsements_ok = self.attach_endorsements(vid, &tx, horizon, visited)?;
        let inputs_ok = self.attach_inputs(vid, &tx, horizon, visited)?;

        if inputs_ok && !vid.flags_up(FLAG_CONSTRAINTS_VALID) {
            self.validate_constraints(vid, &tx)?;
        }

        if endorsements_ok && inputs_ok && vid.flags_up(FLAG_CONSTRAINTS_VALID) {
            self.mark_vertex_visited(vid, true);
            return Ok(Progress::Done);
        }
        Ok(Progress::Pending)
    }

    /// Depth-first along endorsements. `Ok(true)` when all endorsements are
    /// solid and valid.
    fn attach_endorsements(
        &mut self,
        vid: &Vid,
        tx: &Transaction,
        horizon: Option<LogicalTime>,
        visited: &mut HashSet<TransactionID>,
    ) -> Result<bool, AttachError> {
        if vid.flags_up(FLAG_ENDORSEMENTS_SOLID) {
            return Ok(true);
        }
        let mut all_good = true;
        for i in 0..tx.num_endorsements() {
            let endorsed_id = tx.endorsement_at(i).expect("in range");
            let dep = match vid.endorsement_dep(i) {
                Some(dep) => dep,
                None => {
                    let dep = self.ensure_vid_with_pull(endorsed_id);
                    vid.set_endorsement_dep(i, dep.clone());
                    dep.add_endorser(vid);
                    dep
                }
            };

            if let Some(endorsed_baseline) = dep.baseline_branch() {
                self.require_branches_compatible(&endorsed_baseline)?;
            }

            match dep.status() {
                TxStatus::Bad => {
                    let reason = dep
                        .reason()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown".into());
                    return Err(self.set_reason(AttachError::DependencyBad(reason)));
                }
                TxStatus::Good => {
                    if self.is_known_valid(&dep.id()) {
                        continue;
                    }
                    if !dep.is_branch() {
                        // go deeper only when the endorsement is already good,
                        // in order not to interfere with its own attacher
                        self.attach_vertex(&dep, horizon, visited)?;
                        if !self.is_known_valid(&dep.id()) {
                            all_good = false;
                            self.poke_me(&dep);
                        }
                    }
                    // never traverse behind a branch
                }
                TxStatus::Undefined => {
                    all_good = false;
                    self.poke_me(&dep);
                }
            }
        }
        if all_good {
            vid.set_flag_up(FLAG_ENDORSEMENTS_SOLID);
        }
        Ok(all_good)
    }

    /// Attach all inputs of the vertex. `Ok(true)` when every input is
    /// rooted or produced by a validated past vertex.
    fn attach_inputs(
        &mut self,
        vid: &Vid,
        tx: &Transaction,
        horizon: Option<LogicalTime>,
        visited: &mut HashSet<TransactionID>,
    ) -> Result<bool, AttachError> {
        let mut all_solid = true;
        for i in 0..tx.num_inputs() {
            if !self.attach_input(vid, tx, i as u8, horizon, visited)? {
                all_solid = false;
            }
        }
        if all_solid && !vid.flags_up(FLAG_INPUTS_SOLID) {
            vid.set_flag_up(FLAG_INPUTS_SOLID);
            if !tx.is_sequencer_milestone() {
                // poke whoever waits for this non-sequencer tx; sequencer
                // milestones poke upon attachment finalization
                vid.wake_waiters();
            }
        }
        Ok(all_solid)
    }

    fn attach_input(
        &mut self,
        vid: &Vid,
        tx: &Transaction,
        input_idx: u8,
        horizon: Option<LogicalTime>,
        visited: &mut HashSet<TransactionID>,
    ) -> Result<bool, AttachError> {
        let oid = tx.input_at(input_idx).expect("in range");
        let dep = self.attach_input_id(vid, &oid, input_idx)?;

        // the parasitic horizon is anchored at the baseline branch
        let horizon = horizon.or_else(|| {
            let baseline_slot = self.baseline.as_ref().map(|b| b.slot()).unwrap_or(0);
            Some(LogicalTime::must_new(
                baseline_slot.saturating_sub(PARASITIC_CHAIN_SLOTS),
                0,
            ))
        });

        let wout = WrappedOutput::new(dep.clone(), oid.index());
        self.attach_output(&wout, horizon, visited)?;

        Ok(self.is_known_valid(&dep.id()) || self.is_rooted(&dep.id()))
    }

    /// Ensure the producing vertex exists, insert the consumer back-edge with
    /// the double-spend check, and verify baseline compatibility for
    /// sequencer inputs.
    fn attach_input_id(
        &mut self,
        consumer: &Vid,
        oid: &OutputID,
        input_idx: u8,
    ) -> Result<Vid, AttachError> {
        let dep = match consumer.input_dep(input_idx as usize) {
            Some(dep) => dep,
            None => {
                let dep = self.env.dag().attach_txid(oid.tx_id());
                consumer.set_input_dep(input_idx as usize, dep.clone());
                dep
            }
        };
        if dep.status() == TxStatus::Bad {
            let reason = dep
                .reason()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".into());
            return Err(self.set_reason(AttachError::DependencyBad(reason)));
        }

        // CONFLICT DETECTION: reject if another consumer of this output is
        // already a member of this attacher's past cone
        let valid = &self.valid;
        let undefined = &self.undefined;
        let consumer_id = consumer.id();
        let result = dep.attach_consumer(oid.index(), consumer, |existing| {
            existing.iter().any(|c| {
                c.id() != consumer_id
                    && (valid.contains_key(&c.id()) || undefined.contains_key(&c.id()))
            })
        });
        match result {
            AttachConsumerResult::Conflict => {
                return Err(self.set_reason(AttachError::ConflictInPastCone(*oid)));
            }
            AttachConsumerResult::Attached => {
                self.consumer_log.push((dep.clone(), oid.index(), consumer_id));
            }
            AttachConsumerResult::AlreadyAttached => {}
        }
        self.consumed.insert(*oid, Some(consumer_id));

        if dep.is_sequencer_milestone() {
            if let Some(input_baseline) = dep.baseline_branch() {
                self.require_branches_compatible(&input_baseline)?;
            }
        }
        Ok(dep)
    }

    /// Attach one consumed output: root it in the baseline state or descend
    /// into its producer.
    pub fn attach_output(
        &mut self,
        wout: &WrappedOutput,
        horizon: Option<LogicalTime>,
        visited: &mut HashSet<TransactionID>,
    ) -> Result<(), AttachError> {
        if self.attach_rooted(wout)? {
            return Ok(());
        }

        if let Some(h) = horizon {
            if wout.timestamp() < h {
                let err = AttachError::ParasiticChainViolation(wout.id());
                return Err(self.set_reason(err));
            }
        }

        let is_seq = wout.vid.is_sequencer_milestone();
        let status = wout.vid.status();
        if wout.vid.tx().is_some() {
            if !is_seq || status == TxStatus::Good {
                // reset the horizon behind a good sequencer milestone
                let horizon = if is_seq { None } else { horizon };
                self.attach_vertex(&wout.vid, horizon, visited)?;
            } else {
                self.poke_me(&wout.vid);
            }
        } else if wout.vid.is_deleted() {
            return Err(self.set_reason(AttachError::DeletedVertexAccessed));
        } else {
            // virtual: pull and resume when the bytes arrive
            if !wout.vid.id().is_branch() {
                self.request_pull(wout.vid.id());
            }
            self.poke_me(&wout.vid);
        }
        Ok(())
    }

    /// Try to prove the output exists unconsumed in the baseline state.
    /// `Ok(true)` when rooted.
    fn attach_rooted(&mut self, wout: &WrappedOutput) -> Result<bool, AttachError> {
        let baseline = self
            .baseline
            .as_ref()
            .expect("baseline must be solid before past-cone work");
        if wout.timestamp() > baseline.timestamp() {
            // later than the baseline: cannot be rooted in it
            return Ok(false);
        }
        let producer_id = wout.vid.id();
        if let Some((_, indices)) = self.rooted.get(&producer_id) {
            if indices.contains(&wout.index) {
                // already covered; double spends are checked by attach_input_id
                return Ok(true);
            }
        }

        let reader = self.baseline_reader().clone();
        let oid = wout.id();
        let has_rooted_siblings = self
            .rooted
            .get(&producer_id)
            .map(|(_, s)| !s.is_empty())
            .unwrap_or(false);
        if !has_rooted_siblings && !reader.knows_committed_tx(&producer_id) {
            // not rooted, but it is fine
            return Ok(false);
        }
        match reader.get_output(&oid) {
            Some(out) => {
                if !wout.vid.ensure_output(wout.index, &out) {
                    return Err(self.set_reason(AttachError::ConstraintValidationFailed(
                        format!("output content mismatch at {}", oid.short_string()),
                    )));
                }
                let entry = self
                    .rooted
                    .entry(producer_id)
                    .or_insert_with(|| (wout.vid.clone(), BTreeSet::new()));
                entry.1.insert(wout.index);
                // newly rooted output feeds the coverage delta
                self.coverage_delta = self.coverage_delta.saturating_add(out.amount);
                Ok(true)
            }
            None => {
                let err = AttachError::ConsumedInBaseline(oid);
                Err(self.set_reason(err))
            }
        }
    }

    fn require_branches_compatible(&mut self, other: &Vid) -> Result<(), AttachError> {
        let baseline = self
            .baseline
            .as_ref()
            .expect("baseline must be solid before past-cone work")
            .clone();
        if branches_compatible(self.env.state_store(), &baseline, other) {
            Ok(())
        } else {
            Err(self.set_reason(AttachError::BranchesIncompatible(
                baseline.id(),
                other.id(),
            )))
        }
    }

    /// Run the constraint evaluator on the full transaction once all inputs
    /// are available, then persist non-sequencer bytes.
    fn validate_constraints(&mut self, vid: &Vid, tx: &Transaction) -> Result<(), AttachError> {
        let mut resolved: Vec<Output> = Vec::with_capacity(tx.num_inputs());
        for (i, oid) in tx.inputs().iter().enumerate() {
            let out = match vid.input_dep(i) {
                Some(dep) => dep.output_at(oid.index())?,
                None => None,
            };
            match out {
                Some(out) => resolved.push(out),
                None => {
                    // inputs reported solid but an output is unknown: stay
                    // pending, the poke will come with the bytes
                    return Ok(());
                }
            }
        }
        if let Err(err) = self.env.evaluator().validate(tx, &resolved) {
            let err = AttachError::ConstraintValidationFailed(err.to_string());
            vid.set_status_bad(err.clone());
            return Err(self.set_reason(err));
        }
        vid.set_flag_up(FLAG_CONSTRAINTS_VALID);
        if !tx.is_sequencer_milestone() && !vid.flags_up(FLAG_TX_BYTES_PERSISTED) {
            self.env.persist_tx_bytes(tx);
            vid.set_flag_up(FLAG_TX_BYTES_PERSISTED);
        }
        self.env.on_tx_validated(vid);
        Ok(())
    }

    // ── transactional inclusion for the incremental attacher ──

    /// Snapshot for rollback of incremental insertions.
    pub fn snapshot(&self) -> ConeSnapshot {
        ConeSnapshot {
            rooted: self.rooted.clone(),
            valid: self.valid.clone(),
            undefined: self.undefined.clone(),
            consumed: self.consumed.clone(),
            coverage_delta: self.coverage_delta,
            consumer_log_len: self.consumer_log.len(),
            reason: self.reason.clone(),
        }
    }

    /// Restore the snapshot and undo consumer insertions made since.
    pub fn rollback(&mut self, snapshot: ConeSnapshot) {
        for (vid, idx, consumer_id) in self.consumer_log.drain(snapshot.consumer_log_len..) {
            vid.remove_consumer(idx, &consumer_id);
        }
        self.rooted = snapshot.rooted;
        self.valid = snapshot.valid;
        self.undefined = snapshot.undefined;
        self.consumed = snapshot.consumed;
        self.coverage_delta = snapshot.coverage_delta;
        self.reason = snapshot.reason;
    }

    /// Include an output consumed by a transaction under construction: checks
    /// conflicts against the cone and solidifies the producer.
    pub fn include_consumed_output(&mut self, wout: &WrappedOutput) -> Result<(), AttachError> {
        let oid = wout.id();
        if self.consumed.contains_key(&oid) {
            return Err(self.set_reason(AttachError::ConflictInPastCone(oid)));
        }
        // an existing consumer inside this cone is a conflict as well
        let conflicting = wout
            .vid
            .consumers_of(wout.index)
            .iter()
            .any(|c| self.is_known(&c.id()));
        if conflicting {
            return Err(self.set_reason(AttachError::ConflictInPastCone(oid)));
        }
        let mut visited = HashSet::new();
        self.attach_output(wout, None, &mut visited)?;
        if !self.is_rooted(&wout.vid.id()) && !self.is_known_valid(&wout.vid.id()) {
            return Err(self.set_reason(AttachError::BaselineSolidificationFailed(format!(
                "output {} is not solid",
                oid.short_string()
            ))));
        }
        self.consumed.insert(oid, None);
        Ok(())
    }

    /// Attach the past cone of an already-good milestone being endorsed.
    pub fn include_endorsement(&mut self, endorsed: &Vid) -> Result<(), AttachError> {
        if endorsed.status() != TxStatus::Good {
            return Err(self.set_reason(AttachError::DependencyBad(format!(
                "endorsement target {} is not good",
                endorsed.id().short_string()
            ))));
        }
        if let Some(endorsed_baseline) = endorsed.baseline_branch() {
            self.require_branches_compatible(&endorsed_baseline)?;
        }
        if endorsed.is_branch() {
            return Ok(());
        }
        let mut visited = HashSet::new();
        match self.attach_vertex(endorsed, None, &mut visited)? {
            Progress::Done => Ok(()),
            Progress::Pending => Err(self.set_reason(AttachError::BaselineSolidificationFailed(
                format!(
                    "past cone of endorsement {} is not solid",
                    endorsed.id().short_string()
                ),
            ))),
        }
    }

    /// Undo every consumer edge this attacher inserted and drop its pending
    /// pulls (failure and cancellation path).
    pub fn unreference_all(&mut self) {
        for (vid, idx, consumer_id) in self.consumer_log.drain(..) {
            vid.remove_consumer(idx, &consumer_id);
        }
        let pulled: Vec<TransactionID> = self.pulled.drain().collect();
        for txid in pulled {
            self.env.stop_pull(&txid);
        }
    }
}

/// Rollback point of a [`PastCone`].
pub struct ConeSnapshot {
    rooted: HashMap<TransactionID, (Vid, BTreeSet<u8>)>,
    valid: HashMap<TransactionID, Vid>,
    undefined: HashMap<TransactionID, Vid>,
    consumed: HashMap<OutputID, Option<TransactionID>>,
    coverage_delta: u64,
    consumer_log_len: usize,
    reason: Option<AttachError>,
}

/// Two branches are compatible iff one is a stem-descendant of the other.
/// Distinct branches on the same slot conflict.
pub fn branches_compatible(store: &Arc<StateStore>, b1: &Vid, b2: &Vid) -> bool {
    debug_assert!(b1.is_branch() && b2.is_branch());
    if b1.id() == b2.id() {
        return true;
    }
    if b1.slot() == b2.slot() {
        return false;
    }
    let (earlier, later) = if b1.slot() < b2.slot() {
        (b1, b2)
    } else {
        (b2, b1)
    };
    store
        .branch_is_descendant(&later.id(), &earlier.id())
        .unwrap_or(false)
}
