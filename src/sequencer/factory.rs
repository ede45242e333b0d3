//! Milestone factory: for each target timestamp it runs the registered
//! proposer strategies in parallel and keeps the best candidate — largest
//! ledger coverage, id tiebreak — under the proposal mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;

use super::proposer;
use super::tippool::SequencerTipPool;
use crate::constants::{MAX_FEE_INPUTS_DEFAULT, MAX_FEE_INPUTS_HARD};
use crate::dag::attacher::AttacherEnv;
use crate::dag::incremental::IncrementalAttacher;
use crate::dag::vertex::{Vid, WrappedOutput};
use crate::ledger::output::MilestoneData;
use crate::ledger::{valid_sequencer_pace, ChainID, LogicalTime, TransactionID};
use crate::workflow::Workflow;
use crate::Hash;

/// Cleanup cadence of the own-milestone map.
const CLEAN_OWN_MILESTONES_PERIOD: Duration = Duration::from_secs(1);

/// Errors starting the factory.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("can't find chain output of {0} in the heaviest state")]
    NoChainOutput(ChainID),
    #[error("no branch known yet")]
    NoBranch,
}

/// An accepted milestone proposal.
#[derive(Clone)]
pub struct Proposal {
    pub tx_bytes: Vec<u8>,
    pub txid: TransactionID,
    pub coverage: u64,
    pub is_branch: bool,
    pub extended: WrappedOutput,
    pub proposed_by: &'static str,
}

struct ProposalSlot {
    target_ts: Option<LogicalTime>,
    best_coverage: u64,
    current: Option<Proposal>,
}

struct OwnMilestone {
    output: WrappedOutput,
}

pub struct MilestoneFactory {
    seq_name: String,
    chain_id: ChainID,
    controller_key: SigningKey,
    workflow: Arc<Workflow>,
    tippool: Arc<SequencerTipPool>,
    max_fee_inputs: usize,
    proposal: Mutex<ProposalSlot>,
    own_milestones: Mutex<HashMap<TransactionID, OwnMilestone>>,
    last_pruned: Mutex<Instant>,
}

impl MilestoneFactory {
    /// Start from the chain tip found in the heaviest committed state.
    pub fn new(
        workflow: Arc<Workflow>,
        tippool: Arc<SequencerTipPool>,
        seq_name: &str,
        chain_id: ChainID,
        controller_key: SigningKey,
        max_fee_inputs: usize,
    ) -> Result<Arc<Self>, FactoryError> {
        let (reader, _) = workflow
            .dag()
            .heaviest_state_for_latest_slot()
            .ok_or(FactoryError::NoBranch)?;
        let chain_out = reader
            .get_chain_output(&chain_id)
            .ok_or(FactoryError::NoChainOutput(chain_id))?;
        let vid = workflow.dag().attach_txid(chain_out.id.tx_id());
        vid.ensure_output(chain_out.id.index(), &chain_out.output);
        let start = WrappedOutput::new(vid, chain_out.id.index());

        let max_fee_inputs = if max_fee_inputs == 0 || max_fee_inputs > MAX_FEE_INPUTS_HARD {
            MAX_FEE_INPUTS_DEFAULT
        } else {
            max_fee_inputs
        };

        let mut own_milestones = HashMap::new();
        own_milestones.insert(start.vid.id(), OwnMilestone { output: start });

        Ok(Arc::new(MilestoneFactory {
            seq_name: seq_name.to_string(),
            chain_id,
            controller_key,
            workflow,
            tippool,
            max_fee_inputs,
            proposal: Mutex::new(ProposalSlot {
                target_ts: None,
                best_coverage: 0,
                current: None,
            }),
            own_milestones: Mutex::new(own_milestones),
            last_pruned: Mutex::new(Instant::now()),
        }))
    }

    pub fn seq_name(&self) -> &str {
        &self.seq_name
    }

    pub fn chain_id(&self) -> ChainID {
        self.chain_id
    }

    pub fn controller_key(&self) -> &SigningKey {
        &self.controller_key
    }

    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }

    pub fn tippool(&self) -> &Arc<SequencerTipPool> {
        &self.tippool
    }

    pub fn max_fee_inputs(&self) -> usize {
        self.max_fee_inputs
    }

    pub fn attacher_env(&self) -> Arc<dyn AttacherEnv> {
        self.workflow.clone()
    }

    // ── own milestones ──

    pub fn add_own_milestone(&self, output: WrappedOutput) {
        let mut own = self.own_milestones.lock().expect("own milestones lock");
        own.entry(output.vid.id())
            .or_insert(OwnMilestone { output });
    }

    /// The latest own milestone output (by timestamp).
    pub fn own_latest_milestone(&self) -> Option<WrappedOutput> {
        let own = self.own_milestones.lock().expect("own milestones lock");
        own.values()
            .max_by(|a, b| {
                a.output
                    .timestamp()
                    .cmp(&b.output.timestamp())
                    .then_with(|| a.output.vid.id().cmp(&b.output.vid.id()))
            })
            .map(|m| m.output.clone())
    }

    pub fn is_own_milestone(&self, txid: &TransactionID) -> bool {
        self.own_milestones
            .lock()
            .expect("own milestones lock")
            .contains_key(txid)
    }

    /// Drop deleted vertices from the own-milestone map, at most once per
    /// second.
    pub fn clean_own_milestones_if_necessary(&self) {
        {
            let mut last = self.last_pruned.lock().expect("last pruned lock");
            if last.elapsed() < CLEAN_OWN_MILESTONES_PERIOD {
                return;
            }
            *last = Instant::now();
        }
        let mut own = self.own_milestones.lock().expect("own milestones lock");
        own.retain(|_, m| !m.output.vid.is_deleted());
    }

    /// Own milestones forming a chain from `root`, ordered by timestamp
    /// (equivalent to topological order), filtered by the time pace against
    /// `target_ts`. Used by the endorse1 strategy to pick extend candidates
    /// inside an endorsement target's past cone.
    pub fn future_cone_milestones_ordered(
        &self,
        root: &Vid,
        target_ts: LogicalTime,
    ) -> Vec<WrappedOutput> {
        self.clean_own_milestones_if_necessary();
        let own = self.own_milestones.lock().expect("own milestones lock");
        let Some(root_ms) = own.get(&root.id()) else {
            return Vec::new();
        };

        let mut ordered: Vec<&OwnMilestone> = own.values().collect();
        ordered.sort_by(|a, b| a.output.timestamp().cmp(&b.output.timestamp()));

        let mut visited = std::collections::HashSet::new();
        visited.insert(root.id());
        let mut ret = vec![root_ms.output.clone()];
        for m in ordered {
            let vid = &m.output.vid;
            if vid.is_deleted() || !vid.is_sequencer_milestone() {
                continue;
            }
            let pred_in_chain = vid
                .sequencer_predecessor()
                .map(|p| visited.contains(&p.id()))
                .unwrap_or(false);
            if pred_in_chain && valid_sequencer_pace(vid.timestamp(), target_ts) {
                visited.insert(vid.id());
                ret.push(m.output.clone());
            }
        }
        ret
    }

    // ── proposal slot ──

    /// Reset the slot for a new target; best-so-far coverage resets only on
    /// slot boundaries.
    pub fn set_new_target(&self, target: Option<LogicalTime>) {
        let mut slot = self.proposal.lock().expect("proposal lock");
        slot.target_ts = target;
        slot.current = None;
        if target.map(|t| t.is_slot_boundary()).unwrap_or(false) {
            slot.best_coverage = 0;
        }
    }

    /// Proposer tasks keep running while their target is current.
    pub fn continue_proposing(&self, target: LogicalTime) -> bool {
        self.proposal.lock().expect("proposal lock").target_ts == Some(target)
    }

    /// The acceptance gate: target match, repetition, coverage improvement
    /// (branch proposals are always accepted). Returns the reject reason.
    pub fn place_proposal(&self, proposal: Proposal) -> Result<(), String> {
        let mut slot = self.proposal.lock().expect("proposal lock");
        let Some(target) = slot.target_ts else {
            return Err("target is gone".into());
        };
        if proposal.txid.timestamp() != target {
            return Err(format!(
                "proposal {} is behind the target {}",
                proposal.txid.short_string(),
                target
            ));
        }
        if let Some(current) = &slot.current {
            if current.txid == proposal.txid {
                return Err("repeating proposal".into());
            }
        }
        if !proposal.is_branch {
            match proposal.coverage.cmp(&slot.best_coverage) {
                std::cmp::Ordering::Less => {
                    return Err(format!(
                        "no increase in coverage: {} < {}",
                        proposal.coverage, slot.best_coverage
                    ));
                }
                std::cmp::Ordering::Equal => {
                    // deterministic across nodes: greater txid wins the tie
                    let tied_winner = match &slot.current {
                        Some(current) => proposal.txid > current.txid,
                        None => true,
                    };
                    if !tied_winner {
                        return Err("equal coverage, smaller id".into());
                    }
                }
                std::cmp::Ordering::Greater => {}
            }
        }
        tracing::debug!(
            seq = %self.seq_name,
            proposal = %proposal.txid.short_string(),
            coverage = proposal.coverage,
            by = proposal.proposed_by,
            "proposal accepted"
        );
        slot.best_coverage = proposal.coverage;
        slot.current = Some(proposal);
        Ok(())
    }

    pub fn current_proposal(&self) -> Option<Proposal> {
        self.proposal.lock().expect("proposal lock").current.clone()
    }

    /// Run all strategies toward `target_ts` until its real-time deadline,
    /// then return the best proposal.
    pub async fn start_proposing_for(
        self: &Arc<Self>,
        target_ts: LogicalTime,
    ) -> Option<Proposal> {
        let identity = self.workflow.identity();
        let deadline_ms = identity.unix_ms_from_logical_time(target_ts);
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        if deadline_ms <= now_ms {
            return None;
        }

        self.set_new_target(Some(target_ts));
        for strategy in proposer::all_strategies() {
            if !strategy.applicable(target_ts) {
                continue;
            }
            let factory = self.clone();
            tokio::spawn(async move {
                proposer::run_proposer_task(strategy, factory, target_ts).await;
            });
        }

        tokio::time::sleep(Duration::from_millis(deadline_ms - now_ms)).await;
        let ret = self.current_proposal();
        // clearing the target signals the workers to exit
        self.set_new_target(None);
        ret
    }

    // ── milestone assembly ──

    /// Milestone metadata continuing the extended output's heights.
    pub fn next_milestone_data(&self, extend: &WrappedOutput, is_branch: bool) -> MilestoneData {
        let prev = extend
            .unwrap_output()
            .and_then(|o| o.output.milestone_data().cloned())
            .unwrap_or_default();
        MilestoneData {
            name: self.seq_name.clone(),
            chain_height: prev.chain_height + 1,
            branch_height: prev.branch_height + u32::from(is_branch),
        }
    }

    /// Finalize an incremental attacher into a signed proposal.
    pub fn finalize_proposal(
        &self,
        attacher: &IncrementalAttacher,
        proposed_by: &'static str,
        already_proposed: &mut std::collections::HashSet<Hash>,
    ) -> Result<Proposal, String> {
        let target = attacher.target_ts();
        let is_branch = target.is_slot_boundary();
        let milestone_data = self.next_milestone_data(attacher.extending(), is_branch);
        let bytes = attacher
            .finalize(
                self.chain_id,
                &self.seq_name,
                milestone_data,
                &self.controller_key,
            )
            .map_err(|e| e.to_string())?;
        let tx = crate::transaction::Transaction::from_bytes(bytes.clone())
            .map_err(|e| e.to_string())?;
        tx.validate_main().map_err(|e| e.to_string())?;

        // prevent repeating proposals with the same consumed path
        let hash = tx.hash_inputs_and_endorsements();
        if !already_proposed.insert(hash) {
            return Err("repeating proposal".into());
        }

        Ok(Proposal {
            txid: tx.id(),
            tx_bytes: bytes,
            coverage: attacher.ledger_coverage().sum(),
            is_branch,
            extended: attacher.extending().clone(),
            proposed_by,
        })
    }
}
