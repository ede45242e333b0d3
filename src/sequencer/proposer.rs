//! Proposer strategies and the generic proposer task loop.
//!
//! Strategies are registered in a fixed order so that nodes advertising the
//! same strategy list iterate identically. Each worker loops until the
//! factory's target moves on: propose, evaluate coverage, place under the
//! proposal mutex.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::factory::MilestoneFactory;
use super::proposer_base::BaseProposer;
use super::proposer_endorse1::Endorse1Proposer;
use crate::dag::incremental::IncrementalAttacher;
use crate::dag::vertex::{Vid, WrappedOutput};
use crate::ledger::{valid_transaction_pace, LogicalTime, TransactionID};
use crate::Hash;

/// Pause between proposal attempts of one worker.
const PROPOSE_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Outcome of one proposal attempt.
pub enum ProposeResult {
    /// A complete candidate to assess.
    Candidate(IncrementalAttacher),
    /// Nothing right now; retry after a pause.
    NothingNow,
    /// This strategy cannot contribute to the current target.
    ForceExit,
}

/// Per-task mutable state handed to strategies.
pub struct TaskContext {
    pub factory: Arc<MilestoneFactory>,
    pub target_ts: LogicalTime,
    /// Hashes of (inputs ‖ endorsements) already proposed by this task.
    pub already_proposed: HashSet<Hash>,
    /// (extend, endorse) pairs already tried.
    pub visited: HashSet<(TransactionID, TransactionID)>,
}

impl TaskContext {
    pub fn store_visited(&mut self, extend: &Vid, endorse: &Vid) {
        self.visited.insert((extend.id(), endorse.id()));
    }

    pub fn already_visited(&self, extend: &Vid, endorse: &Vid) -> bool {
        self.visited.contains(&(extend.id(), endorse.id()))
    }

    /// Collect tag-along fee inputs into the attacher, bounded by the
    /// factory's fee-input limit. Conflicting candidates are rolled back and
    /// skipped.
    pub fn attach_tag_along_inputs(&self, attacher: &mut IncrementalAttacher) {
        let target_ts = self.target_ts;
        let candidates = self
            .factory
            .tippool()
            .filter_and_sort_outputs(|wout| valid_transaction_pace(wout.timestamp(), target_ts));
        for wout in candidates {
            if attacher.num_tag_along() >= self.factory.max_fee_inputs() {
                break;
            }
            if let Err(err) = attacher.insert_tag_along_input(&wout) {
                tracing::trace!(
                    target: "propose",
                    output = %wout.id().short_string(),
                    reason = %err,
                    "tag-along skipped"
                );
            }
        }
    }
}

/// A milestone proposal strategy.
pub trait ProposerStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Whether the strategy applies to this target at all.
    fn applicable(&self, _target_ts: LogicalTime) -> bool {
        true
    }
    fn propose(&self, ctx: &mut TaskContext) -> ProposeResult;
}

/// The strategy registry, in stable iteration order.
pub fn all_strategies() -> Vec<Arc<dyn ProposerStrategy>> {
    vec![Arc::new(BaseProposer), Arc::new(Endorse1Proposer)]
}

/// Generic worker loop: propose until the factory's target moves on.
pub async fn run_proposer_task(
    strategy: Arc<dyn ProposerStrategy>,
    factory: Arc<MilestoneFactory>,
    target_ts: LogicalTime,
) {
    let mut ctx = TaskContext {
        factory: factory.clone(),
        target_ts,
        already_proposed: HashSet::new(),
        visited: HashSet::new(),
    };
    tracing::trace!(target: "propose", strategy = strategy.name(), target = %target_ts, "proposer started");
    loop {
        if !factory.continue_proposing(target_ts) {
            break;
        }
        match strategy.propose(&mut ctx) {
            ProposeResult::Candidate(attacher) => {
                assess_and_accept(&mut ctx, strategy.name(), &attacher);
            }
            ProposeResult::NothingNow => {}
            ProposeResult::ForceExit => break,
        }
        tokio::time::sleep(PROPOSE_RETRY_PAUSE).await;
    }
    tracing::trace!(target: "propose", strategy = strategy.name(), target = %target_ts, "proposer finished");
}

fn assess_and_accept(ctx: &mut TaskContext, strategy_name: &'static str, attacher: &IncrementalAttacher) {
    if !attacher.completed() {
        return;
    }
    let proposal = match ctx.factory.finalize_proposal(
        attacher,
        strategy_name,
        &mut ctx.already_proposed,
    ) {
        Ok(p) => p,
        Err(reason) => {
            tracing::trace!(target: "propose", strategy = strategy_name, %reason, "proposal not finalized");
            return;
        }
    };
    if let Err(reason) = ctx.factory.place_proposal(proposal) {
        tracing::trace!(target: "propose", strategy = strategy_name, %reason, "proposal rejected");
    }
}

/// The extension candidates inside an endorsement target's past cone: our
/// own chain output in the target's baseline state, plus the own-milestone
/// future cone growing from it.
pub fn extension_choices_in_endorsement_target_past_cone(
    ctx: &TaskContext,
    endorsement_target: &Vid,
) -> Vec<WrappedOutput> {
    let factory = &ctx.factory;
    let Some(baseline) = endorsement_target.baseline_branch() else {
        return Vec::new();
    };
    let Ok(reader) = factory.workflow().dag().state_reader_for_branch(&baseline) else {
        return Vec::new();
    };
    let Some(root_output) = reader.get_chain_output(&factory.chain_id()) else {
        // our chain is unknown to the other sequencer's state
        return Vec::new();
    };
    let root_vid = factory
        .workflow()
        .dag()
        .attach_txid(root_output.id.tx_id());
    root_vid.ensure_output(root_output.id.index(), &root_output.output);
    let root = WrappedOutput::new(root_vid, root_output.id.index());
    factory.add_own_milestone(root.clone());

    factory
        .future_cone_milestones_ordered(&root.vid, ctx.target_ts)
        .into_iter()
        .filter(|choice| !ctx.already_visited(&choice.vid, endorsement_target))
        .collect()
}
