//! The `endorse1` strategy: weave chains together by endorsing the best
//! other-sequencer milestone of the slot while extending a compatible own
//! milestone found in its past cone.

use super::proposer::{
    extension_choices_in_endorsement_target_past_cone, ProposeResult, ProposerStrategy,
    TaskContext,
};
use crate::dag::incremental::IncrementalAttacher;
use crate::ledger::LogicalTime;

pub struct Endorse1Proposer;

impl ProposerStrategy for Endorse1Proposer {
    fn name(&self) -> &'static str {
        "endorse1"
    }

    fn applicable(&self, target_ts: LogicalTime) -> bool {
        // endorsing is not applicable when generating branches
        !target_ts.is_slot_boundary()
    }

    fn propose(&self, ctx: &mut TaskContext) -> ProposeResult {
        let own_chain = ctx.factory.chain_id();
        let candidates = ctx
            .factory
            .tippool()
            .pre_select_endorsable_milestones(ctx.target_ts);

        for endorse in candidates {
            if endorse.sequencer_id_if_available() == Some(own_chain) {
                continue;
            }
            let choices = extension_choices_in_endorsement_target_past_cone(ctx, &endorse);
            for extend in choices {
                ctx.store_visited(&extend.vid, &endorse);
                let mut attacher = match IncrementalAttacher::new(
                    format!("endorse1-{}", ctx.target_ts),
                    ctx.factory.attacher_env(),
                    ctx.target_ts,
                    extend,
                ) {
                    Ok(a) => a,
                    Err(err) => {
                        tracing::trace!(target: "propose-endorse1", reason = %err, "can't extend");
                        continue;
                    }
                };
                if let Err(err) = attacher.insert_endorsement(&endorse) {
                    tracing::trace!(
                        target: "propose-endorse1",
                        endorse = %endorse.id().short_string(),
                        reason = %err,
                        "endorsement rejected"
                    );
                    continue;
                }
                if !attacher.completed() {
                    continue;
                }
                ctx.attach_tag_along_inputs(&mut attacher);
                return ProposeResult::Candidate(attacher);
            }
        }
        ProposeResult::NothingNow
    }
}
