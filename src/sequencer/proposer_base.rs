//! The `base` strategy: extend the own latest milestone. Produces branches
//! on slot boundaries and bootstraps the sequencer when no others are
//! around.

use super::proposer::{ProposeResult, ProposerStrategy, TaskContext};
use crate::dag::incremental::IncrementalAttacher;

pub struct BaseProposer;

impl ProposerStrategy for BaseProposer {
    fn name(&self) -> &'static str {
        "base"
    }

    fn propose(&self, ctx: &mut TaskContext) -> ProposeResult {
        let Some(extend) = ctx.factory.own_latest_milestone() else {
            return ProposeResult::ForceExit;
        };
        if !ctx.target_ts.is_slot_boundary() {
            // an ordinary milestone extends the same slot only
            if extend.vid.slot() != ctx.target_ts.slot() {
                tracing::trace!(target: "propose", "base: cross-slot extend, waiting for a branch");
                return ProposeResult::ForceExit;
            }
            if !extend.vid.is_sequencer_milestone() {
                return ProposeResult::ForceExit;
            }
        }

        let mut attacher = match IncrementalAttacher::new(
            format!("base-{}", ctx.target_ts),
            ctx.factory.attacher_env(),
            ctx.target_ts,
            extend,
        ) {
            Ok(a) => a,
            Err(err) => {
                tracing::debug!(target: "propose", reason = %err, "base: can't create attacher");
                return ProposeResult::ForceExit;
            }
        };

        if !ctx.target_ts.is_slot_boundary() {
            // ordinary milestones collect fees; a branch target consumes the
            // stem instead and skips tag-alongs
            ctx.attach_tag_along_inputs(&mut attacher);
        }
        ProposeResult::Candidate(attacher)
    }
}
