//! Incremental attacher: a mutable past cone owned by a proposer.
//!
//! Starts from the chosen extend output (the tip of a sequencer chain) and
//! grows by inserting endorsements and tag-along inputs. Every insertion is
//! transactional: on rejection the cone and all consumer edges inserted by
//! the operation are restored, because proposers try many candidates against
//! one attacher.

use std::sync::Arc;

use ed25519_dalek::SigningKey;

use super::attacher::{AttacherEnv, PastCone};
use super::vertex::{Vid, WrappedOutput};
use super::AttachError;
use crate::ledger::coverage::LedgerCoverage;
use crate::ledger::output::MilestoneData;
use crate::ledger::{ChainID, LogicalTime, OutputID};
use crate::transaction::builder::{
    make_sequencer_transaction, BuildError, MakeSequencerTransactionParams,
};

/// Errors finalizing a proposal into a signed transaction.
#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("output {0} is not available")]
    OutputUnavailable(OutputID),
    #[error(transparent)]
    Build(#[from] BuildError),
}

pub struct IncrementalAttacher {
    cone: PastCone,
    target_ts: LogicalTime,
    extend: WrappedOutput,
    endorsements: Vec<Vid>,
    tag_along: Vec<WrappedOutput>,
    stem: Option<WrappedOutput>,
}

impl IncrementalAttacher {
    /// Seed the cone with the extend output. For a branch target (tick 0)
    /// also consumes the baseline's stem output.
    pub fn new(
        name: impl Into<String>,
        env: Arc<dyn AttacherEnv>,
        target_ts: LogicalTime,
        extend: WrappedOutput,
    ) -> Result<Self, AttachError> {
        let baseline = extend.vid.baseline_branch().ok_or_else(|| {
            AttachError::BaselineSolidificationFailed(format!(
                "baseline of extend target {} is not solid",
                extend.vid.id().short_string()
            ))
        })?;
        let mut cone = PastCone::new(env.clone(), name, None);
        cone.set_baseline(baseline.clone())?;

        let stem = if target_ts.is_slot_boundary() {
            let reader = env
                .dag()
                .state_reader_for_branch(&baseline)
                .map_err(|e| AttachError::BaselineSolidificationFailed(e.to_string()))?;
            let stem_out = reader.stem_output().ok_or_else(|| {
                AttachError::BaselineSolidificationFailed(format!(
                    "no stem output in baseline {}",
                    baseline.id().short_string()
                ))
            })?;
            let stem_vid = env.dag().attach_txid(stem_out.id.tx_id());
            stem_vid.ensure_output(stem_out.id.index(), &stem_out.output);
            let wout = WrappedOutput::new(stem_vid, stem_out.id.index());
            cone.include_consumed_output(&wout)?;
            Some(wout)
        } else {
            None
        };

        cone.include_consumed_output(&extend)?;

        Ok(IncrementalAttacher {
            cone,
            target_ts,
            extend,
            endorsements: Vec::new(),
            tag_along: Vec::new(),
            stem,
        })
    }

    pub fn name(&self) -> &str {
        self.cone.name()
    }

    pub fn target_ts(&self) -> LogicalTime {
        self.target_ts
    }

    pub fn extending(&self) -> &WrappedOutput {
        &self.extend
    }

    pub fn endorsing(&self) -> &[Vid] {
        &self.endorsements
    }

    pub fn baseline(&self) -> Option<&Vid> {
        self.cone.baseline()
    }

    pub fn num_tag_along(&self) -> usize {
        self.tag_along.len()
    }

    /// Attach an endorsement target and its past cone. Rolls back on any
    /// rejection (incompatible baselines, conflicts, unsolid cone).
    pub fn insert_endorsement(&mut self, endorsed: &Vid) -> Result<(), AttachError> {
        let snapshot = self.cone.snapshot();
        match self.cone.include_endorsement(endorsed) {
            Ok(()) => {
                self.endorsements.push(endorsed.clone());
                Ok(())
            }
            Err(err) => {
                self.cone.rollback(snapshot);
                Err(err)
            }
        }
    }

    /// Add a candidate fee input; rolls back on conflict with the cone.
    pub fn insert_tag_along_input(&mut self, wout: &WrappedOutput) -> Result<(), AttachError> {
        let snapshot = self.cone.snapshot();
        match self.cone.include_consumed_output(wout) {
            Ok(()) => {
                self.tag_along.push(wout.clone());
                Ok(())
            }
            Err(err) => {
                self.cone.rollback(snapshot);
                Err(err)
            }
        }
    }

    /// All inserted endorsements and tag-alongs are solid and validated.
    pub fn completed(&self) -> bool {
        self.cone.is_complete()
    }

    /// Coverage of the milestone under construction.
    pub fn ledger_coverage(&self) -> LedgerCoverage {
        self.cone.ledger_coverage(self.target_ts)
    }

    /// Build and sign the milestone transaction.
    pub fn finalize(
        &self,
        chain_id: ChainID,
        seq_name: &str,
        milestone_data: MilestoneData,
        controller_key: &SigningKey,
    ) -> Result<Vec<u8>, FinalizeError> {
        let chain_input = self
            .extend
            .unwrap_output()
            .ok_or(FinalizeError::OutputUnavailable(self.extend.id()))?;
        let stem_input = match &self.stem {
            Some(wout) => Some(
                wout.unwrap_output()
                    .ok_or(FinalizeError::OutputUnavailable(wout.id()))?,
            ),
            None => None,
        };
        let mut additional_inputs = Vec::with_capacity(self.tag_along.len());
        for wout in &self.tag_along {
            additional_inputs.push(
                wout.unwrap_output()
                    .ok_or(FinalizeError::OutputUnavailable(wout.id()))?,
            );
        }
        let endorsements = self.endorsements.iter().map(|v| v.id()).collect();
        let bytes = make_sequencer_transaction(
            MakeSequencerTransactionParams {
                seq_name: seq_name.to_string(),
                chain_input,
                chain_id,
                stem_input,
                timestamp: self.target_ts,
                additional_inputs,
                endorsements,
                inflation: 0,
                milestone_data,
            },
            controller_key,
        )?;
        Ok(bytes)
    }
}
