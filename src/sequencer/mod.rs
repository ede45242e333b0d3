//! The sequencer: one long-lived chain identity continuously proposing the
//! next milestone and submitting the winner through the workflow.

pub mod factory;
pub mod proposer;
pub mod proposer_base;
pub mod proposer_endorse1;
pub mod tippool;

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio_util::sync::CancellationToken;

use crate::dag::vertex::WrappedOutput;
use crate::ledger::{ChainID, LogicalTime};
use crate::workflow::Workflow;
use factory::{FactoryError, MilestoneFactory};
use tippool::SequencerTipPool;

/// Default number of ticks between two own milestones.
pub const DEFAULT_MILESTONE_PACE_TICKS: u64 = 5;

/// Per-sequencer configuration (the `sequencers.<name>.*` keys).
#[derive(Clone)]
pub struct SequencerConfig {
    pub name: String,
    pub chain_id: ChainID,
    pub controller_key: SigningKey,
    pub max_fee_inputs: usize,
    /// Ticks between consecutive own milestones.
    pub pace_ticks: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    #[error(transparent)]
    Factory(#[from] FactoryError),
}

pub struct Sequencer {
    config: SequencerConfig,
    workflow: Arc<Workflow>,
    factory: Arc<MilestoneFactory>,
    cancel: CancellationToken,
}

impl Sequencer {
    pub fn new(
        workflow: Arc<Workflow>,
        config: SequencerConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, SequencerError> {
        let tippool = SequencerTipPool::new(&workflow, &config.name, config.chain_id);
        let factory = MilestoneFactory::new(
            workflow.clone(),
            tippool,
            &config.name,
            config.chain_id,
            config.controller_key.clone(),
            config.max_fee_inputs,
        )?;
        Ok(Arc::new(Sequencer {
            config,
            workflow,
            factory,
            cancel,
        }))
    }

    pub fn chain_id(&self) -> ChainID {
        self.config.chain_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn factory(&self) -> &Arc<MilestoneFactory> {
        &self.factory
    }

    /// Spawn the milestone loop.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.run().await });
    }

    async fn run(self: Arc<Self>) {
        tracing::info!(seq = %self.config.name, chain = %self.config.chain_id.short_string(), "sequencer started");
        let slot_ms = self.workflow.identity().slot_duration_ms();
        loop {
            if self.cancel.is_cancelled() {
                tracing::info!(seq = %self.config.name, "sequencer stopped");
                return;
            }
            let Some(target) = self.next_target_ts() else {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            };
            tracing::trace!(target: "sequencer", seq = %self.config.name, target = %target, "new target");

            let proposal = tokio::select! {
                _ = self.cancel.cancelled() => return,
                p = self.factory.start_proposing_for(target) => p,
            };
            let Some(proposal) = proposal else {
                continue;
            };

            let submit_timeout = Duration::from_millis(2 * slot_ms);
            match self
                .workflow
                .sequencer_milestone_attach_wait(proposal.tx_bytes.clone(), submit_timeout)
                .await
            {
                Ok(vid) => {
                    // the sequencer output is always at index 0 of our
                    // milestones; register it as the next extend target
                    if let Some(tx) = vid.tx().or_else(|| {
                        // branches are compacted right after attachment
                        crate::transaction::Transaction::from_bytes(proposal.tx_bytes.clone())
                            .ok()
                            .map(Arc::new)
                    }) {
                        if let Some(data) = tx.sequencer_data() {
                            self.factory.add_own_milestone(WrappedOutput::new(
                                vid.clone(),
                                data.sequencer_output_index,
                            ));
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(seq = %self.config.name, error = %err, "milestone submission failed");
                }
            }
        }
    }

    /// The next milestone target: at least one pace after the own latest
    /// milestone and strictly in the real-time future. A target crossing the
    /// slot boundary snaps to tick 0 to produce a branch.
    fn next_target_ts(&self) -> Option<LogicalTime> {
        let identity = self.workflow.identity();
        let latest = self.factory.own_latest_milestone()?;
        let latest_ts = latest.timestamp();

        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?
            .as_millis() as u64;
        let now_lt = identity.logical_time_from_unix_ms(now_ms);

        let mut target = latest_ts.add_ticks(self.config.pace_ticks);
        if target <= now_lt {
            target = now_lt.add_ticks(1);
        }
        if target.slot() > latest_ts.slot() {
            // crossing the boundary: produce the branch first
            target = LogicalTime::must_new(latest_ts.slot() + 1, 0);
            if target <= now_lt {
                // the boundary already passed in real time; branch on the
                // current slot's boundary is gone, catch up on the next one
                target = LogicalTime::must_new(now_lt.slot() + 1, 0);
            }
        }
        Some(target)
    }
}
