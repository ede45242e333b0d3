//! Node orchestrator: opens the stores, wires the DAG, workflow, peering,
//! sequencers and the API server, and tears everything down in order.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, NodeConfig};
use crate::constants::PRUNE_KEEP_SLOTS;
use crate::dag::Dag;
use crate::network::peering::Peers;
use crate::sequencer::{Sequencer, SequencerError};
use crate::state::txstore::{DummyTxBytesStore, SledTxBytesStore, TxBytesStore};
use crate::state::{StateError, StateStore};
use crate::workflow::Workflow;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error("tx store error: {0}")]
    TxStore(#[from] sled::Error),
    #[error("API server error: {0}")]
    Api(#[from] std::io::Error),
}

/// A running node and its subsystems.
pub struct Node {
    pub workflow: Arc<Workflow>,
    pub sequencers: Vec<Arc<Sequencer>>,
    cancel: CancellationToken,
}

impl Node {
    /// Open the databases and start every subsystem.
    pub async fn start(
        config: &NodeConfig,
        data_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<Node, NodeError> {
        let state_store = Arc::new(StateStore::open(&config.multi_state_db_path(data_dir))?);
        tracing::info!(
            identity = %state_store.identity().description,
            supply = state_store.identity().initial_supply,
            "multi-state database opened"
        );

        let tx_store: Arc<dyn TxBytesStore> = match config.tx_store.store_type.as_str() {
            "dummy" => {
                tracing::info!("transaction store is 'dummy'");
                Arc::new(DummyTxBytesStore::new())
            }
            _ => Arc::new(SledTxBytesStore::open(&config.tx_store_path(data_dir))?),
        };

        let dag = Arc::new(Dag::new(state_store));
        // warm the branch cache with everything committed so far
        for (branch, _) in dag.state_store().all_root_records()? {
            dag.attach_txid(branch);
        }

        let (peers, peer_events) = Peers::new(config.peers_config()?, cancel.child_token());
        peers.run();

        let workflow = Workflow::new(dag, tx_store, peers, cancel.child_token());
        workflow.start(peer_events);

        let mut sequencers = Vec::new();
        for seq_config in config.sequencer_configs()? {
            let name = seq_config.name.clone();
            match Sequencer::new(workflow.clone(), seq_config, cancel.child_token()) {
                Ok(seq) => {
                    seq.start();
                    tracing::info!(seq = %name, chain = %seq.chain_id().short_string(), "sequencer launched");
                    sequencers.push(seq);
                }
                Err(err) => {
                    tracing::error!(seq = %name, error = %err, "can't start sequencer");
                }
            }
        }

        // the API server
        {
            let workflow = workflow.clone();
            let port = config.api.server.port;
            let api_cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(err) = crate::rpc::serve(port, workflow, api_cancel).await {
                    tracing::error!(error = %err, "API server failed");
                }
            });
        }

        // the pruner: tombstone vertices behind the retention window
        {
            let dag = workflow.dag().clone();
            let slot_ms = workflow.identity().slot_duration_ms();
            let prune_cancel = cancel.child_token();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(slot_ms));
                loop {
                    tokio::select! {
                        _ = prune_cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    let pruned = dag.prune(PRUNE_KEEP_SLOTS);
                    if pruned > 0 {
                        tracing::debug!(pruned, "pruned vertices behind the retention window");
                    }
                }
            });
        }

        tracing::info!("node started");
        Ok(Node {
            workflow,
            sequencers,
            cancel,
        })
    }

    /// Signal every subsystem to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Block until an interrupt, then shut down.
    pub async fn run_until_interrupted(&self) {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("interrupt received, shutting down");
        self.stop();
        // give the workers a moment to observe cancellation
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
