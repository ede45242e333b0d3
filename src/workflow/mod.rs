//! The ingress pipeline: accept transaction bytes from peers, the API or a
//! local sequencer; pre-validate; delay future-dated transactions; attach;
//! gossip.
//!
//! The workflow is also the attachers' environment: it owns the DAG handle,
//! the pull list, the constraint evaluator seam and the event listeners the
//! sequencer tip pools subscribe to.

pub mod pull;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::constants::MAX_SLOTS_IN_THE_FUTURE;
use crate::constants::TICKS_PER_SLOT;
use crate::dag::attacher::AttacherEnv;
use crate::dag::milestone::{attach_transaction, AttachCallback, AttachOptions};
use crate::dag::vertex::{Vid, WrappedOutput};
use crate::dag::Dag;
use crate::ledger::identity::LedgerIdentity;
use crate::ledger::output::AccountID;
use crate::ledger::TransactionID;
use crate::network::{PeerEvent, PeerId, Peering};
use crate::state::txstore::TxBytesStore;
use crate::state::StateStore;
use crate::transaction::evaluate::{ConstraintEvaluator, StandardEvaluator};
use crate::transaction::{Transaction, TxError};
use pull::PullList;

/// Where transaction bytes came from.
#[derive(Clone, Debug)]
pub enum TxSource {
    Peer(PeerId),
    Api,
    Sequencer,
}

/// Per-ingress options.
#[derive(Default)]
pub struct TxIngress {
    pub source: Option<TxSource>,
    pub callback: Option<AttachCallback>,
}

impl TxIngress {
    pub fn from_peer(peer: PeerId) -> Self {
        TxIngress {
            source: Some(TxSource::Peer(peer)),
            callback: None,
        }
    }

    pub fn from_api() -> Self {
        TxIngress {
            source: Some(TxSource::Api),
            callback: None,
        }
    }

    pub fn with_callback(mut self, cb: AttachCallback) -> Self {
        self.callback = Some(cb);
        self
    }
}

/// Ingress rejections. No DAG entry is created for these.
#[derive(Debug, thiserror::Error)]
pub enum TxInError {
    #[error(transparent)]
    Malformed(#[from] TxError),
    #[error("timestamp out of bounds")]
    TimestampOutOfBounds,
}

type AccountCallback = Box<dyn Fn(&WrappedOutput) + Send + Sync>;
type SequencerCallback = Box<dyn Fn(&Vid) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    account: Vec<(AccountID, AccountCallback)>,
    sequencer: Vec<SequencerCallback>,
}

pub struct Workflow {
    dag: Arc<Dag>,
    tx_store: Arc<dyn TxBytesStore>,
    peers: Arc<dyn Peering>,
    evaluator: Box<dyn ConstraintEvaluator>,
    pull_list: Arc<PullList>,
    listeners: Mutex<Listeners>,
    cancel: CancellationToken,
}

impl Workflow {
    pub fn new(
        dag: Arc<Dag>,
        tx_store: Arc<dyn TxBytesStore>,
        peers: Arc<dyn Peering>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Workflow {
            dag,
            tx_store,
            peers,
            evaluator: Box::new(StandardEvaluator),
            pull_list: Arc::new(PullList::new()),
            listeners: Mutex::new(Listeners::default()),
            cancel,
        })
    }

    /// Start the peer-event consumer and the pull re-ask loop.
    pub fn start(self: &Arc<Self>, events_rx: mpsc::Receiver<PeerEvent>) {
        let this = self.clone();
        tokio::spawn(async move { this.run_event_loop(events_rx).await });
        let pull_list = self.pull_list.clone();
        let peers = self.peers.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { pull::run_pull_loop(pull_list, peers, cancel).await });
    }

    pub fn dag(&self) -> &Arc<Dag> {
        &self.dag
    }

    pub fn identity(&self) -> &LedgerIdentity {
        self.dag.state_store().identity()
    }

    pub fn pull_list(&self) -> &Arc<PullList> {
        &self.pull_list
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn now_unix_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Admit transaction bytes: parse, pre-validate, gossip, delay, attach.
    pub fn tx_in(
        self: &Arc<Self>,
        tx_bytes: Vec<u8>,
        ingress: TxIngress,
    ) -> Result<TransactionID, TxInError> {
        let tx = Transaction::from_bytes(tx_bytes)?;
        let txid = tx.id();
        tracing::trace!(target: "txinput", txid = %txid.short_string(), "in");

        // bytes arriving for a pending pull stop the pull and are not
        // re-gossiped
        let is_response_to_pull = self.pull_list.stop(&txid);

        // the upper timestamp bound holds for peer and API sources only
        let enforce_bounds = matches!(
            ingress.source,
            Some(TxSource::Peer(_)) | Some(TxSource::Api)
        );
        if enforce_bounds {
            let now = self
                .identity()
                .logical_time_from_unix_ms(Self::now_unix_ms());
            let upper = now.add_ticks(MAX_SLOTS_IN_THE_FUTURE as u64 * TICKS_PER_SLOT as u64);
            if tx.validate_timestamp_upper_bound(upper).is_err() {
                return Err(TxInError::TimestampOutOfBounds);
            }
        }

        tx.validate_main()?;

        if !is_response_to_pull {
            // gossip always, even before any delay: peer clocks differ, let
            // them handle delays themselves
            let except = match &ingress.source {
                Some(TxSource::Peer(peer)) => Some(peer.clone()),
                _ => None,
            };
            self.peers.gossip_tx_bytes(tx.bytes(), except.as_ref());
        }

        let opts = AttachOptions {
            callback: ingress.callback,
        };
        let env: Arc<dyn AttacherEnv> = self.clone();
        let tx = Arc::new(tx);

        let tx_time_ms = self.identity().unix_ms_from_logical_time(tx.timestamp());
        let now_ms = Self::now_unix_ms();
        if tx_time_ms <= now_ms {
            attach_transaction(&env, tx, self.cancel.child_token(), opts);
        } else {
            // future-dated: schedule attachment for its wall time
            let delay = Duration::from_millis(tx_time_ms - now_ms);
            tracing::trace!(target: "txinput", txid = %txid.short_string(), ?delay, "delayed");
            let cancel = self.cancel.child_token();
            let attach_cancel = cancel.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        attach_transaction(&env, tx, attach_cancel, opts);
                    }
                }
            });
        }
        Ok(txid)
    }

    /// Submit a sequencer milestone and wait for its attachment to finish.
    pub async fn sequencer_milestone_attach_wait(
        self: &Arc<Self>,
        tx_bytes: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vid, String> {
        let (done_tx, done_rx) = oneshot::channel();
        let callback: AttachCallback = Box::new(move |vid, result| {
            let _ = done_tx.send((vid, result));
        });
        self.tx_in(
            tx_bytes,
            TxIngress {
                source: Some(TxSource::Sequencer),
                callback: Some(callback),
            },
        )
        .map_err(|e| e.to_string())?;

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok((vid, Ok(())))) => Ok(vid),
            Ok(Ok((_, Err(err)))) => Err(err.to_string()),
            Ok(Err(_)) => Err("attacher dropped the callback".into()),
            Err(_) => Err(format!("timeout {:?}", timeout)),
        }
    }

    // ── listeners ──

    /// Subscribe to validated outputs indexed under `account`.
    pub fn listen_to_account(
        &self,
        account: AccountID,
        cb: impl Fn(&WrappedOutput) + Send + Sync + 'static,
    ) {
        self.listeners
            .lock()
            .expect("listeners lock")
            .account
            .push((account, Box::new(cb)));
    }

    /// Subscribe to every sequencer milestone that turns Good.
    pub fn listen_to_sequencers(&self, cb: impl Fn(&Vid) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("listeners lock")
            .sequencer
            .push(Box::new(cb));
    }

    fn respond_to_pull(&self, from: PeerId, txids: Vec<TransactionID>) {
        for txid in txids {
            let bytes = self
                .tx_store
                .get_tx_bytes(&txid)
                .or_else(|| self.dag.get_vertex(&txid).and_then(|vid| {
                    vid.tx().map(|tx| tx.bytes().to_vec())
                }));
            match bytes {
                Some(bytes) => {
                    tracing::trace!(target: "pull", peer = %from, txid = %txid.short_string(), "pull response");
                    self.peers.send_tx_bytes_to(&from, &bytes);
                }
                None => {
                    tracing::trace!(target: "pull", peer = %from, txid = %txid.short_string(), "pull miss");
                }
            }
        }
    }

    async fn run_event_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<PeerEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                }
            };
            match event {
                PeerEvent::TxBytes { from, bytes } => {
                    if let Err(err) = self.tx_in(bytes, TxIngress::from_peer(from)) {
                        tracing::debug!(error = %err, "peer transaction rejected");
                    }
                }
                PeerEvent::PullRequest { from, txids } => {
                    self.respond_to_pull(from, txids);
                }
            }
        }
    }
}

impl AttacherEnv for Workflow {
    fn dag(&self) -> &Dag {
        &self.dag
    }

    fn state_store(&self) -> &Arc<StateStore> {
        self.dag.state_store()
    }

    fn evaluator(&self) -> &dyn ConstraintEvaluator {
        self.evaluator.as_ref()
    }

    fn pull(&self, txid: TransactionID) {
        if self.pull_list.pull(txid) {
            if let Some(peer) = self.peers.random_alive_peer() {
                self.peers.send_pull_request(&peer, &[txid]);
            }
        }
    }

    fn stop_pull(&self, txid: &TransactionID) {
        self.pull_list.stop(txid);
    }

    fn persist_tx_bytes(&self, tx: &Transaction) {
        self.tx_store.save_tx_bytes(&tx.id(), tx.bytes());
    }

    fn on_tx_validated(&self, vid: &Vid) {
        let Some(tx) = vid.tx() else { return };
        let listeners = self.listeners.lock().expect("listeners lock");
        if listeners.account.is_empty() {
            return;
        }
        for (idx, out) in tx.produced_outputs().iter().enumerate() {
            let account = out.lock.account();
            for (listened, cb) in &listeners.account {
                if *listened == account {
                    cb(&WrappedOutput::new(vid.clone(), idx as u8));
                }
            }
        }
    }

    fn on_milestone_good(&self, vid: &Vid) {
        let listeners = self.listeners.lock().expect("listeners lock");
        for cb in &listeners.sequencer {
            cb(vid);
        }
    }
}
