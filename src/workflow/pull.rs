//! Pending pulls: transactions whose bytes are missing from the DAG.
//!
//! An attacher that hits a virtual dependency registers a pull; a background
//! ticker re-asks randomly selected peers until the bytes arrive or the
//! attacher gives up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::constants::PULL_RETRY_PERIOD_MS;
use crate::ledger::TransactionID;
use crate::network::Peering;

/// Batch size of one pull request frame.
const PULL_BATCH: usize = 100;

#[derive(Default)]
pub struct PullList {
    pending: Mutex<HashMap<TransactionID, Instant>>,
}

impl PullList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pull. Returns true when newly added.
    pub fn pull(&self, txid: TransactionID) -> bool {
        self.pending
            .lock()
            .expect("pull list lock")
            .insert(txid, Instant::now())
            .is_none()
    }

    /// Deregister (bytes arrived or the attacher terminated). Returns true
    /// when the txid was pending, which marks an arrival as a pull response.
    pub fn stop(&self, txid: &TransactionID) -> bool {
        self.pending
            .lock()
            .expect("pull list lock")
            .remove(txid)
            .is_some()
    }

    pub fn is_pending(&self, txid: &TransactionID) -> bool {
        self.pending
            .lock()
            .expect("pull list lock")
            .contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("pull list lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<TransactionID> {
        self.pending
            .lock()
            .expect("pull list lock")
            .keys()
            .copied()
            .collect()
    }
}

/// Re-ask a random peer for every pending transaction at a fixed period.
pub async fn run_pull_loop(
    pull_list: Arc<PullList>,
    peers: Arc<dyn Peering>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(PULL_RETRY_PERIOD_MS));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let pending = pull_list.snapshot();
        if pending.is_empty() {
            continue;
        }
        let Some(peer) = peers.random_alive_peer() else {
            continue;
        };
        for batch in pending.chunks(PULL_BATCH) {
            tracing::trace!(target: "pull", peer = %peer, n = batch.len(), "re-asking pulls");
            peers.send_pull_request(&peer, batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LogicalTime;

    fn txid(seed: u8) -> TransactionID {
        TransactionID::new(LogicalTime::must_new(1, 1), [seed; 28], false, false)
    }

    #[test]
    fn pull_and_stop() {
        let list = PullList::new();
        assert!(list.pull(txid(1)));
        assert!(!list.pull(txid(1)));
        assert!(list.is_pending(&txid(1)));
        assert!(list.stop(&txid(1)));
        assert!(!list.stop(&txid(1)));
        assert!(list.is_empty());
    }
}
