//! Shared fixtures: an in-process ledger with a workflow over null peering,
//! plus builders for the transaction shapes the scenarios need.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use skein::dag::vertex::Vid;
use skein::dag::Dag;
use skein::ledger::identity::{
    bootstrap_sequencer_id, genesis_output, genesis_stem_output, genesis_tx_id, LedgerIdentity,
};
use skein::ledger::output::{
    ChainConstraint, Constraint, Lock, MilestoneData, Output, OutputWithID,
};
use skein::ledger::{ChainID, LogicalTime};
use skein::network::{NullPeering, PeerEvent, Peering};
use skein::state::txstore::DummyTxBytesStore;
use skein::state::StateStore;
use skein::transaction::builder::{
    make_sequencer_transaction, MakeSequencerTransactionParams, TransactionBuilder,
};
use skein::transaction::Transaction;
use skein::workflow::Workflow;

/// Fast ledger for tests: 10 ms ticks, one-second slots.
pub const TEST_TICK_MS: u64 = 10;

pub struct TestLedger {
    pub workflow: Arc<Workflow>,
    pub key: SigningKey,
    pub cancel: CancellationToken,
    _dir: tempfile::TempDir,
    _peer_events: mpsc::Sender<PeerEvent>,
}

pub fn controller_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

pub fn controller_address() -> [u8; 32] {
    skein::ledger::output::address_from_public_key(&controller_key().verifying_key().to_bytes())
}

/// Start a ledger whose genesis lies `slots_in_past` slots behind real time,
/// so timestamps up to that slot attach without delay.
pub async fn start_ledger(supply: u64, slots_in_past: u64) -> TestLedger {
    start_ledger_with_peering(supply, slots_in_past, Arc::new(NullPeering)).await
}

pub async fn start_ledger_with_peering(
    supply: u64,
    slots_in_past: u64,
    peering: Arc<dyn Peering>,
) -> TestLedger {
    let key = controller_key();
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    let slot_ms = TEST_TICK_MS * 100;
    let mut identity = LedgerIdentity::new(
        "test ledger".into(),
        now_ms.saturating_sub(slots_in_past * slot_ms),
        supply,
        key.verifying_key().to_bytes(),
    );
    identity.tick_duration_ms = TEST_TICK_MS;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::init(dir.path(), identity).unwrap());
    let dag = Arc::new(Dag::new(store));
    // warm the genesis branch
    dag.attach_txid(genesis_tx_id());

    let cancel = CancellationToken::new();
    let workflow = Workflow::new(
        dag,
        Arc::new(DummyTxBytesStore::new()),
        peering,
        cancel.clone(),
    );
    let (peer_tx, peer_rx) = mpsc::channel(64);
    workflow.start(peer_rx);

    TestLedger {
        workflow,
        key,
        cancel,
        _dir: dir,
        _peer_events: peer_tx,
    }
}

/// Submit bytes and wait for the attachment verdict.
pub async fn submit_and_wait(ledger: &TestLedger, bytes: Vec<u8>) -> Result<Vid, String> {
    ledger
        .workflow
        .sequencer_milestone_attach_wait(bytes, Duration::from_secs(10))
        .await
}

pub fn genesis_chain_output(ledger: &TestLedger) -> OutputWithID {
    genesis_output(ledger.workflow.identity())
}

pub fn genesis_stem(ledger: &TestLedger) -> OutputWithID {
    genesis_stem_output(ledger.workflow.identity())
}

/// A non-sequencer transaction consuming `chain_in`, continuing the chain
/// with zero amount and paying the rest out to `recipients`.
pub fn distribution_tx(
    ledger: &TestLedger,
    chain_in: &OutputWithID,
    chain_id: ChainID,
    ts: LogicalTime,
    recipients: &[([u8; 32], u64)],
) -> Vec<u8> {
    let total: u64 = recipients.iter().map(|(_, amount)| amount).sum();
    let remainder_on_chain = chain_in.output.amount - total;
    let mut b = TransactionBuilder::new(ts);
    let pred_idx = b.put_input(chain_in.id, chain_in.output.clone());
    b.put_output(
        Output::new(remainder_on_chain, Lock::Ed25519(controller_address())).with_constraint(
            Constraint::Chain(ChainConstraint {
                chain_id,
                predecessor_input_index: pred_idx,
            }),
        ),
    );
    for (address, amount) in recipients {
        b.put_output(Output::new(*amount, Lock::Ed25519(*address)));
    }
    b.build_and_sign(&ledger.key)
}

/// A plain transfer of one input to one target (plus remainder).
pub fn transfer_tx(
    ledger: &TestLedger,
    input: &OutputWithID,
    target: [u8; 32],
    amount: u64,
    ts: LogicalTime,
) -> Vec<u8> {
    let mut b = TransactionBuilder::new(ts);
    b.put_input(input.id, input.output.clone());
    b.put_output(Output::new(amount, Lock::Ed25519(target)));
    let remainder = input.output.amount - amount;
    if remainder > 0 {
        b.put_output(Output::new(remainder, Lock::Ed25519(controller_address())));
    }
    b.build_and_sign(&ledger.key)
}

/// A sequencer milestone (branch when `stem_in` is given) extending
/// `chain_in`.
pub fn milestone_tx(
    ledger: &TestLedger,
    chain_in: &OutputWithID,
    chain_id: ChainID,
    stem_in: Option<&OutputWithID>,
    ts: LogicalTime,
    endorsements: Vec<skein::ledger::TransactionID>,
    heights: (u32, u32),
) -> Vec<u8> {
    make_sequencer_transaction(
        MakeSequencerTransactionParams {
            seq_name: "boot".into(),
            chain_input: chain_in.clone(),
            chain_id,
            stem_input: stem_in.cloned(),
            timestamp: ts,
            additional_inputs: vec![],
            endorsements,
            inflation: 0,
            milestone_data: MilestoneData {
                name: "boot".into(),
                chain_height: heights.0,
                branch_height: heights.1,
            },
        },
        &ledger.key,
    )
    .unwrap()
}

/// Parse produced output `idx` of canonical bytes.
pub fn output_of(bytes: &[u8], idx: u8) -> OutputWithID {
    let tx = Transaction::from_bytes(bytes.to_vec()).unwrap();
    tx.produced_output_with_id_at(idx).unwrap()
}

/// Build the bootstrap branch chain `slots` deep: one branch per slot, no
/// payload. Returns the latest chain output and stem.
pub async fn grow_branches(
    ledger: &TestLedger,
    mut chain_out: OutputWithID,
    mut stem_out: OutputWithID,
    from_slot: u32,
    slots: u32,
) -> (OutputWithID, OutputWithID) {
    for slot in from_slot..from_slot + slots {
        let bytes = milestone_tx(
            ledger,
            &chain_out,
            bootstrap_sequencer_id(),
            Some(&stem_out),
            LogicalTime::must_new(slot, 0),
            vec![],
            (slot, slot),
        );
        let vid = submit_and_wait(ledger, bytes.clone()).await.unwrap();
        assert!(vid.is_branch());
        chain_out = output_of(&bytes, 0);
        stem_out = output_of(&bytes, 1);
    }
    (chain_out, stem_out)
}

