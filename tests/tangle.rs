//! Tangle scenarios: genesis distribution, double spends, parasitic chains,
//! ingress idempotence and gossip exclusion.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use skein::dag::vertex::TxStatus;
use skein::ledger::identity::bootstrap_sequencer_id;
use skein::ledger::output::AccountID;
use skein::ledger::{LogicalTime, TransactionID};
use skein::network::{PeerId, Peering};
use skein::transaction::Transaction;
use skein::workflow::TxIngress;

#[tokio::test(flavor = "multi_thread")]
async fn genesis_and_distribution() {
    let ledger = start_ledger(3_000_000, 3).await;
    let addr_a = [0xaau8; 32];
    let addr_b = [0xbbu8; 32];

    // split the whole supply: 1M to A, 2M to B, chain continues with 0
    let distrib = distribution_tx(
        &ledger,
        &genesis_chain_output(&ledger),
        bootstrap_sequencer_id(),
        LogicalTime::must_new(0, 10),
        &[(addr_a, 1_000_000), (addr_b, 2_000_000)],
    );
    let distrib_vid = submit_and_wait(&ledger, distrib.clone()).await.unwrap();
    assert_eq!(distrib_vid.status(), TxStatus::Good);

    // the branch closing slot 0 commits the distribution
    let branch = milestone_tx(
        &ledger,
        &output_of(&distrib, 0),
        bootstrap_sequencer_id(),
        Some(&genesis_stem(&ledger)),
        LogicalTime::must_new(1, 0),
        vec![],
        (1, 1),
    );
    let branch_vid = submit_and_wait(&ledger, branch).await.unwrap();
    assert_eq!(branch_vid.status(), TxStatus::Good);
    assert!(branch_vid.is_branch());

    let (reader, heaviest) = ledger
        .workflow
        .dag()
        .heaviest_state_for_latest_slot()
        .unwrap();
    assert_eq!(heaviest.id(), branch_vid.id());
    assert_eq!(reader.balance_of(&AccountID::Address(addr_a)), 1_000_000);
    assert_eq!(reader.balance_of(&AccountID::Address(addr_b)), 2_000_000);
    let chain_out = reader.get_chain_output(&bootstrap_sequencer_id()).unwrap();
    assert_eq!(chain_out.output.amount, 0);
    let stem = reader.stem_output().unwrap();
    assert_eq!(stem.output.stem_lock().unwrap().supply, 3_000_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn double_spend_in_one_past_cone() {
    let ledger = start_ledger(10_000, 3).await;

    // put a plain 10,000 output into the committed state
    let distrib = distribution_tx(
        &ledger,
        &genesis_chain_output(&ledger),
        bootstrap_sequencer_id(),
        LogicalTime::must_new(0, 10),
        &[(controller_address(), 10_000)],
    );
    submit_and_wait(&ledger, distrib.clone()).await.unwrap();
    let spendable = output_of(&distrib, 1);

    let branch = milestone_tx(
        &ledger,
        &output_of(&distrib, 0),
        bootstrap_sequencer_id(),
        Some(&genesis_stem(&ledger)),
        LogicalTime::must_new(1, 0),
        vec![],
        (1, 1),
    );
    submit_and_wait(&ledger, branch).await.unwrap();

    // five transfers all consuming the same output: individually fine,
    // their past cones are independent
    let mut children = Vec::new();
    for i in 0u64..5 {
        let bytes = transfer_tx(
            &ledger,
            &spendable,
            controller_address(),
            100 + i,
            LogicalTime::must_new(1, 20),
        );
        let vid = submit_and_wait(&ledger, bytes.clone()).await.unwrap();
        assert_eq!(vid.status(), TxStatus::Good);
        children.push(output_of(&bytes, 0));
    }

    // a sixth transaction consuming all five children pulls two consumers
    // of the same output into one past cone
    let mut b = skein::transaction::builder::TransactionBuilder::new(LogicalTime::must_new(1, 35));
    let mut total = 0;
    for child in &children {
        total += child.output.amount;
        b.put_input(child.id, child.output.clone());
    }
    b.put_output(skein::ledger::output::Output::new(
        total,
        skein::ledger::output::Lock::Ed25519(controller_address()),
    ));
    let sixth = b.build_and_sign(&ledger.key);

    let err = submit_and_wait(&ledger, sixth).await.unwrap_err();
    assert!(err.contains("double spend"), "unexpected reason: {}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn parasitic_chain_rejected() {
    let ledger = start_ledger(3_000_000, 9).await;

    // a plain output in the committed state, and an uncommitted spender of it
    let distrib = distribution_tx(
        &ledger,
        &genesis_chain_output(&ledger),
        bootstrap_sequencer_id(),
        LogicalTime::must_new(0, 10),
        &[(controller_address(), 500_000)],
    );
    submit_and_wait(&ledger, distrib.clone()).await.unwrap();
    let spendable = output_of(&distrib, 1);

    // branches for slots 1..=7
    let b1 = milestone_tx(
        &ledger,
        &output_of(&distrib, 0),
        bootstrap_sequencer_id(),
        Some(&genesis_stem(&ledger)),
        LogicalTime::must_new(1, 0),
        vec![],
        (1, 1),
    );
    submit_and_wait(&ledger, b1.clone()).await.unwrap();
    grow_branches(
        &ledger,
        output_of(&b1, 0),
        output_of(&b1, 1),
        2,
        6,
    )
    .await;

    // an old transfer that never made it into any branch
    let old = transfer_tx(
        &ledger,
        &spendable,
        controller_address(),
        500_000,
        LogicalTime::must_new(1, 20),
    );
    let old_vid = submit_and_wait(&ledger, old.clone()).await.unwrap();
    assert_eq!(old_vid.status(), TxStatus::Good);
    let old_out = output_of(&old, 0);

    // consuming its output at slot 7 forces lookback beyond the horizon
    let young = transfer_tx(
        &ledger,
        &old_out,
        controller_address(),
        500_000,
        LogicalTime::must_new(7, 50),
    );
    let err = submit_and_wait(&ledger, young).await.unwrap_err();
    assert!(err.contains("parasitic"), "unexpected reason: {}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn idempotent_ingress() {
    let ledger = start_ledger(3_000_000, 3).await;
    let distrib = distribution_tx(
        &ledger,
        &genesis_chain_output(&ledger),
        bootstrap_sequencer_id(),
        LogicalTime::must_new(0, 10),
        &[([1u8; 32], 1_000)],
    );
    let vid1 = submit_and_wait(&ledger, distrib.clone()).await.unwrap();
    let vertices_after_first = ledger.workflow.dag().num_vertices();

    // the second submission of the same bytes creates nothing new
    let txid2 = ledger
        .workflow
        .tx_in(distrib.clone(), TxIngress::from_api())
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(vid1.id(), txid2);
    assert_eq!(ledger.workflow.dag().num_vertices(), vertices_after_first);
    assert_eq!(vid1.status(), TxStatus::Good);
}

/// Peering stub recording gossip destinations.
#[derive(Default)]
struct RecordingPeering {
    gossiped: Mutex<Vec<(usize, Option<PeerId>)>>,
}

impl Peering for RecordingPeering {
    fn gossip_tx_bytes(&self, bytes: &[u8], except: Option<&PeerId>) {
        self.gossiped
            .lock()
            .unwrap()
            .push((bytes.len(), except.cloned()));
    }
    fn send_tx_bytes_to(&self, _peer: &PeerId, _bytes: &[u8]) {}
    fn send_pull_request(&self, _peer: &PeerId, _txids: &[TransactionID]) {}
    fn random_alive_peer(&self) -> Option<PeerId> {
        None
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn gossip_excludes_the_source_peer() {
    let peering = Arc::new(RecordingPeering::default());
    let ledger = start_ledger_with_peering(3_000_000, 3, peering.clone()).await;

    let distrib = distribution_tx(
        &ledger,
        &genesis_chain_output(&ledger),
        bootstrap_sequencer_id(),
        LogicalTime::must_new(0, 10),
        &[([1u8; 32], 1_000)],
    );
    ledger
        .workflow
        .tx_in(distrib.clone(), TxIngress::from_peer("peer-1".to_string()))
        .unwrap();

    let gossiped = peering.gossiped.lock().unwrap();
    assert_eq!(gossiped.len(), 1);
    assert_eq!(gossiped[0].1.as_deref(), Some("peer-1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_bytes_never_enter_the_dag() {
    let ledger = start_ledger(1_000, 3).await;
    let before = ledger.workflow.dag().num_vertices();
    let err = ledger
        .workflow
        .tx_in(vec![0u8; 16], TxIngress::from_api());
    assert!(err.is_err());
    assert_eq!(ledger.workflow.dag().num_vertices(), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn heaviest_branch_is_stable_across_queries() {
    let ledger = start_ledger(1_000, 3).await;
    let a = ledger
        .workflow
        .dag()
        .heaviest_branch_of_latest_slot()
        .unwrap();
    let b = ledger
        .workflow
        .dag()
        .heaviest_branch_of_latest_slot()
        .unwrap();
    assert_eq!(a.id(), b.id());
}

#[tokio::test(flavor = "multi_thread")]
async fn conservation_is_parsed_from_outputs() {
    let ledger = start_ledger(3_000_000, 3).await;
    let distrib = distribution_tx(
        &ledger,
        &genesis_chain_output(&ledger),
        bootstrap_sequencer_id(),
        LogicalTime::must_new(0, 10),
        &[([1u8; 32], 1_000_000), ([2u8; 32], 2_000_000)],
    );
    let tx = Transaction::from_bytes(distrib).unwrap();
    assert_eq!(
        tx.total_amount(),
        tx.produced_outputs().iter().map(|o| o.amount).sum::<u64>()
    );
}
