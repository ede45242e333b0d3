//! Sequencer scenarios: milestone chains, cross-endorsement, pulled
//! dependencies, and a real-time sequencer smoke run.

mod common;

use std::time::Duration;

use common::*;
use skein::dag::vertex::TxStatus;
use skein::ledger::identity::bootstrap_sequencer_id;
use skein::ledger::output::{ChainConstraint, Constraint, Lock, Output};
use skein::ledger::{ChainID, LogicalTime};
use skein::sequencer::{Sequencer, SequencerConfig};
use skein::transaction::builder::TransactionBuilder;
use skein::transaction::Transaction;

#[tokio::test(flavor = "multi_thread")]
async fn milestone_chain_with_branches() {
    let ledger = start_ledger(3_000_000, 4).await;
    let chain_id = bootstrap_sequencer_id();

    // five milestones; slot boundaries produce branches
    let steps = [
        (LogicalTime::must_new(1, 0), true),
        (LogicalTime::must_new(1, 10), false),
        (LogicalTime::must_new(1, 20), false),
        (LogicalTime::must_new(2, 0), true),
        (LogicalTime::must_new(2, 10), false),
    ];

    let mut chain_out = genesis_chain_output(&ledger);
    let mut stem_out = genesis_stem(&ledger);
    let mut vids = Vec::new();
    for (i, (ts, is_branch)) in steps.iter().enumerate() {
        let bytes = milestone_tx(
            &ledger,
            &chain_out,
            chain_id,
            is_branch.then_some(&stem_out),
            *ts,
            vec![],
            (i as u32 + 1, 0),
        );
        let vid = submit_and_wait(&ledger, bytes.clone()).await.unwrap();
        assert_eq!(vid.status(), TxStatus::Good);
        assert_eq!(vid.is_branch(), *is_branch);
        chain_out = output_of(&bytes, 0);
        if *is_branch {
            stem_out = output_of(&bytes, 1);
        }
        vids.push(vid);
    }

    assert!(vids.iter().all(|v| v.status() == TxStatus::Good));
    let dag = ledger.workflow.dag();
    assert_eq!(dag.latest_branch_slot(), 2);
    let (reader, heaviest) = dag.heaviest_state_for_latest_slot().unwrap();
    assert_eq!(heaviest.id(), vids[3].id());
    // the whole supply sits on the sequencer chain; every branch covers it
    assert!(reader.coverage().sum() > 0);
    assert_eq!(
        reader.get_chain_output(&chain_id).unwrap().output.amount,
        3_000_000
    );
}

/// Create a second sequencer chain: the setup transaction splits the supply
/// and plants a chain-origin sequencer output, committed by the next branch.
async fn setup_second_chain(
    ledger: &TestLedger,
) -> (skein::ledger::output::OutputWithID, ChainID, Vec<u8>) {
    let genesis_out = genesis_chain_output(ledger);
    let mut b = TransactionBuilder::new(LogicalTime::must_new(0, 10));
    let pred_idx = b.put_input(genesis_out.id, genesis_out.output.clone());
    b.put_output(
        Output::new(2_000_000, Lock::Ed25519(controller_address()))
            .with_constraint(Constraint::Chain(ChainConstraint {
                chain_id: bootstrap_sequencer_id(),
                predecessor_input_index: pred_idx,
            }))
            .with_constraint(Constraint::Sequencer {
                amount_on_chain: 2_000_000,
            }),
    );
    b.put_output(
        Output::new(1_000_000, Lock::Ed25519(controller_address()))
            .with_constraint(Constraint::Chain(ChainConstraint::origin()))
            .with_constraint(Constraint::Sequencer {
                amount_on_chain: 1_000_000,
            }),
    );
    let setup = b.build_and_sign(&ledger.key);
    let tx = Transaction::from_bytes(setup.clone()).unwrap();
    let origin = tx.produced_output_with_id_at(1).unwrap();
    let chain_b = ChainID::origin(&origin.id);
    submit_and_wait(ledger, setup.clone()).await.unwrap();
    (origin, chain_b, setup)
}

#[tokio::test(flavor = "multi_thread")]
async fn cross_endorsement_between_two_sequencers() {
    let ledger = start_ledger(3_000_000, 4).await;
    let chain_a = bootstrap_sequencer_id();
    let (origin_b, chain_b, setup) = setup_second_chain(&ledger).await;

    // branches close slots 1 and 2 on sequencer A's chain
    let b1 = milestone_tx(
        &ledger,
        &output_of(&setup, 0),
        chain_a,
        Some(&genesis_stem(&ledger)),
        LogicalTime::must_new(1, 0),
        vec![],
        (1, 1),
    );
    submit_and_wait(&ledger, b1.clone()).await.unwrap();
    let b2 = milestone_tx(
        &ledger,
        &output_of(&b1, 0),
        chain_a,
        Some(&output_of(&b1, 1)),
        LogicalTime::must_new(2, 0),
        vec![],
        (2, 2),
    );
    submit_and_wait(&ledger, b2.clone()).await.unwrap();

    // A's ordinary milestone in slot 2
    let m_a = milestone_tx(
        &ledger,
        &output_of(&b2, 0),
        chain_a,
        None,
        LogicalTime::must_new(2, 10),
        vec![],
        (3, 2),
    );
    let m_a_vid = submit_and_wait(&ledger, m_a.clone()).await.unwrap();
    assert_eq!(m_a_vid.status(), TxStatus::Good);

    // B's first milestone extends its origin (cross-slot) and endorses A's
    // milestone, which also provides B's baseline
    let m_b = milestone_tx(
        &ledger,
        &origin_b,
        chain_b,
        None,
        LogicalTime::must_new(2, 20),
        vec![m_a_vid.id()],
        (1, 0),
    );
    let m_b_vid = submit_and_wait(&ledger, m_b).await.unwrap();
    assert_eq!(m_b_vid.status(), TxStatus::Good);

    // B saw everything A covered plus its own rooted origin
    let cov_a = m_a_vid.coverage().unwrap().sum();
    let cov_b = m_b_vid.coverage().unwrap().sum();
    assert!(cov_b >= cov_a, "coverage of B ({}) < A ({})", cov_b, cov_a);
}

#[tokio::test(flavor = "multi_thread")]
async fn pulled_dependency_resumes_the_attacher() {
    let ledger = start_ledger(3_000_000, 3).await;

    // the dependency is built but not submitted yet
    let distrib = distribution_tx(
        &ledger,
        &genesis_chain_output(&ledger),
        bootstrap_sequencer_id(),
        LogicalTime::must_new(0, 10),
        &[(controller_address(), 1_000)],
    );
    let dep_out = output_of(&distrib, 1);

    // the consumer arrives first: its attacher must register a pull and yield
    let consumer = transfer_tx(
        &ledger,
        &dep_out,
        controller_address(),
        1_000,
        LogicalTime::must_new(0, 25),
    );
    let consumer_handle = {
        let ledger_wf = ledger.workflow.clone();
        let bytes = consumer.clone();
        tokio::spawn(async move {
            ledger_wf
                .sequencer_milestone_attach_wait(bytes, Duration::from_secs(10))
                .await
        })
    };

    let dep_txid = dep_out.id.tx_id();
    // the pull request for the missing ancestor appears
    let mut waited = 0;
    while !ledger.workflow.pull_list().is_pending(&dep_txid) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += 1;
        assert!(waited < 250, "pull for the dependency was never registered");
    }

    // the bytes arrive (as a pull response would); the consumer gets poked
    submit_and_wait(&ledger, distrib).await.unwrap();
    let consumer_vid = consumer_handle.await.unwrap().unwrap();
    assert_eq!(consumer_vid.status(), TxStatus::Good);
    assert!(!ledger.workflow.pull_list().is_pending(&dep_txid));
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_dependency_cascades() {
    let ledger = start_ledger(3_000_000, 3).await;

    // a transaction violating conservation: parses fine, fails constraints
    let genesis_out = genesis_chain_output(&ledger);
    let mut b = TransactionBuilder::new(LogicalTime::must_new(0, 10));
    b.put_input(genesis_out.id, genesis_out.output.clone());
    b.put_output(Output::new(5_000_000, Lock::Ed25519(controller_address())));
    let bad = b.build_and_sign(&ledger.key);
    let bad_out = output_of(&bad, 0);
    let err = submit_and_wait(&ledger, bad.clone()).await.unwrap_err();
    assert!(err.contains("constraint"), "unexpected reason: {}", err);

    // any consumer of its outputs fails with a cascaded reason
    let consumer = transfer_tx(
        &ledger,
        &bad_out,
        controller_address(),
        1_000,
        LogicalTime::must_new(0, 25),
    );
    let err = submit_and_wait(&ledger, consumer).await.unwrap_err();
    assert!(err.contains("dependency is bad"), "unexpected reason: {}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn sequencer_produces_milestones_in_real_time() {
    // genesis at the present instant: the sequencer must build its chain live
    let ledger = start_ledger(3_000_000, 0).await;
    let seq = Sequencer::new(
        ledger.workflow.clone(),
        SequencerConfig {
            name: "boot".into(),
            chain_id: bootstrap_sequencer_id(),
            controller_key: controller_key(),
            max_fee_inputs: 10,
            pace_ticks: 10,
        },
        ledger.cancel.child_token(),
    )
    .unwrap();
    seq.start();

    // two and a half slots of real time
    tokio::time::sleep(Duration::from_millis(TEST_TICK_MS * 250)).await;
    ledger.cancel.cancel();

    let dag = ledger.workflow.dag();
    assert!(
        dag.latest_branch_slot() >= 1,
        "no branch was produced in real time"
    );
    let (reader, _) = dag.heaviest_state_for_latest_slot().unwrap();
    assert_eq!(
        reader
            .get_chain_output(&bootstrap_sequencer_id())
            .unwrap()
            .output
            .amount,
        3_000_000
    );
}
