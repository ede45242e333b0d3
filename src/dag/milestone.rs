//! The attacher task: drives one transaction's attachment to completion.
//!
//! Each task owns a [`PastCone`] and loops between solidification passes and
//! suspension on its poke signal. Dependencies fan pokes out on status
//! change; a periodic tick re-checks regardless, and the cancellation token
//! aborts with `Cancelled`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::attacher::{AttacherEnv, PastCone, Progress};
use super::vertex::{TxStatus, Vid};
use super::AttachError;
use crate::constants::{ATTACHER_CALLBACK_TIMEOUT_MS, ATTACHER_PERIODIC_CHECK_MS};
use crate::state::{BranchMutations, RootRecordData, StateError};

/// Callback invoked exactly once when an attachment finishes.
pub type AttachCallback = Box<dyn FnOnce(Vid, Result<(), AttachError>) + Send + 'static>;

/// Options of [`attach_transaction`].
#[derive(Default)]
pub struct AttachOptions {
    pub callback: Option<AttachCallback>,
}

/// Admit a parsed transaction into the DAG and spawn its attacher task when
/// the payload is newly installed. Idempotent by txid: a repeated call never
/// spawns a second attacher and fires the callback immediately when the
/// status is already decided.
pub fn attach_transaction(
    env: &Arc<dyn AttacherEnv>,
    tx: Arc<crate::transaction::Transaction>,
    cancel: CancellationToken,
    opts: AttachOptions,
) -> Vid {
    let (vid, installed) = env.dag().attach_transaction(tx);
    if !installed {
        if let Some(cb) = opts.callback {
            match vid.status() {
                TxStatus::Good => cb(vid.clone(), Ok(())),
                TxStatus::Bad => {
                    let reason = vid.reason().unwrap_or(AttachError::Cancelled);
                    cb(vid.clone(), Err(reason));
                }
                TxStatus::Undefined => {
                    // an attacher is already running; the submitter polls
                    // inclusion instead
                }
            }
        }
        return vid;
    }
    let env = env.clone();
    let task_vid = vid.clone();
    let worker = tokio::spawn(async move {
        run_attacher_task(env, task_vid, cancel, opts.callback).await;
    });
    // a panic inside a worker corrupts the DAG; catch it at the task
    // boundary and crash instead of letting the runtime contain it
    let supervised_vid = vid.clone();
    tokio::spawn(async move {
        if let Err(err) = worker.await {
            if err.is_panic() {
                fatal_invariant(AttachError::InternalInvariant(format!(
                    "attacher worker for {} panicked",
                    supervised_vid.id().short_string()
                )));
            }
        }
    });
    vid
}

/// An `InternalInvariant` is not recoverable: continuing would corrupt the
/// DAG, so the whole process goes down.
fn fatal_invariant(err: AttachError) -> ! {
    tracing::error!(error = %err, "fatal");
    std::process::abort();
}

/// Storage unavailability cannot be handled per transaction; it propagates
/// to shutdown instead of poisoning the vertex with a terminal Bad status.
fn map_commit_error(err: StateError) -> AttachError {
    match err {
        StateError::Db(db) => {
            tracing::error!(error = %db, "multi-state store unavailable, shutting down");
            std::process::exit(1);
        }
        other => AttachError::ConstraintValidationFailed(other.to_string()),
    }
}

/// Drive one attachment to Good or Bad and invoke the callback under the
/// soft timeout.
pub async fn run_attacher_task(
    env: Arc<dyn AttacherEnv>,
    vid: Vid,
    cancel: CancellationToken,
    callback: Option<AttachCallback>,
) {
    let poke = Arc::new(Notify::new());
    let mut cone = PastCone::new(env.clone(), vid.id().short_string(), Some(poke.clone()));

    let result = run_attacher(&env, &mut cone, &vid, &poke, &cancel).await;

    match &result {
        Ok(()) => {
            if let Some(data) = vid.tx().and_then(|tx| tx.milestone_data().cloned()) {
                tracing::info!(
                    vid = %vid.id().short_string(),
                    seq = %data.name,
                    heights = format!("{}/{}", data.branch_height, data.chain_height),
                    coverage = vid.coverage().unwrap_or_default().sum(),
                    "attached milestone"
                );
            } else {
                tracing::debug!(vid = %vid.id().short_string(), "attached");
            }
        }
        Err(err) => {
            vid.set_status_bad(err.clone());
            tracing::warn!(vid = %vid.id().short_string(), reason = %err, "attachment failed");
            // release back-references held by this attacher
            cone.unreference_all();
            vid.unreference_dependencies();
        }
    }
    // wake dependants in either outcome: they cascade Good or DependencyBad
    vid.wake_future_cone();

    if let Some(cb) = callback {
        invoke_callback_with_timeout(cb, vid, result).await;
    }
}

async fn run_attacher(
    env: &Arc<dyn AttacherEnv>,
    cone: &mut PastCone,
    vid: &Vid,
    poke: &Arc<Notify>,
    cancel: &CancellationToken,
) -> Result<(), AttachError> {
    // 1. solidify the baseline
    if vid.is_sequencer_milestone() {
        loop {
            match cone.solidify_baseline(vid) {
                Ok(true) => break,
                Ok(false) => suspend(poke, cancel).await?,
                Err(err) => return Err(err),
            }
        }
    } else {
        // ordinary transactions resolve against the heaviest known branch
        let baseline = env.dag().heaviest_branch_of_latest_slot().ok_or_else(|| {
            AttachError::BaselineSolidificationFailed("no branch known yet".into())
        })?;
        cone.set_baseline(baseline)?;
    }
    tracing::trace!(target: "milestone", vid = %vid.id().short_string(), "baseline solid");

    // 2. solidify and validate the past cone
    loop {
        let mut visited = HashSet::new();
        match cone.attach_vertex(vid, None, &mut visited)? {
            Progress::Done => break,
            Progress::Pending => suspend(poke, cancel).await?,
        }
    }
    tracing::trace!(target: "milestone", vid = %vid.id().short_string(), "past cone solid");

    // 3. wrap up
    if vid.is_sequencer_milestone() {
        let coverage = cone.ledger_coverage(vid.timestamp());
        vid.set_coverage(coverage);
    }
    if vid.is_sequencer_milestone() {
        if let Some(tx) = vid.tx() {
            // sequencer bytes are persisted upon finalization
            env.persist_tx_bytes(&tx);
        }
    }
    if vid.is_branch() {
        commit_branch(env, cone, vid)?;
        // a closed branch no longer references its past cone
        vid.convert_vertex_to_virtual();
    }
    vid.set_status_good();
    if vid.is_sequencer_milestone() {
        env.on_milestone_good(vid);
    }
    Ok(())
}

/// Wait for a poke, the periodic tick, or cancellation.
async fn suspend(poke: &Arc<Notify>, cancel: &CancellationToken) -> Result<(), AttachError> {
    tokio::select! {
        _ = poke.notified() => Ok(()),
        _ = cancel.cancelled() => Err(AttachError::Cancelled),
        _ = tokio::time::sleep(Duration::from_millis(ATTACHER_PERIODIC_CHECK_MS)) => Ok(()),
    }
}

/// Write the branch state: baseline minus rooted consumption plus everything
/// the past cone produced that was not consumed within it.
fn commit_branch(
    env: &Arc<dyn AttacherEnv>,
    cone: &PastCone,
    vid: &Vid,
) -> Result<(), AttachError> {
    let tx = vid.tx().expect("branch attacher holds the full vertex");
    let baseline = cone
        .baseline()
        .cloned()
        .expect("baseline is solid after the past cone");
    let baseline_record = env
        .state_store()
        .root_record(&baseline.id())
        .ok()
        .flatten()
        .ok_or_else(|| {
            AttachError::BaselineSolidificationFailed(format!(
                "baseline record disappeared: {}",
                baseline.id().short_string()
            ))
        })?;

    let mut cone_txs: Vec<Arc<crate::transaction::Transaction>> = cone
        .valid_vertices()
        .into_iter()
        .filter_map(|v| v.tx())
        .collect();
    if !cone_txs.iter().any(|t| t.id() == tx.id()) {
        cone_txs.push(tx.clone());
    }

    let mut produced = Vec::new();
    let mut committed_txids = Vec::new();
    for cone_tx in &cone_txs {
        committed_txids.push(cone_tx.id());
        for idx in 0..cone_tx.num_produced_outputs() {
            let oid = cone_tx.output_id(idx as u8);
            if !cone.is_consumed_in_cone(&oid) {
                let out = cone_tx
                    .produced_output_at(idx as u8)
                    .expect("index in range")
                    .clone();
                produced.push((oid, out));
            }
        }
    }

    let slot_inflation = tx.inflation_amount();
    let supply = baseline_record.supply.saturating_add(slot_inflation);
    let stem_output_id = tx.stem_output().expect("branch carries a stem").id;
    let sequencer_id = tx
        .sequencer_data()
        .expect("branch is a sequencer milestone")
        .sequencer_id;

    let mutations = BranchMutations {
        consumed: cone.rooted_outputs(),
        produced,
        committed_txids,
    };
    env.state_store()
        .commit_branch(
            vid.id(),
            Some(baseline.id()),
            &mutations,
            RootRecordData {
                ledger_coverage: vid.coverage().unwrap_or_default(),
                sequencer_id,
                slot_inflation,
                supply,
                stem_output_id,
            },
        )
        .map_err(map_commit_error)?;
    env.dag().add_branch(vid).map_err(map_commit_error)?;
    Ok(())
}

/// Callbacks must return promptly and must not panic; either failure is an
/// internal invariant violation and brings the node down.
async fn invoke_callback_with_timeout(cb: AttachCallback, vid: Vid, result: Result<(), AttachError>) {
    let txid = vid.id();
    let handle = tokio::task::spawn_blocking(move || cb(vid, result));
    match tokio::time::timeout(Duration::from_millis(ATTACHER_CALLBACK_TIMEOUT_MS), handle).await {
        Ok(Ok(())) => {}
        Ok(Err(join_err)) if join_err.is_panic() => {
            fatal_invariant(AttachError::InternalInvariant(format!(
                "attachment callback for {} panicked",
                txid.short_string()
            )));
        }
        Ok(Err(_)) => {
            // cancelled join: only happens on runtime shutdown
        }
        Err(_) => {
            fatal_invariant(AttachError::InternalInvariant(format!(
                "attachment callback for {} exceeded the soft timeout",
                txid.short_string()
            )));
        }
    }
}
