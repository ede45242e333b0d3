//! HTTP API: submit transactions, query outputs and chains, poll inclusion.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ledger::output::{AccountID, OutputWithID};
use crate::ledger::{ChainID, TransactionID};
use crate::workflow::{TxIngress, Workflow};

struct RpcState {
    workflow: Arc<Workflow>,
}

/// `GET /state` response: ledger identity facts plus the heaviest branch.
#[derive(Serialize, Deserialize)]
pub struct StateInfo {
    pub description: String,
    pub genesis_time_unix_ms: u64,
    pub latest_slot: u32,
    pub heaviest_branch: Option<String>,
    pub coverage: u64,
    pub supply: u64,
    pub num_vertices: usize,
}

#[derive(Serialize, Deserialize)]
pub struct OutputInfo {
    pub id: String,
    pub amount: u64,
    /// Full bincode-encoded output, for client-side transaction building.
    pub output_hex: String,
}

#[derive(Serialize, Deserialize)]
pub struct OutputsResponse {
    pub outputs: Vec<OutputInfo>,
    pub balance: u64,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitRequest {
    pub tx_hex: String,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitResponse {
    pub txid: String,
}

#[derive(Serialize, Deserialize)]
pub struct InclusionResponse {
    pub included: bool,
}

fn output_info(out: &OutputWithID) -> OutputInfo {
    OutputInfo {
        id: hex::encode(out.id.to_bytes()),
        amount: out.output.amount,
        output_hex: hex::encode(out.output.to_bytes()),
    }
}

async fn get_state(State(state): State<Arc<RpcState>>) -> Json<StateInfo> {
    let workflow = &state.workflow;
    let identity = workflow.identity();
    let heaviest = workflow.dag().heaviest_state_for_latest_slot();
    Json(StateInfo {
        description: identity.description.clone(),
        genesis_time_unix_ms: identity.genesis_time_unix_ms,
        latest_slot: workflow.dag().latest_branch_slot(),
        heaviest_branch: heaviest
            .as_ref()
            .map(|(_, branch)| hex::encode(branch.id().as_bytes())),
        coverage: heaviest
            .as_ref()
            .map(|(reader, _)| reader.coverage().sum())
            .unwrap_or(0),
        supply: heaviest
            .as_ref()
            .map(|(reader, _)| reader.supply())
            .unwrap_or(0),
        num_vertices: workflow.dag().num_vertices(),
    })
}

async fn get_outputs(
    State(state): State<Arc<RpcState>>,
    Path(address_hex): Path<String>,
) -> Result<Json<OutputsResponse>, (StatusCode, String)> {
    let bytes = hex::decode(&address_hex)
        .map_err(|_| (StatusCode::BAD_REQUEST, "bad address hex".to_string()))?;
    let address: [u8; 32] = bytes
        .try_into()
        .map_err(|_| (StatusCode::BAD_REQUEST, "address must be 32 bytes".to_string()))?;
    let Some((reader, _)) = state.workflow.dag().heaviest_state_for_latest_slot() else {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "no state yet".into()));
    };
    let outputs = reader.outputs_for_account(&AccountID::Address(address));
    let balance = outputs.iter().map(|o| o.output.amount).sum();
    Ok(Json(OutputsResponse {
        outputs: outputs.iter().map(output_info).collect(),
        balance,
    }))
}

async fn get_chain_output(
    State(state): State<Arc<RpcState>>,
    Path(chain_hex): Path<String>,
) -> Result<Json<OutputInfo>, (StatusCode, String)> {
    let bytes = hex::decode(&chain_hex)
        .map_err(|_| (StatusCode::BAD_REQUEST, "bad chain id hex".to_string()))?;
    let chain_id = ChainID::from_bytes(&bytes)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let Some((reader, _)) = state.workflow.dag().heaviest_state_for_latest_slot() else {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "no state yet".into()));
    };
    match reader.get_chain_output(&chain_id) {
        Some(out) => Ok(Json(output_info(&out))),
        None => Err((StatusCode::NOT_FOUND, "chain output not found".into())),
    }
}

async fn submit_tx(
    State(state): State<Arc<RpcState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    let bytes = hex::decode(&req.tx_hex)
        .map_err(|_| (StatusCode::BAD_REQUEST, "bad transaction hex".to_string()))?;
    match state.workflow.tx_in(bytes, TxIngress::from_api()) {
        Ok(txid) => Ok(Json(SubmitResponse {
            txid: hex::encode(txid.as_bytes()),
        })),
        Err(err) => Err((StatusCode::BAD_REQUEST, err.to_string())),
    }
}

async fn get_inclusion(
    State(state): State<Arc<RpcState>>,
    Path(txid_hex): Path<String>,
) -> Result<Json<InclusionResponse>, (StatusCode, String)> {
    let bytes = hex::decode(&txid_hex)
        .map_err(|_| (StatusCode::BAD_REQUEST, "bad txid hex".to_string()))?;
    let txid = TransactionID::from_bytes(&bytes)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let included = state
        .workflow
        .dag()
        .heaviest_state_for_latest_slot()
        .map(|(reader, _)| reader.knows_committed_tx(&txid))
        .unwrap_or(false);
    Ok(Json(InclusionResponse { included }))
}

fn router(workflow: Arc<Workflow>) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/outputs/{address}", get(get_outputs))
        .route("/chain_output/{chain_id}", get(get_chain_output))
        .route("/inclusion/{txid}", get(get_inclusion))
        .route("/submit", post(submit_tx))
        .with_state(Arc::new(RpcState { workflow }))
}

/// Serve the API until cancellation.
pub async fn serve(
    port: u16,
    workflow: Arc<Workflow>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server started");
    axum::serve(listener, router(workflow))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
