//! The skein node and operational tool.
//!
//! ```text
//! skein node                         run the node (default)
//! skein db genesis --supply N --desc S   create the state DB and bootstrap
//! skein db tree [SLOTS]              dump the branch tree as DOT
//! skein api get_chain_output <id>    query a chain tip
//! skein api get_outputs              list own outputs and balance
//! skein api transfer <amount> [--wait]   submit a transfer
//! ```
//!
//! Exit codes: 0 on success, 1 on any fatal error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use tokio_util::sync::CancellationToken;

use skein::config::NodeConfig;
use skein::ledger::identity::{bootstrap_sequencer_id, genesis_tx_id, LedgerIdentity};
use skein::ledger::output::{address_from_public_key, Output};
use skein::ledger::{LogicalTime, OutputID};
use skein::state::StateStore;
use skein::transaction::builder::{make_transfer, TransferParams};

/// Wallet key file inside the data directory (hex Ed25519 seed).
const KEY_FILE_NAME: &str = "skein.key";

#[derive(Parser, Debug)]
#[command(name = "skein", version, about = "Cooperative UTXO-tangle ledger node")]
struct Cli {
    /// Data directory (config, databases, keys).
    #[arg(long, default_value = "./skein-data", global = true)]
    data_dir: PathBuf,

    /// API endpoint for client commands.
    #[arg(long, default_value = "127.0.0.1:8070", global = true)]
    api: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node (the default).
    Node,
    /// State database maintenance.
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Client commands against a running node's API.
    Api {
        #[command(subcommand)]
        command: ApiCommand,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommand {
    /// Create the state database and bootstrap the ledger.
    Genesis {
        /// Initial supply.
        #[arg(long)]
        supply: u64,
        /// Ledger description.
        #[arg(long, default_value = "skein ledger")]
        desc: String,
    },
    /// Dump the branch tree as DOT, optionally bounded to the last SLOTS
    /// slots.
    Tree { slots: Option<u32> },
}

#[derive(Subcommand, Debug)]
enum ApiCommand {
    /// Print the chain tip output of a chain id.
    #[command(name = "get_chain_output")]
    GetChainOutput { chain_id: String },
    /// List outputs controlled by the wallet key.
    #[command(name = "get_outputs")]
    GetOutputs,
    /// Submit a transfer of AMOUNT to --target (self by default).
    Transfer {
        amount: u64,
        /// Target address, hex; the wallet's own address when omitted.
        #[arg(long)]
        target: Option<String>,
        /// Poll until the transaction is included in the heaviest state.
        #[arg(long)]
        wait: bool,
    },
}

fn init_tracing(extra_directives: &[String]) {
    use tracing_subscriber::EnvFilter;
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    for directive in extra_directives {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_or_generate_key(data_dir: &Path) -> Result<SigningKey, String> {
    let path = data_dir.join(KEY_FILE_NAME);
    if path.exists() {
        let hex_str = std::fs::read_to_string(&path)
            .map_err(|e| format!("can't read {}: {}", path.display(), e))?;
        let bytes = hex::decode(hex_str.trim())
            .map_err(|_| format!("corrupted key file {}", path.display()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("key file {} must hold a 32-byte seed", path.display()))?;
        Ok(SigningKey::from_bytes(&seed))
    } else {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        std::fs::create_dir_all(data_dir)
            .map_err(|e| format!("can't create {}: {}", data_dir.display(), e))?;
        std::fs::write(&path, hex::encode(key.to_bytes()))
            .map_err(|e| format!("can't write {}: {}", path.display(), e))?;
        tracing::info!(path = %path.display(), "generated wallet key");
        Ok(key)
    }
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn run_node(data_dir: &Path) -> Result<(), String> {
    let config = NodeConfig::load(data_dir).map_err(|e| e.to_string())?;
    init_tracing(&config.trace_directives());
    let cancel = CancellationToken::new();
    let node = skein::node::Node::start(&config, data_dir, cancel)
        .await
        .map_err(|e| e.to_string())?;
    node.run_until_interrupted().await;
    Ok(())
}

fn db_genesis(data_dir: &Path, supply: u64, desc: &str) -> Result<(), String> {
    let key = load_or_generate_key(data_dir)?;
    let config = NodeConfig::load(data_dir).map_err(|e| e.to_string())?;
    let identity = LedgerIdentity::new(
        desc.to_string(),
        now_unix_ms(),
        supply,
        key.verifying_key().to_bytes(),
    );
    StateStore::init(&config.multi_state_db_path(data_dir), identity)
        .map_err(|e| e.to_string())?;
    println!("created genesis state: supply {}, '{}'", supply, desc);
    println!("bootstrap sequencer chain id: {}", bootstrap_sequencer_id());
    println!(
        "genesis branch: {}",
        hex::encode(genesis_tx_id().as_bytes())
    );
    println!(
        "controller address: {}",
        hex::encode(address_from_public_key(&key.verifying_key().to_bytes()))
    );
    Ok(())
}

fn db_tree(data_dir: &Path, slots: Option<u32>) -> Result<(), String> {
    let config = NodeConfig::load(data_dir).map_err(|e| e.to_string())?;
    let store = StateStore::open(&config.multi_state_db_path(data_dir))
        .map_err(|e| e.to_string())?;
    let mut records = store.all_root_records().map_err(|e| e.to_string())?;
    records.sort_by(|a, b| a.0.cmp_by_time(&b.0));
    let latest = records.iter().map(|(id, _)| id.slot()).max().unwrap_or(0);
    let horizon = slots.map(|n| latest.saturating_sub(n)).unwrap_or(0);

    println!("digraph branches {{");
    println!("  rankdir=BT;");
    for (branch, record) in &records {
        if branch.slot() < horizon {
            continue;
        }
        println!(
            "  \"{}\" [label=\"{} {}\\nslot {} cov {}\\nsupply {}\"];",
            branch,
            branch.short_string(),
            record.sequencer_id.short_string(),
            branch.slot(),
            record.ledger_coverage.sum(),
            record.supply,
        );
        if record.predecessor_branch != *branch && record.predecessor_branch.slot() >= horizon {
            println!("  \"{}\" -> \"{}\";", branch, record.predecessor_branch);
        }
    }
    println!("}}");
    Ok(())
}

// ── API client ──

struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    fn new(endpoint: &str) -> Self {
        ApiClient {
            base_url: format!("http://{}", endpoint),
            client: reqwest::Client::new(),
        }
    }

    async fn state(&self) -> Result<skein::rpc::StateInfo, String> {
        self.client
            .get(format!("{}/state", self.base_url))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())
    }

    async fn outputs(&self, address_hex: &str) -> Result<skein::rpc::OutputsResponse, String> {
        self.client
            .get(format!("{}/outputs/{}", self.base_url, address_hex))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())
    }

    async fn chain_output(&self, chain_hex: &str) -> Result<skein::rpc::OutputInfo, String> {
        let resp = self
            .client
            .get(format!("{}/chain_output/{}", self.base_url, chain_hex))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("{}", resp.status()));
        }
        resp.json().await.map_err(|e| e.to_string())
    }

    async fn submit(&self, tx_hex: String) -> Result<String, String> {
        let resp = self
            .client
            .post(format!("{}/submit", self.base_url))
            .json(&skein::rpc::SubmitRequest { tx_hex })
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("rejected: {}", text));
        }
        let out: skein::rpc::SubmitResponse = resp.json().await.map_err(|e| e.to_string())?;
        Ok(out.txid)
    }

    async fn included(&self, txid_hex: &str) -> Result<bool, String> {
        let resp: skein::rpc::InclusionResponse = self
            .client
            .get(format!("{}/inclusion/{}", self.base_url, txid_hex))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())?;
        Ok(resp.included)
    }
}

async fn api_get_outputs(endpoint: &str, data_dir: &Path) -> Result<(), String> {
    let key = load_or_generate_key(data_dir)?;
    let address = address_from_public_key(&key.verifying_key().to_bytes());
    let client = ApiClient::new(endpoint);
    let resp = client.outputs(&hex::encode(address)).await?;
    for out in &resp.outputs {
        println!("{}  amount: {}", out.id, out.amount);
    }
    println!("total: {} ({} outputs)", resp.balance, resp.outputs.len());
    Ok(())
}

async fn api_get_chain_output(endpoint: &str, chain_id: &str) -> Result<(), String> {
    let client = ApiClient::new(endpoint);
    let out = client.chain_output(chain_id).await?;
    println!("{}  amount: {}", out.id, out.amount);
    Ok(())
}

async fn api_transfer(
    endpoint: &str,
    data_dir: &Path,
    amount: u64,
    target: Option<String>,
    wait: bool,
) -> Result<(), String> {
    let key = load_or_generate_key(data_dir)?;
    let own_address = address_from_public_key(&key.verifying_key().to_bytes());
    let target_address: [u8; 32] = match target {
        Some(hex_str) => hex::decode(&hex_str)
            .map_err(|_| "bad target address hex".to_string())?
            .try_into()
            .map_err(|_| "target address must be 32 bytes".to_string())?,
        None => own_address,
    };

    let client = ApiClient::new(endpoint);
    let state = client.state().await?;
    let resp = client.outputs(&hex::encode(own_address)).await?;

    // collect inputs, oldest first, until the amount is covered
    let mut inputs = Vec::new();
    let mut collected = 0u64;
    for info in &resp.outputs {
        let oid_bytes = hex::decode(&info.id).map_err(|e| e.to_string())?;
        let id = OutputID::from_bytes(&oid_bytes).map_err(|e| e.to_string())?;
        let out_bytes = hex::decode(&info.output_hex).map_err(|e| e.to_string())?;
        let output = Output::from_bytes(&out_bytes).map_err(|e| e.to_string())?;
        collected += output.amount;
        inputs.push(skein::ledger::output::OutputWithID { id, output });
        if collected >= amount {
            break;
        }
    }
    if collected < amount {
        return Err(format!("not enough funds: have {}, need {}", collected, amount));
    }

    // timestamp: logical now, respecting the pace from the newest input
    let elapsed_ticks =
        now_unix_ms().saturating_sub(state.genesis_time_unix_ms) / skein::constants::TICK_DURATION_MS;
    let mut ts = LogicalTime::default().add_ticks(elapsed_ticks);
    let min_ts = inputs
        .iter()
        .map(|i| i.id.timestamp())
        .max()
        .unwrap_or_default()
        .add_ticks(skein::constants::TRANSACTION_PACE as u64);
    if ts < min_ts {
        ts = min_ts;
    }

    let tx_bytes = make_transfer(
        TransferParams {
            inputs,
            amount,
            target: target_address,
            timestamp: ts,
        },
        &key,
    )
    .map_err(|e| e.to_string())?;

    let txid = client.submit(hex::encode(&tx_bytes)).await?;
    println!("submitted: {}", txid);

    if wait {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(60);
        loop {
            if client.included(&txid).await? {
                println!("included in the heaviest state");
                return Ok(());
            }
            if std::time::Instant::now() > deadline {
                return Err("timeout waiting for inclusion".into());
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Command::Node) {
        Command::Node => run_node(&cli.data_dir).await,
        Command::Db { command } => {
            init_tracing(&[]);
            match command {
                DbCommand::Genesis { supply, desc } => db_genesis(&cli.data_dir, supply, &desc),
                DbCommand::Tree { slots } => db_tree(&cli.data_dir, slots),
            }
        }
        Command::Api { command } => {
            init_tracing(&[]);
            match command {
                ApiCommand::GetOutputs => api_get_outputs(&cli.api, &cli.data_dir).await,
                ApiCommand::GetChainOutput { chain_id } => {
                    api_get_chain_output(&cli.api, &chain_id).await
                }
                ApiCommand::Transfer {
                    amount,
                    target,
                    wait,
                } => api_transfer(&cli.api, &cli.data_dir, amount, target, wait).await,
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}
