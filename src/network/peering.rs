//! TCP peering: maintains connections to configured peers, frames messages,
//! tracks liveness via heartbeats, and feeds inbound traffic to the workflow.
//!
//! Connection policy: every known peer is dialed with reconnect-and-backoff;
//! inbound connections are accepted on the configured port and identified by
//! their remote address. Each connection carries both directions of the
//! protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{PeerEvent, PeerId, PeerMessage, Peering};
use crate::constants::HEARTBEAT_PERIOD_MS;
use crate::ledger::TransactionID;

/// Upper bound on a single frame (16 MiB).
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Peering configuration (from the `peering.*` config keys).
#[derive(Clone, Debug, Default)]
pub struct PeersConfig {
    /// TCP port to listen on; 0 disables the listener.
    pub host_port: u16,
    /// Known peers to dial: name -> address.
    pub known_peers: Vec<(String, SocketAddr)>,
}

struct PeerHandle {
    out_tx: mpsc::Sender<PeerMessage>,
    last_seen: Mutex<Instant>,
    alive: AtomicBool,
}

/// Errors of the peering layer.
#[derive(Debug, thiserror::Error)]
pub enum PeeringError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),
}

pub struct Peers {
    cfg: PeersConfig,
    handles: RwLock<HashMap<PeerId, Arc<PeerHandle>>>,
    events_tx: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
}

impl Peers {
    /// Create the peering hub. The returned receiver delivers inbound
    /// transaction bytes and pull requests.
    pub fn new(cfg: PeersConfig, cancel: CancellationToken) -> (Arc<Self>, mpsc::Receiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let peers = Arc::new(Peers {
            cfg,
            handles: RwLock::new(HashMap::new()),
            events_tx,
            cancel,
        });
        (peers, events_rx)
    }

    /// Start the listener, dialers and the heartbeat ticker.
    pub fn run(self: &Arc<Self>) {
        if self.cfg.host_port != 0 {
            let this = self.clone();
            tokio::spawn(async move { this.listen().await });
        }
        for (name, addr) in self.cfg.known_peers.clone() {
            let this = self.clone();
            tokio::spawn(async move { this.dial_loop(name, addr).await });
        }
        let this = self.clone();
        tokio::spawn(async move { this.heartbeat_loop().await });
    }

    async fn listen(self: Arc<Self>) {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.cfg.host_port));
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(err) => {
                tracing::error!(error = %err, port = self.cfg.host_port, "can't bind peering port");
                return;
            }
        };
        tracing::info!(port = self.cfg.host_port, "peering listener started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let peer_id: PeerId = remote.to_string();
                            tracing::debug!(peer = %peer_id, "inbound peer connection");
                            self.start_connection(peer_id, stream);
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                        }
                    }
                }
            }
        }
    }

    async fn dial_loop(self: Arc<Self>, name: String, addr: SocketAddr) {
        let mut backoff = Duration::from_millis(500);
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            if !self.is_connected(&name) {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        tracing::info!(peer = %name, %addr, "connected to peer");
                        backoff = Duration::from_millis(500);
                        self.start_connection(name.clone(), stream);
                    }
                    Err(err) => {
                        tracing::debug!(peer = %name, error = %err, "dial failed");
                        backoff = (backoff * 2).min(Duration::from_secs(30));
                    }
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.handles
            .read()
            .expect("peers lock")
            .get(peer)
            .map(|h| h.alive.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn start_connection(self: &Arc<Self>, peer_id: PeerId, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel(256);
        let handle = Arc::new(PeerHandle {
            out_tx,
            last_seen: Mutex::new(Instant::now()),
            alive: AtomicBool::new(true),
        });
        self.handles
            .write()
            .expect("peers lock")
            .insert(peer_id.clone(), handle.clone());

        let this = self.clone();
        let reader_peer = peer_id.clone();
        let reader_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(err) = this.read_loop(&reader_peer, read_half, reader_handle.clone()).await {
                tracing::debug!(peer = %reader_peer, error = %err, "peer read loop ended");
            }
            reader_handle.alive.store(false, Ordering::Relaxed);
        });
        let writer_cancel = self.cancel.clone();
        tokio::spawn(async move {
            write_loop(write_half, out_rx, writer_cancel).await;
            handle.alive.store(false, Ordering::Relaxed);
        });
    }

    async fn read_loop(
        &self,
        peer: &PeerId,
        mut read_half: OwnedReadHalf,
        handle: Arc<PeerHandle>,
    ) -> Result<(), PeeringError> {
        loop {
            let mut len_buf = [0u8; 4];
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                read = read_half.read_exact(&mut len_buf) => { read?; }
            }
            let len = u32::from_le_bytes(len_buf);
            if len > MAX_FRAME_BYTES {
                return Err(PeeringError::FrameTooLarge(len));
            }
            let mut body = vec![0u8; len as usize];
            read_half.read_exact(&mut body).await?;
            *handle.last_seen.lock().expect("last_seen lock") = Instant::now();

            match PeerMessage::decode(&body) {
                Ok(PeerMessage::Heartbeat) => {}
                Ok(PeerMessage::TxBytes(bytes)) => {
                    let _ = self
                        .events_tx
                        .send(PeerEvent::TxBytes {
                            from: peer.clone(),
                            bytes,
                        })
                        .await;
                }
                Ok(PeerMessage::PullRequest(txids)) => {
                    let _ = self
                        .events_tx
                        .send(PeerEvent::PullRequest {
                            from: peer.clone(),
                            txids,
                        })
                        .await;
                }
                Err(err) => {
                    tracing::warn!(peer = %peer, error = %err, "malformed peer message");
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = Duration::from_millis(HEARTBEAT_PERIOD_MS);
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let handles: Vec<(PeerId, Arc<PeerHandle>)> = {
                let guard = self.handles.read().expect("peers lock");
                guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            };
            for (peer, handle) in handles {
                let silent_for = handle.last_seen.lock().expect("last_seen lock").elapsed();
                if silent_for > period * 2 {
                    if handle.alive.swap(false, Ordering::Relaxed) {
                        tracing::info!(peer = %peer, "peer is dead (no heartbeat)");
                    }
                    continue;
                }
                let _ = handle.out_tx.try_send(PeerMessage::Heartbeat);
            }
        }
    }

    fn send_to(&self, peer: &PeerId, msg: PeerMessage) {
        let handle = {
            let guard = self.handles.read().expect("peers lock");
            guard.get(peer).cloned()
        };
        if let Some(handle) = handle {
            if handle.alive.load(Ordering::Relaxed) && handle.out_tx.try_send(msg).is_err() {
                tracing::debug!(peer = %peer, "peer outbound queue full, dropping message");
            }
        }
    }

    pub fn num_alive(&self) -> usize {
        self.handles
            .read()
            .expect("peers lock")
            .values()
            .filter(|h| h.alive.load(Ordering::Relaxed))
            .count()
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<PeerMessage>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = out_rx.recv() => match msg {
                Some(msg) => msg,
                None => return,
            }
        };
        let body = msg.encode();
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        if write_half.write_all(&frame).await.is_err() {
            return;
        }
    }
}

impl Peering for Peers {
    fn gossip_tx_bytes(&self, bytes: &[u8], except: Option<&PeerId>) {
        let peers: Vec<PeerId> = {
            let guard = self.handles.read().expect("peers lock");
            guard
                .iter()
                .filter(|(id, h)| h.alive.load(Ordering::Relaxed) && except != Some(*id))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for peer in peers {
            self.send_to(&peer, PeerMessage::TxBytes(bytes.to_vec()));
        }
    }

    fn send_tx_bytes_to(&self, peer: &PeerId, bytes: &[u8]) {
        self.send_to(peer, PeerMessage::TxBytes(bytes.to_vec()));
    }

    fn send_pull_request(&self, peer: &PeerId, txids: &[TransactionID]) {
        self.send_to(peer, PeerMessage::PullRequest(txids.to_vec()));
    }

    fn random_alive_peer(&self) -> Option<PeerId> {
        let guard = self.handles.read().expect("peers lock");
        let alive: Vec<PeerId> = guard
            .iter()
            .filter(|(_, h)| h.alive.load(Ordering::Relaxed))
            .map(|(id, _)| id.clone())
            .collect();
        drop(guard);
        alive.choose(&mut rand::thread_rng()).cloned()
    }
}
