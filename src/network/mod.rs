//! Peer-to-peer wire protocol: framed messages and the peering seam.
//!
//! Frames are length-prefixed: `u32 length || u8 kind || payload`.
//! Three message kinds exist: raw transaction bytes, pull requests (a list
//! of 33-byte transaction ids), and empty heartbeats. Peers are marked dead
//! after two heartbeat periods without traffic.

pub mod peering;

use crate::ledger::{TransactionID, TRANSACTION_ID_LENGTH};

/// Peer identity: the configured peer name, or the remote address for
/// inbound connections.
pub type PeerId = String;

const KIND_TX_BYTES: u8 = 0;
const KIND_PULL_REQUEST: u8 = 1;
const KIND_HEARTBEAT: u8 = 2;

/// A message on the peer wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    TxBytes(Vec<u8>),
    PullRequest(Vec<TransactionID>),
    Heartbeat,
}

/// Errors decoding a frame payload.
#[derive(Clone, Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("malformed pull request")]
    MalformedPullRequest,
}

impl PeerMessage {
    /// Encode into a frame body (kind byte plus payload, without the length
    /// prefix).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            PeerMessage::TxBytes(bytes) => {
                let mut ret = Vec::with_capacity(1 + bytes.len());
                ret.push(KIND_TX_BYTES);
                ret.extend_from_slice(bytes);
                ret
            }
            PeerMessage::PullRequest(txids) => {
                let mut ret = Vec::with_capacity(1 + 2 + txids.len() * TRANSACTION_ID_LENGTH);
                ret.push(KIND_PULL_REQUEST);
                ret.extend_from_slice(&(txids.len() as u16).to_be_bytes());
                for txid in txids {
                    ret.extend_from_slice(txid.as_bytes());
                }
                ret
            }
            PeerMessage::Heartbeat => vec![KIND_HEARTBEAT],
        }
    }

    /// Decode a frame body.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let (kind, rest) = data.split_first().ok_or(WireError::UnknownKind(0xff))?;
        match *kind {
            KIND_TX_BYTES => Ok(PeerMessage::TxBytes(rest.to_vec())),
            KIND_PULL_REQUEST => {
                if rest.len() < 2 {
                    return Err(WireError::MalformedPullRequest);
                }
                let count = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                let body = &rest[2..];
                if body.len() != count * TRANSACTION_ID_LENGTH {
                    return Err(WireError::MalformedPullRequest);
                }
                let mut txids = Vec::with_capacity(count);
                for chunk in body.chunks_exact(TRANSACTION_ID_LENGTH) {
                    txids.push(
                        TransactionID::from_bytes(chunk)
                            .map_err(|_| WireError::MalformedPullRequest)?,
                    );
                }
                Ok(PeerMessage::PullRequest(txids))
            }
            KIND_HEARTBEAT => Ok(PeerMessage::Heartbeat),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Inbound traffic handed to the workflow.
#[derive(Clone, Debug)]
pub enum PeerEvent {
    TxBytes { from: PeerId, bytes: Vec<u8> },
    PullRequest { from: PeerId, txids: Vec<TransactionID> },
}

/// The narrow peering interface the workflow depends on.
pub trait Peering: Send + Sync {
    /// Broadcast transaction bytes to all alive peers except `except`.
    fn gossip_tx_bytes(&self, bytes: &[u8], except: Option<&PeerId>);
    /// Send transaction bytes to one peer (pull response).
    fn send_tx_bytes_to(&self, peer: &PeerId, bytes: &[u8]);
    /// Ask one peer for the given transactions.
    fn send_pull_request(&self, peer: &PeerId, txids: &[TransactionID]);
    /// A random alive peer to direct pulls at.
    fn random_alive_peer(&self) -> Option<PeerId>;
}

/// No-op peering for single-node operation and tests.
#[derive(Default)]
pub struct NullPeering;

impl Peering for NullPeering {
    fn gossip_tx_bytes(&self, _bytes: &[u8], _except: Option<&PeerId>) {}
    fn send_tx_bytes_to(&self, _peer: &PeerId, _bytes: &[u8]) {}
    fn send_pull_request(&self, _peer: &PeerId, _txids: &[TransactionID]) {}
    fn random_alive_peer(&self) -> Option<PeerId> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LogicalTime;

    fn txid(seed: u8) -> TransactionID {
        TransactionID::new(LogicalTime::must_new(1, 5), [seed; 28], false, false)
    }

    #[test]
    fn tx_bytes_roundtrip() {
        let msg = PeerMessage::TxBytes(vec![1, 2, 3]);
        assert_eq!(PeerMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn pull_request_roundtrip() {
        let msg = PeerMessage::PullRequest(vec![txid(1), txid(2)]);
        assert_eq!(PeerMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn heartbeat_roundtrip() {
        assert_eq!(
            PeerMessage::decode(&PeerMessage::Heartbeat.encode()).unwrap(),
            PeerMessage::Heartbeat
        );
    }

    #[test]
    fn truncated_pull_request_rejected() {
        let mut bytes = PeerMessage::PullRequest(vec![txid(1)]).encode();
        bytes.pop();
        assert!(PeerMessage::decode(&bytes).is_err());
    }
}
