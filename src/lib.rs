//! # Skein
//!
//! A distributed ledger node for a cooperative, leaderless consensus protocol
//! built on a UTXO directed acyclic graph (the "tangle"):
//! - **Tangle DAG** — every transaction consumes prior outputs and produces new
//!   ones; vertices are wrapped transactions with process-lifetime handles
//! - **Sequencer milestones** — chains of long-lived identities that
//!   periodically commit branch transactions snapshotting global state
//! - **Ledger coverage** — inclusion is biased toward the branch covering the
//!   largest share of the ledger; no leader, no voting rounds
//! - **Past-cone attachment** — incremental solidification against a baseline
//!   committed state with double-spend and parasitic-chain detection

pub mod config;
pub mod dag;
pub mod ledger;
pub mod network;
pub mod node;
pub mod rpc;
pub mod sequencer;
pub mod state;
pub mod transaction;
pub mod workflow;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

/// 32-byte Blake2b-256 digest.
pub type Hash = [u8; 32];

/// Blake2b with 256-bit output, the ledger's only hash function.
pub type Blake2b256 = Blake2b<U32>;

/// Hash arbitrary bytes with Blake2b-256.
pub fn hash_blake2b(data: &[u8]) -> Hash {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Protocol constants.
pub mod constants {
    /// Logical ticks per time slot.
    pub const TICKS_PER_SLOT: u8 = 100;
    /// Real-time duration of one tick in milliseconds.
    pub const TICK_DURATION_MS: u64 = 100;
    /// Minimum tick distance between an input and its consumer (ordinary tx).
    pub const TRANSACTION_PACE: u8 = 10;
    /// Minimum tick distance for sequencer milestones and endorsements.
    pub const SEQUENCER_PACE: u8 = 1;
    /// Unrooted outputs older than this many slots behind the baseline are
    /// rejected as parasitic chains.
    pub const PARASITIC_CHAIN_SLOTS: u32 = 5;
    /// Length of the ledger coverage vector (most recent slots).
    pub const COVERAGE_HISTORY_SLOTS: usize = 4;
    /// Maximum number of endorsements per milestone.
    pub const MAX_ENDORSEMENTS: usize = 8;
    /// Default bound on tag-along fee inputs per milestone.
    pub const MAX_FEE_INPUTS_DEFAULT: usize = 20;
    /// Hard cap on tag-along fee inputs (output index space minus chain + stem).
    pub const MAX_FEE_INPUTS_HARD: usize = 254;
    /// Milestone attachers re-check their past cone at this period even
    /// without a poke.
    pub const ATTACHER_PERIODIC_CHECK_MS: u64 = 100;
    /// Attachment callbacks must return within this window; exceeding it is an
    /// internal invariant violation.
    pub const ATTACHER_CALLBACK_TIMEOUT_MS: u64 = 200;
    /// Pending pulls are re-asked from a random peer at this period.
    pub const PULL_RETRY_PERIOD_MS: u64 = 500;
    /// Peer heartbeat period; a peer is dead after two periods of silence.
    pub const HEARTBEAT_PERIOD_MS: u64 = 2_000;
    /// Ingress rejects transactions whose timestamp is further in the future
    /// than this many slots.
    pub const MAX_SLOTS_IN_THE_FUTURE: u32 = 10_000;
    /// Vertices this many slots behind the latest branch are tombstoned.
    pub const PRUNE_KEEP_SLOTS: u32 = 10;
    /// Default HTTP API port.
    pub const DEFAULT_API_PORT: u16 = 8070;
    /// Default peering TCP port.
    pub const DEFAULT_PEERING_PORT: u16 = 4048;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake2b_digest_is_32_bytes_and_stable() {
        let h1 = hash_blake2b(b"skein");
        let h2 = hash_blake2b(b"skein");
        assert_eq!(h1, h2);
        assert_ne!(h1, hash_blake2b(b"skein2"));
    }
}
