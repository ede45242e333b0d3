//! Ledger identity: the immutable parameters a ledger instance is created
//! with, plus genesis construction.
//!
//! The identity is written into the state store at `db genesis` time and
//! loaded once at node start; after that it is read-only, passed around
//! explicitly.

use serde::{Deserialize, Serialize};

use super::output::{
    address_from_public_key, Address, ChainConstraint, Constraint, Lock, MilestoneData, Output,
    OutputWithID, StemLock,
};
use super::{ChainID, LogicalTime, OutputID, TransactionID, TX_HASH_LENGTH};
use crate::constants::{TICKS_PER_SLOT, TICK_DURATION_MS};

/// Name of the bootstrap sequencer, carried in genesis milestone data.
pub const BOOTSTRAP_SEQUENCER_NAME: &str = "boot";

/// Immutable ledger-wide parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerIdentity {
    pub description: String,
    /// Real time of slot 0 tick 0, unix milliseconds.
    pub genesis_time_unix_ms: u64,
    pub initial_supply: u64,
    /// Ed25519 public key of the genesis controller.
    pub genesis_controller_public_key: [u8; 32],
    pub tick_duration_ms: u64,
    pub ticks_per_slot: u8,
}

impl LedgerIdentity {
    pub fn new(
        description: String,
        genesis_time_unix_ms: u64,
        initial_supply: u64,
        controller_public_key: [u8; 32],
    ) -> Self {
        LedgerIdentity {
            description,
            genesis_time_unix_ms,
            initial_supply,
            genesis_controller_public_key: controller_public_key,
            tick_duration_ms: TICK_DURATION_MS,
            ticks_per_slot: TICKS_PER_SLOT,
        }
    }

    pub fn slot_duration_ms(&self) -> u64 {
        self.tick_duration_ms * self.ticks_per_slot as u64
    }

    pub fn genesis_controller_address(&self) -> Address {
        address_from_public_key(&self.genesis_controller_public_key)
    }

    /// Logical time corresponding to a real unix-ms instant (clamped to
    /// genesis when earlier).
    pub fn logical_time_from_unix_ms(&self, unix_ms: u64) -> LogicalTime {
        let elapsed = unix_ms.saturating_sub(self.genesis_time_unix_ms);
        let ticks = elapsed / self.tick_duration_ms;
        LogicalTime::default().add_ticks(ticks)
    }

    /// Real unix-ms instant of a logical time.
    pub fn unix_ms_from_logical_time(&self, ts: LogicalTime) -> u64 {
        self.genesis_time_unix_ms + ts.total_ticks() * self.tick_duration_ms
    }
}

/// The synthetic id of the genesis "transaction". Branch-flagged at slot 0
/// tick 0, zero hash; it is never parsed, only referenced by its outputs.
pub fn genesis_tx_id() -> TransactionID {
    TransactionID::new(LogicalTime::default(), [0u8; TX_HASH_LENGTH], true, true)
}

/// Id of the genesis chain-origin output.
pub fn genesis_output_id() -> OutputID {
    OutputID::new(genesis_tx_id(), 0)
}

/// Id of the genesis stem output.
pub fn genesis_stem_output_id() -> OutputID {
    OutputID::new(genesis_tx_id(), 1)
}

/// The bootstrap sequencer chain id: origin id of the genesis output.
pub fn bootstrap_sequencer_id() -> ChainID {
    ChainID::origin(&genesis_output_id())
}

/// The all-zero output id the genesis stem lock points at.
pub fn nil_output_id() -> OutputID {
    OutputID::new(
        TransactionID::new(LogicalTime::default(), [0u8; TX_HASH_LENGTH], false, false),
        0,
    )
}

/// Genesis chain-origin output: whole supply, controller-locked, carrying
/// chain origin + sequencer + milestone-data constraints.
pub fn genesis_output(identity: &LedgerIdentity) -> OutputWithID {
    let output = Output::new(
        identity.initial_supply,
        Lock::Ed25519(identity.genesis_controller_address()),
    )
    .with_constraint(Constraint::Chain(ChainConstraint::origin()))
    .with_constraint(Constraint::Sequencer {
        amount_on_chain: identity.initial_supply,
    })
    .with_constraint(Constraint::MilestoneData(MilestoneData {
        name: BOOTSTRAP_SEQUENCER_NAME.to_string(),
        chain_height: 0,
        branch_height: 0,
    }));
    OutputWithID {
        id: genesis_output_id(),
        output,
    }
}

/// Genesis stem output: zero amount, stem lock with a nil predecessor.
pub fn genesis_stem_output(identity: &LedgerIdentity) -> OutputWithID {
    OutputWithID {
        id: genesis_stem_output_id(),
        output: Output::new(
            0,
            Lock::Stem(StemLock {
                predecessor_output_id: nil_output_id(),
                supply: identity.initial_supply,
                inflation_amount: 0,
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> LedgerIdentity {
        LedgerIdentity::new("test ledger".into(), 1_000_000, 3_000_000, [7u8; 32])
    }

    #[test]
    fn genesis_ids_are_flagged() {
        let id = genesis_tx_id();
        assert!(id.is_sequencer_milestone());
        assert!(id.is_branch());
        assert_eq!(id.slot(), 0);
    }

    #[test]
    fn bootstrap_chain_id_is_stable() {
        assert_eq!(bootstrap_sequencer_id(), bootstrap_sequencer_id());
        assert_eq!(
            bootstrap_sequencer_id(),
            ChainID::origin(&genesis_output_id())
        );
    }

    #[test]
    fn genesis_outputs_carry_supply() {
        let identity = identity();
        let out = genesis_output(&identity);
        assert_eq!(out.output.amount, 3_000_000);
        assert!(out.output.is_sequencer_output());
        assert_eq!(out.chain_id(), Some(bootstrap_sequencer_id()));

        let stem = genesis_stem_output(&identity);
        assert_eq!(stem.output.amount, 0);
        assert_eq!(stem.output.stem_lock().unwrap().supply, 3_000_000);
    }

    #[test]
    fn logical_time_conversion_roundtrip() {
        let identity = identity();
        let ts = LogicalTime::must_new(3, 42);
        let unix = identity.unix_ms_from_logical_time(ts);
        assert_eq!(identity.logical_time_from_unix_ms(unix), ts);
        // before genesis clamps to zero
        assert_eq!(
            identity.logical_time_from_unix_ms(0),
            LogicalTime::default()
        );
    }
}
