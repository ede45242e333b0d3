//! Outputs: an amount, a lock constraint, and zero or more trailing
//! constraints.
//!
//! Recognized constraint kinds mirror the ledger's constraint library:
//! `amount` (implicit in the body), `lock_ed25519`, `lock_chain`, `stem`,
//! `chain`, `sequencer`, `milestone_data`. The scripting evaluator itself is
//! out of scope; outputs are parsed structures validated by
//! [`crate::workflow::evaluator`].

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ChainID, OutputID};
use crate::{hash_blake2b, Hash};

/// Index value meaning "absent" wherever a one-byte index is optional.
pub const NO_INDEX: u8 = 0xff;

/// An Ed25519 address: Blake2b-256 of the public key.
pub type Address = Hash;

/// Derive the address of an Ed25519 public key.
pub fn address_from_public_key(public_key: &[u8; 32]) -> Address {
    hash_blake2b(public_key)
}

/// The lock constraint of an output — who can consume it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lock {
    /// `lock_ed25519`: unlockable by a signature of the addressed key.
    Ed25519(Address),
    /// `lock_chain`: unlockable by the controller of the chain id, by
    /// consuming it together with the chain's own output (tag-along).
    Chain(ChainID),
    /// `stem`: the unique supply-tracking lock of a branch. References the
    /// predecessor branch's stem output and carries global counters.
    Stem(StemLock),
}

/// Stem lock data: appears exactly once per branch transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemLock {
    /// Stem output of the predecessor branch; all-zero id at genesis.
    pub predecessor_output_id: OutputID,
    /// Total supply after this branch.
    pub supply: u64,
    /// Inflation granted on this slot.
    pub inflation_amount: u64,
}

impl Lock {
    /// Constraint-library name of the lock.
    pub fn name(&self) -> &'static str {
        match self {
            Lock::Ed25519(_) => "lock_ed25519",
            Lock::Chain(_) => "lock_chain",
            Lock::Stem(_) => "stem",
        }
    }

    /// The account this lock is indexed under.
    pub fn account(&self) -> AccountID {
        match self {
            Lock::Ed25519(addr) => AccountID::Address(*addr),
            Lock::Chain(chain_id) => AccountID::ChainLock(*chain_id),
            Lock::Stem(_) => AccountID::Stem,
        }
    }
}

/// Account key for the state's address index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountID {
    Address(Address),
    ChainLock(ChainID),
    Stem,
}

impl AccountID {
    /// Fixed-width key bytes for the state index: tag byte plus 32 bytes.
    pub fn to_bytes(&self) -> [u8; 33] {
        let mut ret = [0u8; 33];
        match self {
            AccountID::Address(addr) => {
                ret[0] = 0;
                ret[1..].copy_from_slice(addr);
            }
            AccountID::ChainLock(chain_id) => {
                ret[0] = 1;
                ret[1..].copy_from_slice(chain_id.as_bytes());
            }
            AccountID::Stem => ret[0] = 2,
        }
        ret
    }
}

/// Trailing constraints after the lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Constraint {
    /// `chain`: threads a chain identity through this output. A nil chain id
    /// marks the chain origin; otherwise `predecessor_input_index` points at
    /// the consumed predecessor.
    Chain(ChainConstraint),
    /// `sequencer`: marks the output as a sequencer chain tip and commits to
    /// the amount kept on-chain.
    Sequencer { amount_on_chain: u64 },
    /// `milestone_data`: free-form sequencer metadata (name and heights),
    /// carried on every milestone's sequencer output.
    MilestoneData(MilestoneData),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConstraint {
    /// Chain identity; nil means this output is the chain origin.
    pub chain_id: ChainID,
    /// Input index of the predecessor chain output; `NO_INDEX` at origin.
    pub predecessor_input_index: u8,
}

impl ChainConstraint {
    pub fn origin() -> Self {
        ChainConstraint {
            chain_id: ChainID::default(),
            predecessor_input_index: NO_INDEX,
        }
    }

    pub fn is_origin(&self) -> bool {
        self.chain_id.is_nil()
    }
}

/// Sequencer milestone metadata carried on the sequencer output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneData {
    pub name: String,
    /// Number of milestones since the chain origin.
    pub chain_height: u32,
    /// Number of branches since the chain origin.
    pub branch_height: u32,
}

/// A produced output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub amount: u64,
    pub lock: Lock,
    pub constraints: Vec<Constraint>,
}

/// Errors decoding output bytes.
#[derive(Clone, Debug, thiserror::Error)]
pub enum OutputError {
    #[error("invalid output bytes: {0}")]
    Decode(String),
}

impl Output {
    pub fn new(amount: u64, lock: Lock) -> Self {
        Output {
            amount,
            lock,
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, c: Constraint) -> Self {
        self.constraints.push(c);
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("output serialization cannot fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, OutputError> {
        bincode::deserialize(data).map_err(|e| OutputError::Decode(e.to_string()))
    }

    /// The chain constraint, if any, with its position in the constraint list.
    pub fn chain_constraint(&self) -> Option<(&ChainConstraint, u8)> {
        self.constraints.iter().enumerate().find_map(|(i, c)| match c {
            Constraint::Chain(cc) => Some((cc, i as u8)),
            _ => None,
        })
    }

    /// Whether the output carries the `sequencer` constraint.
    pub fn is_sequencer_output(&self) -> bool {
        self.constraints
            .iter()
            .any(|c| matches!(c, Constraint::Sequencer { .. }))
    }

    pub fn milestone_data(&self) -> Option<&MilestoneData> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::MilestoneData(md) => Some(md),
            _ => None,
        })
    }

    pub fn stem_lock(&self) -> Option<&StemLock> {
        match &self.lock {
            Lock::Stem(stem) => Some(stem),
            _ => None,
        }
    }

    /// Resolve the chain id of this output given its own id (origin chains
    /// derive their id from the output id).
    pub fn chain_id_at(&self, oid: &OutputID) -> Option<ChainID> {
        let (cc, _) = self.chain_constraint()?;
        if cc.is_origin() {
            Some(ChainID::origin(oid))
        } else {
            Some(cc.chain_id)
        }
    }
}

/// An output together with its id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputWithID {
    pub id: OutputID,
    pub output: Output,
}

impl OutputWithID {
    /// Resolved chain id, if the output is chain-constrained.
    pub fn chain_id(&self) -> Option<ChainID> {
        self.output.chain_id_at(&self.id)
    }
}

impl fmt::Display for OutputWithID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} amount: {} lock: {}",
            self.id.short_string(),
            self.output.amount,
            self.output.lock.name()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LogicalTime, TransactionID};

    fn some_oid() -> OutputID {
        let txid = TransactionID::new(LogicalTime::must_new(1, 10), [7u8; 28], false, false);
        OutputID::new(txid, 0)
    }

    #[test]
    fn output_bytes_roundtrip() {
        let out = Output::new(1_000, Lock::Ed25519([5u8; 32]))
            .with_constraint(Constraint::Chain(ChainConstraint::origin()))
            .with_constraint(Constraint::Sequencer {
                amount_on_chain: 1_000,
            });
        let parsed = Output::from_bytes(&out.to_bytes()).unwrap();
        assert_eq!(out, parsed);
        assert!(parsed.is_sequencer_output());
        assert!(parsed.chain_constraint().unwrap().0.is_origin());
    }

    #[test]
    fn origin_chain_id_resolution() {
        let out = Output::new(10, Lock::Ed25519([0u8; 32]))
            .with_constraint(Constraint::Chain(ChainConstraint::origin()));
        let oid = some_oid();
        assert_eq!(out.chain_id_at(&oid), Some(ChainID::origin(&oid)));

        let explicit = ChainID([9u8; 32]);
        let out2 = Output::new(10, Lock::Ed25519([0u8; 32])).with_constraint(Constraint::Chain(
            ChainConstraint {
                chain_id: explicit,
                predecessor_input_index: 0,
            },
        ));
        assert_eq!(out2.chain_id_at(&oid), Some(explicit));
    }

    #[test]
    fn account_ids_are_distinct() {
        let addr = AccountID::Address([1u8; 32]);
        let chain = AccountID::ChainLock(ChainID([1u8; 32]));
        assert_ne!(addr.to_bytes(), chain.to_bytes());
    }

    #[test]
    fn stem_lock_accessor() {
        let stem = StemLock {
            predecessor_output_id: some_oid(),
            supply: 42,
            inflation_amount: 0,
        };
        let out = Output::new(0, Lock::Stem(stem.clone()));
        assert_eq!(out.stem_lock(), Some(&stem));
        assert_eq!(out.lock.account(), AccountID::Stem);
    }
}
