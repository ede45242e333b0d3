//! Core ledger identifiers and logical time.
//!
//! Everything on the tangle is addressed by `TransactionID` (33 bytes: 5-byte
//! timestamp prefix carrying the sequencer/branch flag bits, then 28 bytes of
//! truncated Blake2b-256 of the transaction bytes) and `OutputID`
//! (`TransactionID` plus a one-byte output index).
//!
//! `LogicalTime` is a (slot, tick) pair. Tick 0 on a slot boundary is reserved
//! for branch transactions; the time-pace rule requires a minimum tick
//! distance between an output and its consumer.

pub mod coverage;
pub mod identity;
pub mod output;

use std::cmp::Ordering;
use std::fmt;

use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{SEQUENCER_PACE, TICKS_PER_SLOT, TRANSACTION_PACE};
use crate::{hash_blake2b, Hash};

/// Byte length of a serialized `TransactionID`.
pub const TRANSACTION_ID_LENGTH: usize = 33;
/// Byte length of a serialized `OutputID`.
pub const OUTPUT_ID_LENGTH: usize = TRANSACTION_ID_LENGTH + 1;
/// Byte length of a serialized timestamp (4 slot bytes + 1 tick byte).
pub const TIMESTAMP_LENGTH: usize = 5;
/// Length of the transaction hash part inside a `TransactionID`.
pub const TX_HASH_LENGTH: usize = TRANSACTION_ID_LENGTH - TIMESTAMP_LENGTH;

/// Flag bit on byte 0 of a `TransactionID`: the transaction is a sequencer
/// milestone.
pub const SEQUENCER_FLAG: u8 = 0x80;
/// Flag bit on byte 0 of a `TransactionID`: the transaction is a branch.
pub const BRANCH_FLAG: u8 = 0x40;

/// A time slot index. 30-bit; the two high bits of the serialized slot carry
/// the transaction flags.
pub type Slot = u32;

/// Largest representable slot (30 bits).
pub const MAX_SLOT: Slot = (1 << 30) - 1;

/// Truncated transaction hash (the non-timestamp part of a `TransactionID`).
pub type TxHash = [u8; TX_HASH_LENGTH];

/// Logical time: (slot, tick). One slot is `TICKS_PER_SLOT` ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalTime {
    slot: Slot,
    tick: u8,
}

/// Errors parsing ledger identifiers.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("wrong timestamp data length")]
    WrongTimestampLength,
    #[error("slot value out of range")]
    SlotOutOfRange,
    #[error("tick value {0} exceeds ticks per slot")]
    TickOutOfRange(u8),
    #[error("wrong transaction id data length")]
    WrongTransactionIdLength,
    #[error("wrong output id data length")]
    WrongOutputIdLength,
    #[error("wrong chain id data length")]
    WrongChainIdLength,
    #[error("branch flag without sequencer flag")]
    BranchWithoutSequencer,
    #[error("sequencer transaction on slot boundary must be a branch")]
    SequencerOnBoundaryNotBranch,
}

impl LogicalTime {
    /// Construct, checking both components.
    pub fn new(slot: Slot, tick: u8) -> Result<Self, IdParseError> {
        if slot > MAX_SLOT {
            return Err(IdParseError::SlotOutOfRange);
        }
        if tick >= TICKS_PER_SLOT {
            return Err(IdParseError::TickOutOfRange(tick));
        }
        Ok(LogicalTime { slot, tick })
    }

    /// Construct without range checks. Panics on out-of-range values.
    pub fn must_new(slot: Slot, tick: u8) -> Self {
        Self::new(slot, tick).expect("logical time out of range")
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn tick(&self) -> u8 {
        self.tick
    }

    /// Tick 0 of any slot is the slot boundary, reserved for branches.
    pub fn is_slot_boundary(&self) -> bool {
        self.tick == 0
    }

    /// Absolute tick count since slot 0 tick 0.
    pub fn total_ticks(&self) -> u64 {
        self.slot as u64 * TICKS_PER_SLOT as u64 + self.tick as u64
    }

    /// Logical time `ticks` ticks after `self`.
    pub fn add_ticks(&self, ticks: u64) -> LogicalTime {
        let total = self.total_ticks() + ticks;
        LogicalTime {
            slot: (total / TICKS_PER_SLOT as u64) as Slot,
            tick: (total % TICKS_PER_SLOT as u64) as u8,
        }
    }

    /// The next slot boundary strictly after `self`.
    pub fn next_slot_boundary(&self) -> LogicalTime {
        LogicalTime {
            slot: self.slot + 1,
            tick: 0,
        }
    }

    /// Serialize: 4 slot bytes big-endian, then the tick byte.
    pub fn to_bytes(&self) -> [u8; TIMESTAMP_LENGTH] {
        let mut ret = [0u8; TIMESTAMP_LENGTH];
        ret[..4].copy_from_slice(&self.slot.to_be_bytes());
        ret[4] = self.tick;
        ret
    }

    /// Parse from 5 bytes. The two high bits of byte 0 (transaction flags in
    /// an id context) are masked off.
    pub fn from_bytes(data: &[u8]) -> Result<Self, IdParseError> {
        if data.len() != TIMESTAMP_LENGTH {
            return Err(IdParseError::WrongTimestampLength);
        }
        let mut slot_bytes = [0u8; 4];
        slot_bytes.copy_from_slice(&data[..4]);
        slot_bytes[0] &= !(SEQUENCER_FLAG | BRANCH_FLAG);
        let slot = Slot::from_be_bytes(slot_bytes);
        LogicalTime::new(slot, data[4])
    }
}

impl PartialOrd for LogicalTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogicalTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_ticks().cmp(&other.total_ticks())
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.slot, self.tick)
    }
}

/// The time-pace rule: at least `pace` ticks must pass between `earlier` and
/// `later`.
pub fn valid_time_pace(earlier: LogicalTime, later: LogicalTime, pace: u8) -> bool {
    later.total_ticks() >= earlier.total_ticks() + pace as u64
}

/// Time pace for ordinary transactions consuming an output.
pub fn valid_transaction_pace(earlier: LogicalTime, later: LogicalTime) -> bool {
    valid_time_pace(earlier, later, TRANSACTION_PACE)
}

/// Time pace for sequencer milestones (chain steps and endorsements).
pub fn valid_sequencer_pace(earlier: LogicalTime, later: LogicalTime) -> bool {
    valid_time_pace(earlier, later, SEQUENCER_PACE)
}

/// Unique transaction identifier: timestamp prefix with flag bits, then the
/// truncated transaction hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionID([u8; TRANSACTION_ID_LENGTH]);

impl TransactionID {
    pub fn new(
        timestamp: LogicalTime,
        tx_hash: TxHash,
        sequencer_milestone: bool,
        branch: bool,
    ) -> Self {
        debug_assert!(!branch || sequencer_milestone);
        let mut bytes = [0u8; TRANSACTION_ID_LENGTH];
        bytes[..TIMESTAMP_LENGTH].copy_from_slice(&timestamp.to_bytes());
        if sequencer_milestone {
            bytes[0] |= SEQUENCER_FLAG;
        }
        if branch {
            bytes[0] |= BRANCH_FLAG;
        }
        bytes[TIMESTAMP_LENGTH..].copy_from_slice(&tx_hash);
        TransactionID(bytes)
    }

    /// The id of a transaction given its canonical bytes and parsed header
    /// facts.
    pub fn from_transaction_bytes(
        tx_bytes: &[u8],
        timestamp: LogicalTime,
        sequencer_milestone: bool,
        branch: bool,
    ) -> Self {
        Self::new(
            timestamp,
            hash_tx_bytes(tx_bytes),
            sequencer_milestone,
            branch,
        )
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, IdParseError> {
        if data.len() != TRANSACTION_ID_LENGTH {
            return Err(IdParseError::WrongTransactionIdLength);
        }
        let mut bytes = [0u8; TRANSACTION_ID_LENGTH];
        bytes.copy_from_slice(data);
        let ret = TransactionID(bytes);
        if ret.is_branch() && !ret.is_sequencer_milestone() {
            return Err(IdParseError::BranchWithoutSequencer);
        }
        // validate the embedded timestamp
        let ts = LogicalTime::from_bytes(&data[..TIMESTAMP_LENGTH])?;
        if ts.is_slot_boundary() && ret.is_sequencer_milestone() && !ret.is_branch() {
            return Err(IdParseError::SequencerOnBoundaryNotBranch);
        }
        Ok(ret)
    }

    pub fn as_bytes(&self) -> &[u8; TRANSACTION_ID_LENGTH] {
        &self.0
    }

    pub fn is_sequencer_milestone(&self) -> bool {
        self.0[0] & SEQUENCER_FLAG != 0
    }

    pub fn is_branch(&self) -> bool {
        self.0[0] & BRANCH_FLAG != 0
    }

    pub fn timestamp(&self) -> LogicalTime {
        LogicalTime::from_bytes(&self.0[..TIMESTAMP_LENGTH]).expect("valid by construction")
    }

    pub fn slot(&self) -> Slot {
        self.timestamp().slot()
    }

    pub fn tx_hash(&self) -> TxHash {
        let mut ret = [0u8; TX_HASH_LENGTH];
        ret.copy_from_slice(&self.0[TIMESTAMP_LENGTH..]);
        ret
    }

    /// Time-aware ordering: slot-major, tick-minor, hash tiebreak.
    pub fn cmp_by_time(&self, other: &Self) -> Ordering {
        self.timestamp()
            .cmp(&other.timestamp())
            .then_with(|| self.0.cmp(&other.0))
    }

    /// Short human form: `[slot|tick(flags)]hash-prefix`.
    pub fn short_string(&self) -> String {
        let ts = self.timestamp();
        let flags = match (self.is_sequencer_milestone(), self.is_branch()) {
            (true, true) => "br",
            (true, false) => "sq",
            _ => "",
        };
        format!("[{}{}]{}", ts, flags, hex::encode(&self.0[5..9]))
    }
}

impl fmt::Display for TransactionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TransactionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionID({})", self.short_string())
    }
}

impl Serialize for TransactionID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct TxIdVisitor;

impl<'de> Visitor<'de> for TxIdVisitor {
    type Value = TransactionID;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "33 bytes of transaction id")
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        TransactionID::from_bytes(v).map_err(E::custom)
    }

    fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut bytes = Vec::with_capacity(TRANSACTION_ID_LENGTH);
        while let Some(b) = seq.next_element::<u8>()? {
            bytes.push(b);
        }
        TransactionID::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for TransactionID {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(TxIdVisitor)
    }
}

/// Hash of the canonical transaction bytes, truncated to fit the id.
pub fn hash_tx_bytes(tx_bytes: &[u8]) -> TxHash {
    let full = hash_blake2b(tx_bytes);
    let mut ret = [0u8; TX_HASH_LENGTH];
    ret.copy_from_slice(&full[..TX_HASH_LENGTH]);
    ret
}

/// Identifies one produced output: the producing transaction plus the output
/// index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputID {
    tx_id: TransactionID,
    index: u8,
}

impl OutputID {
    pub fn new(tx_id: TransactionID, index: u8) -> Self {
        OutputID { tx_id, index }
    }

    pub fn tx_id(&self) -> TransactionID {
        self.tx_id
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn timestamp(&self) -> LogicalTime {
        self.tx_id.timestamp()
    }

    pub fn slot(&self) -> Slot {
        self.tx_id.slot()
    }

    pub fn to_bytes(&self) -> [u8; OUTPUT_ID_LENGTH] {
        let mut ret = [0u8; OUTPUT_ID_LENGTH];
        ret[..TRANSACTION_ID_LENGTH].copy_from_slice(self.tx_id.as_bytes());
        ret[TRANSACTION_ID_LENGTH] = self.index;
        ret
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, IdParseError> {
        if data.len() != OUTPUT_ID_LENGTH {
            return Err(IdParseError::WrongOutputIdLength);
        }
        Ok(OutputID {
            tx_id: TransactionID::from_bytes(&data[..TRANSACTION_ID_LENGTH])?,
            index: data[TRANSACTION_ID_LENGTH],
        })
    }

    pub fn short_string(&self) -> String {
        format!("{}[{}]", self.tx_id.short_string(), self.index)
    }
}

impl fmt::Display for OutputID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.tx_id, self.index)
    }
}

impl fmt::Debug for OutputID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputID({})", self.short_string())
    }
}

/// Stable 32-byte identity threaded through a sequence of outputs via chain
/// constraints.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainID(pub Hash);

impl ChainID {
    /// The chain id of a chain whose origin output is `oid`.
    pub fn origin(oid: &OutputID) -> Self {
        ChainID(hash_blake2b(&oid.to_bytes()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, IdParseError> {
        if data.len() != 32 {
            return Err(IdParseError::WrongChainIdLength);
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(data);
        Ok(ChainID(bytes))
    }

    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }

    /// All-zero chain id: a chain constraint carrying it marks the origin.
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn short_string(&self) -> String {
        format!("${}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for ChainID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", hex::encode(self.0))
    }
}

impl fmt::Debug for ChainID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainID({})", self.short_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_time_roundtrip() {
        let ts = LogicalTime::must_new(12345, 67);
        let parsed = LogicalTime::from_bytes(&ts.to_bytes()).unwrap();
        assert_eq!(ts, parsed);
    }

    #[test]
    fn logical_time_masks_flag_bits() {
        let ts = LogicalTime::must_new(7, 3);
        let mut bytes = ts.to_bytes();
        bytes[0] |= SEQUENCER_FLAG | BRANCH_FLAG;
        assert_eq!(LogicalTime::from_bytes(&bytes).unwrap(), ts);
    }

    #[test]
    fn logical_time_rejects_bad_tick() {
        assert!(LogicalTime::new(0, TICKS_PER_SLOT).is_err());
    }

    #[test]
    fn time_pace() {
        let a = LogicalTime::must_new(1, 50);
        assert!(valid_transaction_pace(a, LogicalTime::must_new(1, 60)));
        assert!(!valid_transaction_pace(a, LogicalTime::must_new(1, 59)));
        // pace crosses slot boundary
        assert!(valid_transaction_pace(
            LogicalTime::must_new(1, 95),
            LogicalTime::must_new(2, 5)
        ));
        assert!(valid_sequencer_pace(a, LogicalTime::must_new(1, 51)));
        assert!(!valid_sequencer_pace(a, a));
    }

    #[test]
    fn transaction_id_flags() {
        let ts = LogicalTime::must_new(10, 5);
        let id = TransactionID::new(ts, [1u8; TX_HASH_LENGTH], true, false);
        assert!(id.is_sequencer_milestone());
        assert!(!id.is_branch());
        assert_eq!(id.timestamp(), ts);

        let branch = TransactionID::new(LogicalTime::must_new(10, 0), [1u8; 28], true, true);
        assert!(branch.is_branch());
        assert_eq!(branch.timestamp().tick(), 0);
    }

    #[test]
    fn transaction_id_roundtrip() {
        let id = TransactionID::new(LogicalTime::must_new(3, 17), [9u8; 28], true, false);
        let parsed = TransactionID::from_bytes(id.as_bytes()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn transaction_id_rejects_seq_on_boundary_non_branch() {
        let id = TransactionID::new(LogicalTime::must_new(3, 0), [9u8; 28], true, false);
        assert_eq!(
            TransactionID::from_bytes(id.as_bytes()),
            Err(IdParseError::SequencerOnBoundaryNotBranch)
        );
    }

    #[test]
    fn time_aware_ordering() {
        let a = TransactionID::new(LogicalTime::must_new(1, 10), [0u8; 28], false, false);
        let b = TransactionID::new(LogicalTime::must_new(1, 20), [0u8; 28], false, false);
        let c = TransactionID::new(LogicalTime::must_new(2, 0), [0u8; 28], false, false);
        assert_eq!(a.cmp_by_time(&b), Ordering::Less);
        assert_eq!(b.cmp_by_time(&c), Ordering::Less);
        // same time: hash tiebreak
        let d = TransactionID::new(LogicalTime::must_new(1, 10), [1u8; 28], false, false);
        assert_eq!(a.cmp_by_time(&d), Ordering::Less);
    }

    #[test]
    fn output_id_roundtrip() {
        let txid = TransactionID::new(LogicalTime::must_new(5, 5), [3u8; 28], false, false);
        let oid = OutputID::new(txid, 7);
        let parsed = OutputID::from_bytes(&oid.to_bytes()).unwrap();
        assert_eq!(oid, parsed);
        assert_eq!(parsed.index(), 7);
        assert_eq!(parsed.tx_id(), txid);
    }

    #[test]
    fn origin_chain_id_is_deterministic() {
        let txid = TransactionID::new(LogicalTime::must_new(5, 5), [3u8; 28], false, false);
        let oid = OutputID::new(txid, 0);
        assert_eq!(ChainID::origin(&oid), ChainID::origin(&oid));
        assert_ne!(
            ChainID::origin(&oid),
            ChainID::origin(&OutputID::new(txid, 1))
        );
    }
}
