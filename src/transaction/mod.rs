//! Transaction wire format, parsing and validation.
//!
//! A transaction is a byte-identifiable tree of eight fixed top-level
//! sections:
//!
//! ```text
//! 0  input ids        (array of 34-byte output ids)
//! 1  unlock params    (array, one per input)
//! 2  outputs          (array of output bytes)
//! 3  timestamp        (5 bytes: 4 slot + 1 tick)
//! 4  sequencer + stem output indices (2 bytes, 0xff = absent)
//! 5  input commitment (Blake2b-256 of input-id and endorsement sections)
//! 6  endorsements     (array of 33-byte transaction ids)
//! 7  signature        (96 bytes: 64 signature + 32 public key)
//! ```
//!
//! Each section is a count-prefixed array of length-prefixed elements, so
//! `parse(serialize(tx)) == tx` byte-for-byte. The essence signed by the
//! sender is the concatenation of sections 0, 2, 3, 4, 5, 6.

pub mod builder;
pub mod evaluate;

use ed25519_dalek::{Signature, VerifyingKey};

use crate::constants::MAX_ENDORSEMENTS;
use crate::ledger::output::{
    address_from_public_key, Address, MilestoneData, Output, OutputWithID, NO_INDEX,
};
use crate::ledger::{
    valid_sequencer_pace, valid_transaction_pace, ChainID, LogicalTime, OutputID, Slot,
    TransactionID,
};
use crate::{hash_blake2b, Hash};

/// Section indices of the transaction tree.
pub const SECTION_INPUT_IDS: usize = 0;
pub const SECTION_UNLOCK_PARAMS: usize = 1;
pub const SECTION_OUTPUTS: usize = 2;
pub const SECTION_TIMESTAMP: usize = 3;
pub const SECTION_SEQ_STEM_INDICES: usize = 4;
pub const SECTION_INPUT_COMMITMENT: usize = 5;
pub const SECTION_ENDORSEMENTS: usize = 6;
pub const SECTION_SIGNATURE: usize = 7;
pub const NUM_SECTIONS: usize = 8;

/// Transaction-level validation errors.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TxError {
    #[error("malformed transaction: {0}")]
    Malformed(String),
    #[error("invalid signature")]
    SignatureInvalid,
    #[error("timestamp exceeds upper bound")]
    TimestampUpperBound,
}

fn malformed(msg: impl Into<String>) -> TxError {
    TxError::Malformed(msg.into())
}

// ── section codec ──

fn encode_section(out: &mut Vec<u8>, elements: &[Vec<u8>]) {
    out.extend_from_slice(&(elements.len() as u16).to_be_bytes());
    for el in elements {
        out.extend_from_slice(&(el.len() as u32).to_be_bytes());
        out.extend_from_slice(el);
    }
}

fn decode_section(data: &[u8], pos: &mut usize) -> Result<Vec<Vec<u8>>, TxError> {
    if data.len() < *pos + 2 {
        return Err(malformed("truncated section header"));
    }
    let count = u16::from_be_bytes([data[*pos], data[*pos + 1]]) as usize;
    *pos += 2;
    let mut ret = Vec::with_capacity(count);
    for _ in 0..count {
        if data.len() < *pos + 4 {
            return Err(malformed("truncated element header"));
        }
        let len = u32::from_be_bytes([data[*pos], data[*pos + 1], data[*pos + 2], data[*pos + 3]])
            as usize;
        *pos += 4;
        if data.len() < *pos + len {
            return Err(malformed("truncated element"));
        }
        ret.push(data[*pos..*pos + len].to_vec());
        *pos += len;
    }
    Ok(ret)
}

/// Serialize eight sections into canonical transaction bytes.
pub fn serialize_sections(sections: &[Vec<Vec<u8>>; NUM_SECTIONS]) -> Vec<u8> {
    let mut ret = Vec::new();
    for s in sections {
        encode_section(&mut ret, s);
    }
    ret
}

/// Raw encoded bytes of one section inside canonical transaction bytes.
fn section_bytes(sections: &[Vec<Vec<u8>>; NUM_SECTIONS], idx: usize) -> Vec<u8> {
    let mut ret = Vec::new();
    encode_section(&mut ret, &sections[idx]);
    ret
}

/// Essence bytes: what the sender signs and what the id commits to besides
/// unlock params and the signature itself.
pub fn essence_from_sections(sections: &[Vec<Vec<u8>>; NUM_SECTIONS]) -> Vec<u8> {
    let mut ret = Vec::new();
    for idx in [
        SECTION_INPUT_IDS,
        SECTION_OUTPUTS,
        SECTION_TIMESTAMP,
        SECTION_SEQ_STEM_INDICES,
        SECTION_INPUT_COMMITMENT,
        SECTION_ENDORSEMENTS,
    ] {
        encode_section(&mut ret, &sections[idx]);
    }
    ret
}

/// The input commitment: Blake2b-256 over the encoded input-id and
/// endorsement sections.
pub fn input_commitment_from_sections(sections: &[Vec<Vec<u8>>; NUM_SECTIONS]) -> Hash {
    let mut buf = section_bytes(sections, SECTION_INPUT_IDS);
    buf.extend_from_slice(&section_bytes(sections, SECTION_ENDORSEMENTS));
    hash_blake2b(&buf)
}

/// Sequencer-and-stem metadata extracted from a sequencer milestone.
#[derive(Clone, Debug)]
pub struct SequencerTxData {
    pub sequencer_id: ChainID,
    pub sequencer_output_index: u8,
    /// `NO_INDEX` unless a branch.
    pub stem_output_index: u8,
    /// Index of the consumed chain predecessor input; `NO_INDEX` at origin.
    pub predecessor_input_index: u8,
}

/// Immutable parsed representation of canonical transaction bytes.
#[derive(Clone, Debug)]
pub struct Transaction {
    bytes: Vec<u8>,
    sections: Box<[Vec<Vec<u8>>; NUM_SECTIONS]>,
    inputs: Vec<OutputID>,
    outputs: Vec<Output>,
    endorsements: Vec<TransactionID>,
    timestamp: LogicalTime,
    sequencer_output_index: u8,
    stem_output_index: u8,
    input_commitment: Hash,
    signature: [u8; 64],
    public_key: [u8; 32],
    total_amount: u64,
    sequencer_data: Option<SequencerTxData>,
    id: TransactionID,
}

impl Transaction {
    /// Parse canonical bytes. Performs base (structural) validation only; run
    /// [`Transaction::validate_main`] before admitting the transaction.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, TxError> {
        let mut pos = 0usize;
        let mut sections: [Vec<Vec<u8>>; NUM_SECTIONS] = Default::default();
        for s in sections.iter_mut() {
            *s = decode_section(&bytes, &mut pos)?;
        }
        if pos != bytes.len() {
            return Err(malformed("trailing bytes after transaction tree"));
        }

        let ts_section = &sections[SECTION_TIMESTAMP];
        if ts_section.len() != 1 {
            return Err(malformed("wrong timestamp section"));
        }
        let timestamp = LogicalTime::from_bytes(&ts_section[0])
            .map_err(|e| malformed(format!("timestamp: {}", e)))?;

        let idx_section = &sections[SECTION_SEQ_STEM_INDICES];
        if idx_section.len() != 1 || idx_section[0].len() != 2 {
            return Err(malformed(
                "sequencer and stem output indices must be 2 bytes",
            ));
        }
        let sequencer_output_index = idx_section[0][0];
        let stem_output_index = idx_section[0][1];
        let is_sequencer = sequencer_output_index != NO_INDEX;
        let is_branch = stem_output_index != NO_INDEX;
        if is_branch && !is_sequencer {
            return Err(malformed("branch flag without sequencer flag"));
        }
        if timestamp.is_slot_boundary() && is_sequencer && !is_branch {
            return Err(malformed(
                "a sequencer transaction on the slot boundary must be a branch",
            ));
        }

        let inputs = sections[SECTION_INPUT_IDS]
            .iter()
            .map(|data| OutputID::from_bytes(data))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| malformed(format!("input id: {}", e)))?;
        if inputs.is_empty() {
            return Err(malformed("number of inputs can't be 0"));
        }
        if inputs.len() > u8::MAX as usize {
            return Err(malformed("too many inputs"));
        }
        if sections[SECTION_UNLOCK_PARAMS].len() != inputs.len() {
            return Err(malformed(
                "number of unlock params must be equal to the number of inputs",
            ));
        }

        let outputs = sections[SECTION_OUTPUTS]
            .iter()
            .map(|data| Output::from_bytes(data))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| malformed(format!("output: {}", e)))?;
        if outputs.is_empty() {
            return Err(malformed("number of outputs can't be 0"));
        }
        if outputs.len() > u8::MAX as usize {
            return Err(malformed("too many outputs"));
        }

        let endorsements = sections[SECTION_ENDORSEMENTS]
            .iter()
            .map(|data| TransactionID::from_bytes(data))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| malformed(format!("endorsement: {}", e)))?;

        let commitment_section = &sections[SECTION_INPUT_COMMITMENT];
        if commitment_section.len() != 1 || commitment_section[0].len() != 32 {
            return Err(malformed("input commitment must be 32 bytes"));
        }
        let mut input_commitment = [0u8; 32];
        input_commitment.copy_from_slice(&commitment_section[0]);

        let sig_section = &sections[SECTION_SIGNATURE];
        if sig_section.len() != 1 || sig_section[0].len() != 96 {
            return Err(malformed("signature must be 96 bytes"));
        }
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&sig_section[0][..64]);
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&sig_section[0][64..]);

        let mut total_amount: u64 = 0;
        for (i, out) in outputs.iter().enumerate() {
            total_amount = total_amount
                .checked_add(out.amount)
                .ok_or_else(|| malformed(format!("amount overflow at output #{}", i)))?;
        }

        let id = TransactionID::from_transaction_bytes(&bytes, timestamp, is_sequencer, is_branch);

        let sections = Box::new(sections);
        let sequencer_data = if is_sequencer {
            Some(scan_sequencer_data(
                &outputs,
                &inputs,
                id,
                sequencer_output_index,
                stem_output_index,
            )?)
        } else {
            None
        };

        Ok(Transaction {
            bytes,
            sections,
            inputs,
            outputs,
            endorsements,
            timestamp,
            sequencer_output_index,
            stem_output_index,
            input_commitment,
            signature,
            public_key,
            total_amount,
            sequencer_data,
            id,
        })
    }

    /// The full validation suite applied at ingress, after base parsing:
    /// input/endorsement uniqueness, time pace, endorsement rules, the input
    /// commitment, and the sender signature.
    pub fn validate_main(&self) -> Result<(), TxError> {
        self.validate_uniqueness()?;
        self.validate_time_pace()?;
        self.validate_endorsements()?;
        self.validate_input_commitment()?;
        self.validate_signature()?;
        Ok(())
    }

    fn validate_uniqueness(&self) -> Result<(), TxError> {
        let mut seen = std::collections::HashSet::new();
        for (i, oid) in self.inputs.iter().enumerate() {
            if !seen.insert(*oid) {
                return Err(malformed(format!("repeating input @ {}", i)));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for (i, txid) in self.endorsements.iter().enumerate() {
            if !seen.insert(*txid) {
                return Err(malformed(format!("repeating endorsement @ {}", i)));
            }
        }
        Ok(())
    }

    fn validate_time_pace(&self) -> Result<(), TxError> {
        let pace_ok: fn(LogicalTime, LogicalTime) -> bool = if self.is_sequencer_milestone() {
            valid_sequencer_pace
        } else {
            valid_transaction_pace
        };
        for oid in &self.inputs {
            if !pace_ok(oid.timestamp(), self.timestamp) {
                return Err(malformed(format!(
                    "timestamp of input violates time pace constraint: {}",
                    oid.short_string()
                )));
            }
        }
        Ok(())
    }

    fn validate_endorsements(&self) -> Result<(), TxError> {
        if !self.is_sequencer_milestone() && !self.endorsements.is_empty() {
            return Err(malformed(
                "non-sequencer transaction can't contain endorsements",
            ));
        }
        if self.endorsements.len() > MAX_ENDORSEMENTS {
            return Err(malformed(format!(
                "number of endorsements exceeds limit of {}",
                MAX_ENDORSEMENTS
            )));
        }
        let slot = self.timestamp.slot();
        for txid in &self.endorsements {
            if !txid.is_sequencer_milestone() {
                return Err(malformed(format!(
                    "endorsement of non-sequencer transaction: {}",
                    txid.short_string()
                )));
            }
            if txid.slot() != slot {
                return Err(malformed(format!(
                    "can't endorse transaction from another slot: {}",
                    txid.short_string()
                )));
            }
            if !valid_sequencer_pace(txid.timestamp(), self.timestamp) {
                return Err(malformed(format!(
                    "endorsement violates time pace constraint: {}",
                    txid.short_string()
                )));
            }
        }
        Ok(())
    }

    fn validate_input_commitment(&self) -> Result<(), TxError> {
        let expected = input_commitment_from_sections(&self.sections);
        if expected != self.input_commitment {
            return Err(malformed("input commitment mismatch"));
        }
        Ok(())
    }

    fn validate_signature(&self) -> Result<(), TxError> {
        let key =
            VerifyingKey::from_bytes(&self.public_key).map_err(|_| TxError::SignatureInvalid)?;
        let sig = Signature::from_bytes(&self.signature);
        key.verify_strict(&self.essence_bytes(), &sig)
            .map_err(|_| TxError::SignatureInvalid)
    }

    /// Reject transactions too far in the logical future. Enforced only for
    /// peer/API sources.
    pub fn validate_timestamp_upper_bound(&self, upper: LogicalTime) -> Result<(), TxError> {
        if self.timestamp > upper {
            return Err(TxError::TimestampUpperBound);
        }
        Ok(())
    }

    // ── accessors ──

    pub fn id(&self) -> TransactionID {
        self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn timestamp(&self) -> LogicalTime {
        self.timestamp
    }

    pub fn slot(&self) -> Slot {
        self.timestamp.slot()
    }

    pub fn is_sequencer_milestone(&self) -> bool {
        self.sequencer_output_index != NO_INDEX
    }

    pub fn is_branch(&self) -> bool {
        self.is_sequencer_milestone() && self.stem_output_index != NO_INDEX
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_produced_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn num_endorsements(&self) -> usize {
        self.endorsements.len()
    }

    pub fn inputs(&self) -> &[OutputID] {
        &self.inputs
    }

    pub fn input_at(&self, idx: u8) -> Option<OutputID> {
        self.inputs.get(idx as usize).copied()
    }

    pub fn endorsements(&self) -> &[TransactionID] {
        &self.endorsements
    }

    pub fn endorsement_at(&self, idx: usize) -> Option<TransactionID> {
        self.endorsements.get(idx).copied()
    }

    pub fn produced_output_at(&self, idx: u8) -> Option<&Output> {
        self.outputs.get(idx as usize)
    }

    pub fn produced_outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn output_id(&self, idx: u8) -> OutputID {
        OutputID::new(self.id, idx)
    }

    pub fn produced_output_with_id_at(&self, idx: u8) -> Option<OutputWithID> {
        self.produced_output_at(idx).map(|out| OutputWithID {
            id: self.output_id(idx),
            output: out.clone(),
        })
    }

    /// Sum of all produced output amounts.
    pub fn total_amount(&self) -> u64 {
        self.total_amount
    }

    pub fn sender_address(&self) -> Address {
        address_from_public_key(&self.public_key)
    }

    pub fn sequencer_data(&self) -> Option<&SequencerTxData> {
        self.sequencer_data.as_ref()
    }

    pub fn sequencer_output(&self) -> Option<OutputWithID> {
        let data = self.sequencer_data.as_ref()?;
        self.produced_output_with_id_at(data.sequencer_output_index)
    }

    pub fn stem_output(&self) -> Option<OutputWithID> {
        if !self.is_branch() {
            return None;
        }
        self.produced_output_with_id_at(self.stem_output_index)
    }

    /// Inflation granted by this transaction (branches only, via the stem).
    pub fn inflation_amount(&self) -> u64 {
        self.stem_output()
            .and_then(|o| o.output.stem_lock().map(|s| s.inflation_amount))
            .unwrap_or(0)
    }

    /// The consumed chain predecessor output of a sequencer milestone, with
    /// the input index. `None` at chain origin.
    pub fn sequencer_chain_predecessor(&self) -> Option<(OutputID, u8)> {
        let data = self.sequencer_data.as_ref()?;
        if data.predecessor_input_index == NO_INDEX {
            return None;
        }
        self.input_at(data.predecessor_input_index)
            .map(|oid| (oid, data.predecessor_input_index))
    }

    /// Find the produced output continuing `chain_id`, if any.
    pub fn find_chain_output(&self, chain_id: &ChainID) -> Option<OutputWithID> {
        for (idx, out) in self.outputs.iter().enumerate() {
            let oid = self.output_id(idx as u8);
            if out.chain_id_at(&oid) == Some(*chain_id) {
                return Some(OutputWithID {
                    id: oid,
                    output: out.clone(),
                });
            }
        }
        None
    }

    pub fn milestone_data(&self) -> Option<&MilestoneData> {
        let data = self.sequencer_data.as_ref()?;
        self.produced_output_at(data.sequencer_output_index)?
            .milestone_data()
    }

    pub fn essence_bytes(&self) -> Vec<u8> {
        essence_from_sections(&self.sections)
    }

    /// Blake2b of input ids and endorsements; used to deduplicate proposals
    /// regardless of other transaction content.
    pub fn hash_inputs_and_endorsements(&self) -> Hash {
        input_commitment_from_sections(&self.sections)
    }

    /// All transactions this one references: input producers and endorsed
    /// milestones.
    pub fn predecessor_tx_ids(&self) -> std::collections::HashSet<TransactionID> {
        let mut ret: std::collections::HashSet<TransactionID> =
            self.inputs.iter().map(|oid| oid.tx_id()).collect();
        ret.extend(self.endorsements.iter().copied());
        ret
    }
}

fn scan_sequencer_data(
    outputs: &[Output],
    inputs: &[OutputID],
    id: TransactionID,
    sequencer_output_index: u8,
    stem_output_index: u8,
) -> Result<SequencerTxData, TxError> {
    let seq_out = outputs
        .get(sequencer_output_index as usize)
        .ok_or_else(|| malformed("wrong sequencer output index"))?;
    let (chain_constraint, _) = seq_out
        .chain_constraint()
        .ok_or_else(|| malformed("sequencer output has no chain constraint"))?;
    if !seq_out.is_sequencer_output() {
        return Err(malformed("invalid sequencer output data"));
    }

    let (sequencer_id, predecessor_input_index) = if chain_constraint.is_origin() {
        (
            ChainID::origin(&OutputID::new(id, sequencer_output_index)),
            NO_INDEX,
        )
    } else {
        let pred_idx = chain_constraint.predecessor_input_index;
        if pred_idx as usize >= inputs.len() {
            return Err(malformed("chain predecessor input index out of range"));
        }
        (chain_constraint.chain_id, pred_idx)
    };

    if stem_output_index != NO_INDEX {
        if stem_output_index == sequencer_output_index {
            return Err(malformed("wrong stem output index"));
        }
        let stem_out = outputs
            .get(stem_output_index as usize)
            .ok_or_else(|| malformed("wrong stem output index"))?;
        if stem_out.stem_lock().is_none() {
            return Err(malformed("not a stem lock"));
        }
    }

    Ok(SequencerTxData {
        sequencer_id,
        sequencer_output_index,
        stem_output_index,
        predecessor_input_index,
    })
}

#[cfg(test)]
mod tests {
    use super::builder::TransactionBuilder;
    use super::*;
    use crate::ledger::output::{ChainConstraint, Constraint, Lock};
    use ed25519_dalek::SigningKey;

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    fn input_oid(slot: Slot, tick: u8, seed: u8) -> OutputID {
        let txid =
            TransactionID::new(LogicalTime::must_new(slot, tick), [seed; 28], false, false);
        OutputID::new(txid, 0)
    }

    fn simple_tx_bytes() -> Vec<u8> {
        let mut b = TransactionBuilder::new(LogicalTime::must_new(2, 50));
        b.put_input(
            input_oid(2, 10, 1),
            Output::new(1_000, Lock::Ed25519([1u8; 32])),
        );
        b.put_output(Output::new(1_000, Lock::Ed25519([2u8; 32])));
        b.build_and_sign(&key())
    }

    #[test]
    fn parse_serialize_roundtrip() {
        let bytes = simple_tx_bytes();
        let tx = Transaction::from_bytes(bytes.clone()).unwrap();
        assert_eq!(tx.bytes(), &bytes[..]);
        let tx2 = Transaction::from_bytes(tx.bytes().to_vec()).unwrap();
        assert_eq!(tx.id(), tx2.id());
        assert_eq!(tx.timestamp(), LogicalTime::must_new(2, 50));
        assert!(!tx.is_sequencer_milestone());
    }

    #[test]
    fn main_validation_passes_for_well_formed() {
        let tx = Transaction::from_bytes(simple_tx_bytes()).unwrap();
        tx.validate_main().unwrap();
        assert_eq!(tx.total_amount(), 1_000);
    }

    #[test]
    fn produced_outputs_match_built_ones() {
        let tx = Transaction::from_bytes(simple_tx_bytes()).unwrap();
        let out = tx.produced_output_at(0).unwrap();
        assert_eq!(out.amount, 1_000);
        assert_eq!(tx.produced_output_with_id_at(0).unwrap().id, tx.output_id(0));
        assert!(tx.produced_output_at(1).is_none());
    }

    #[test]
    fn tampered_bytes_fail() {
        let mut bytes = simple_tx_bytes();
        let n = bytes.len();
        bytes[n / 2] ^= 0x01;
        match Transaction::from_bytes(bytes) {
            Ok(tx) => assert!(tx.validate_main().is_err()),
            Err(_) => {}
        }
    }

    #[test]
    fn empty_inputs_rejected() {
        let mut b = TransactionBuilder::new(LogicalTime::must_new(2, 50));
        b.put_output(Output::new(1, Lock::Ed25519([2u8; 32])));
        let bytes = b.build_and_sign(&key());
        assert!(Transaction::from_bytes(bytes).is_err());
    }

    #[test]
    fn endorsement_on_non_sequencer_rejected() {
        let mut b = TransactionBuilder::new(LogicalTime::must_new(2, 50));
        b.put_input(
            input_oid(2, 10, 1),
            Output::new(1_000, Lock::Ed25519([1u8; 32])),
        );
        b.put_output(Output::new(1_000, Lock::Ed25519([2u8; 32])));
        b.put_endorsement(TransactionID::new(
            LogicalTime::must_new(2, 20),
            [3u8; 28],
            true,
            false,
        ));
        let bytes = b.build_and_sign(&key());
        let tx = Transaction::from_bytes(bytes).unwrap();
        assert!(tx.validate_main().is_err());
    }

    #[test]
    fn cross_slot_endorsement_rejected() {
        let mut b = TransactionBuilder::new(LogicalTime::must_new(2, 50));
        b.put_input(
            input_oid(2, 40, 1),
            Output::new(1_000, Lock::Ed25519([1u8; 32])),
        );
        let seq_out = Output::new(1_000, Lock::Ed25519([2u8; 32]))
            .with_constraint(Constraint::Chain(ChainConstraint::origin()))
            .with_constraint(Constraint::Sequencer {
                amount_on_chain: 1_000,
            });
        b.put_output(seq_out);
        b.set_sequencer_output_index(0);
        b.put_endorsement(TransactionID::new(
            LogicalTime::must_new(1, 20),
            [3u8; 28],
            true,
            false,
        ));
        let bytes = b.build_and_sign(&key());
        let tx = Transaction::from_bytes(bytes).unwrap();
        assert!(tx.validate_main().is_err());
    }

    #[test]
    fn time_pace_violation_rejected() {
        let mut b = TransactionBuilder::new(LogicalTime::must_new(2, 15));
        b.put_input(
            input_oid(2, 10, 1),
            Output::new(1_000, Lock::Ed25519([1u8; 32])),
        );
        b.put_output(Output::new(1_000, Lock::Ed25519([2u8; 32])));
        let tx = Transaction::from_bytes(b.build_and_sign(&key())).unwrap();
        assert!(tx.validate_main().is_err());
    }

    #[test]
    fn timestamp_upper_bound() {
        let tx = Transaction::from_bytes(simple_tx_bytes()).unwrap();
        assert!(tx
            .validate_timestamp_upper_bound(LogicalTime::must_new(1, 0))
            .is_err());
        assert!(tx
            .validate_timestamp_upper_bound(LogicalTime::must_new(100, 0))
            .is_ok());
    }

    #[test]
    fn repeated_input_rejected() {
        let mut b = TransactionBuilder::new(LogicalTime::must_new(2, 50));
        let oid = input_oid(2, 10, 1);
        b.put_input(oid, Output::new(500, Lock::Ed25519([1u8; 32])));
        b.put_input(oid, Output::new(500, Lock::Ed25519([1u8; 32])));
        b.put_output(Output::new(1_000, Lock::Ed25519([2u8; 32])));
        let tx = Transaction::from_bytes(b.build_and_sign(&key())).unwrap();
        assert!(tx.validate_main().is_err());
    }

    #[test]
    fn sequencer_tick0_must_be_branch() {
        // a sequencer milestone on the slot boundary without a stem output
        let mut b = TransactionBuilder::new(LogicalTime::must_new(3, 0));
        b.put_input(
            input_oid(2, 40, 1),
            Output::new(1_000, Lock::Ed25519([1u8; 32])),
        );
        let seq_out = Output::new(1_000, Lock::Ed25519([2u8; 32]))
            .with_constraint(Constraint::Chain(ChainConstraint::origin()))
            .with_constraint(Constraint::Sequencer {
                amount_on_chain: 1_000,
            });
        b.put_output(seq_out);
        b.set_sequencer_output_index(0);
        let bytes = b.build_and_sign(&key());
        assert!(Transaction::from_bytes(bytes).is_err());
    }
}
