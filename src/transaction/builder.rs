//! Transaction construction: plain transfers and sequencer milestones.

use ed25519_dalek::{Signer, SigningKey};

use super::{
    essence_from_sections, input_commitment_from_sections, serialize_sections, NUM_SECTIONS,
    SECTION_ENDORSEMENTS, SECTION_INPUT_COMMITMENT, SECTION_INPUT_IDS, SECTION_OUTPUTS,
    SECTION_SEQ_STEM_INDICES, SECTION_SIGNATURE, SECTION_TIMESTAMP, SECTION_UNLOCK_PARAMS,
};
use crate::ledger::output::{
    address_from_public_key, Address, ChainConstraint, Constraint, Lock, MilestoneData, Output,
    OutputWithID, StemLock, NO_INDEX,
};
use crate::ledger::{ChainID, LogicalTime, OutputID, TransactionID};

/// Errors constructing a transaction.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BuildError {
    #[error("not enough funds: have {have}, need {need}")]
    NotEnoughFunds { have: u64, need: u64 },
    #[error("no inputs provided")]
    NoInputs,
    #[error("chain input is not chain-constrained")]
    NotAChainInput,
    #[error("stem input is not stem-locked")]
    NotAStemInput,
}

/// Low-level builder assembling the eight wire sections.
pub struct TransactionBuilder {
    timestamp: LogicalTime,
    inputs: Vec<OutputID>,
    consumed: Vec<Output>,
    unlock_params: Vec<Vec<u8>>,
    outputs: Vec<Output>,
    endorsements: Vec<TransactionID>,
    sequencer_output_index: u8,
    stem_output_index: u8,
}

impl TransactionBuilder {
    pub fn new(timestamp: LogicalTime) -> Self {
        TransactionBuilder {
            timestamp,
            inputs: Vec::new(),
            consumed: Vec::new(),
            unlock_params: Vec::new(),
            outputs: Vec::new(),
            endorsements: Vec::new(),
            sequencer_output_index: NO_INDEX,
            stem_output_index: NO_INDEX,
        }
    }

    /// Add an input consuming `oid`. The consumed output is kept for amount
    /// bookkeeping and unlock-parameter derivation.
    pub fn put_input(&mut self, oid: OutputID, consumed: Output) -> u8 {
        let idx = self.inputs.len() as u8;
        // the unlock parameter convention: ed25519 locks are witnessed by the
        // transaction signature itself; everything else points at output 0
        let param = match consumed.lock {
            Lock::Ed25519(_) => Vec::new(),
            _ => vec![0u8],
        };
        self.inputs.push(oid);
        self.consumed.push(consumed);
        self.unlock_params.push(param);
        idx
    }

    pub fn put_output(&mut self, output: Output) -> u8 {
        let idx = self.outputs.len() as u8;
        self.outputs.push(output);
        idx
    }

    pub fn put_endorsement(&mut self, txid: TransactionID) {
        self.endorsements.push(txid);
    }

    pub fn set_sequencer_output_index(&mut self, idx: u8) {
        self.sequencer_output_index = idx;
    }

    pub fn set_stem_output_index(&mut self, idx: u8) {
        self.stem_output_index = idx;
    }

    /// Total amount of consumed outputs.
    pub fn total_consumed(&self) -> u64 {
        self.consumed.iter().map(|o| o.amount).sum()
    }

    /// Assemble canonical bytes and sign the essence.
    pub fn build_and_sign(self, key: &SigningKey) -> Vec<u8> {
        let mut sections: [Vec<Vec<u8>>; NUM_SECTIONS] = Default::default();
        sections[SECTION_INPUT_IDS] = self
            .inputs
            .iter()
            .map(|oid| oid.to_bytes().to_vec())
            .collect();
        sections[SECTION_UNLOCK_PARAMS] = self.unlock_params;
        sections[SECTION_OUTPUTS] = self.outputs.iter().map(|o| o.to_bytes()).collect();
        sections[SECTION_TIMESTAMP] = vec![self.timestamp.to_bytes().to_vec()];
        sections[SECTION_SEQ_STEM_INDICES] =
            vec![vec![self.sequencer_output_index, self.stem_output_index]];
        sections[SECTION_ENDORSEMENTS] = self
            .endorsements
            .iter()
            .map(|txid| txid.as_bytes().to_vec())
            .collect();
        // the commitment participates in the signed essence
        sections[SECTION_INPUT_COMMITMENT] = vec![vec![0u8; 32]];
        let commitment = input_commitment_from_sections(&sections);
        sections[SECTION_INPUT_COMMITMENT] = vec![commitment.to_vec()];

        let essence = essence_from_sections(&sections);
        let signature = key.sign(&essence);
        let mut sig_bytes = Vec::with_capacity(96);
        sig_bytes.extend_from_slice(&signature.to_bytes());
        sig_bytes.extend_from_slice(&key.verifying_key().to_bytes());
        sections[SECTION_SIGNATURE] = vec![sig_bytes];

        serialize_sections(&sections)
    }
}

/// Parameters of a plain value transfer.
pub struct TransferParams {
    pub inputs: Vec<OutputWithID>,
    pub amount: u64,
    pub target: Address,
    pub timestamp: LogicalTime,
}

/// Build a transfer consuming `inputs`, paying `amount` to `target` and the
/// remainder back to the sender address.
pub fn make_transfer(params: TransferParams, key: &SigningKey) -> Result<Vec<u8>, BuildError> {
    if params.inputs.is_empty() {
        return Err(BuildError::NoInputs);
    }
    let mut b = TransactionBuilder::new(params.timestamp);
    for inp in &params.inputs {
        b.put_input(inp.id, inp.output.clone());
    }
    let have = b.total_consumed();
    if have < params.amount {
        return Err(BuildError::NotEnoughFunds {
            have,
            need: params.amount,
        });
    }
    b.put_output(Output::new(params.amount, Lock::Ed25519(params.target)));
    let remainder = have - params.amount;
    if remainder > 0 {
        let sender = address_from_public_key(&key.verifying_key().to_bytes());
        b.put_output(Output::new(remainder, Lock::Ed25519(sender)));
    }
    Ok(b.build_and_sign(key))
}

/// Parameters of a sequencer milestone (or branch) transaction.
pub struct MakeSequencerTransactionParams {
    pub seq_name: String,
    /// The consumed chain predecessor output.
    pub chain_input: OutputWithID,
    pub chain_id: ChainID,
    /// The consumed stem output; present iff building a branch.
    pub stem_input: Option<OutputWithID>,
    pub timestamp: LogicalTime,
    /// Tag-along fee inputs.
    pub additional_inputs: Vec<OutputWithID>,
    pub endorsements: Vec<TransactionID>,
    /// Inflation granted on this branch (0 for ordinary milestones).
    pub inflation: u64,
    pub milestone_data: MilestoneData,
}

/// Build a sequencer milestone: output 0 continues the chain collecting all
/// tag-along amounts; a branch additionally consumes the baseline stem and
/// produces the successor stem at output 1.
pub fn make_sequencer_transaction(
    params: MakeSequencerTransactionParams,
    key: &SigningKey,
) -> Result<Vec<u8>, BuildError> {
    if params.chain_input.output.chain_constraint().is_none()
        && !params.chain_input.output.is_sequencer_output()
    {
        return Err(BuildError::NotAChainInput);
    }

    let mut b = TransactionBuilder::new(params.timestamp);
    let chain_pred_idx = b.put_input(params.chain_input.id, params.chain_input.output.clone());

    let mut fees: u64 = 0;
    for inp in &params.additional_inputs {
        fees = fees.saturating_add(inp.output.amount);
        b.put_input(inp.id, inp.output.clone());
    }

    let stem_data = match &params.stem_input {
        Some(stem_in) => {
            let prev_stem = stem_in
                .output
                .stem_lock()
                .ok_or(BuildError::NotAStemInput)?;
            b.put_input(stem_in.id, stem_in.output.clone());
            Some((stem_in.id, prev_stem.supply))
        }
        None => None,
    };

    let amount_on_chain = params
        .chain_input
        .output
        .amount
        .saturating_add(fees)
        .saturating_add(params.inflation);

    let controller = address_from_public_key(&key.verifying_key().to_bytes());
    let seq_output = Output::new(amount_on_chain, Lock::Ed25519(controller))
        .with_constraint(Constraint::Chain(ChainConstraint {
            chain_id: params.chain_id,
            predecessor_input_index: chain_pred_idx,
        }))
        .with_constraint(Constraint::Sequencer { amount_on_chain })
        .with_constraint(Constraint::MilestoneData(params.milestone_data));
    let seq_idx = b.put_output(seq_output);
    b.set_sequencer_output_index(seq_idx);

    if let Some((stem_oid, prev_supply)) = stem_data {
        let stem_idx = b.put_output(Output::new(
            0,
            Lock::Stem(StemLock {
                predecessor_output_id: stem_oid,
                supply: prev_supply.saturating_add(params.inflation),
                inflation_amount: params.inflation,
            }),
        ));
        b.set_stem_output_index(stem_idx);
    }

    for e in params.endorsements {
        b.put_endorsement(e);
    }

    Ok(b.build_and_sign(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::identity::{
        bootstrap_sequencer_id, genesis_output, genesis_stem_output, LedgerIdentity,
    };
    use crate::transaction::Transaction;

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[1u8; 32])
    }

    fn identity() -> LedgerIdentity {
        LedgerIdentity::new(
            "test".into(),
            0,
            3_000_000,
            key().verifying_key().to_bytes(),
        )
    }

    #[test]
    fn transfer_produces_remainder() {
        let identity = identity();
        let genesis = genesis_output(&identity);
        let bytes = make_transfer(
            TransferParams {
                inputs: vec![genesis],
                amount: 1_000_000,
                target: [9u8; 32],
                timestamp: LogicalTime::must_new(0, 50),
            },
            &key(),
        )
        .unwrap();
        let tx = Transaction::from_bytes(bytes).unwrap();
        tx.validate_main().unwrap();
        assert_eq!(tx.num_produced_outputs(), 2);
        assert_eq!(tx.total_amount(), 3_000_000);
        assert_eq!(tx.produced_output_at(0).unwrap().amount, 1_000_000);
    }

    #[test]
    fn transfer_insufficient_funds() {
        let identity = identity();
        let genesis = genesis_output(&identity);
        let err = make_transfer(
            TransferParams {
                inputs: vec![genesis],
                amount: 5_000_000,
                target: [9u8; 32],
                timestamp: LogicalTime::must_new(0, 50),
            },
            &key(),
        );
        assert!(matches!(err, Err(BuildError::NotEnoughFunds { .. })));
    }

    #[test]
    fn sequencer_milestone_continues_chain() {
        let identity = identity();
        let genesis = genesis_output(&identity);
        let bytes = make_sequencer_transaction(
            MakeSequencerTransactionParams {
                seq_name: "boot".into(),
                chain_input: genesis,
                chain_id: bootstrap_sequencer_id(),
                stem_input: None,
                timestamp: LogicalTime::must_new(0, 10),
                additional_inputs: vec![],
                endorsements: vec![],
                inflation: 0,
                milestone_data: MilestoneData {
                    name: "boot".into(),
                    chain_height: 1,
                    branch_height: 0,
                },
            },
            &key(),
        )
        .unwrap();
        let tx = Transaction::from_bytes(bytes).unwrap();
        tx.validate_main().unwrap();
        assert!(tx.is_sequencer_milestone());
        assert!(!tx.is_branch());
        let data = tx.sequencer_data().unwrap();
        assert_eq!(data.sequencer_id, bootstrap_sequencer_id());
        assert_eq!(data.predecessor_input_index, 0);
        assert!(tx.find_chain_output(&bootstrap_sequencer_id()).is_some());
    }

    #[test]
    fn branch_carries_stem() {
        let identity = identity();
        let genesis = genesis_output(&identity);
        let stem = genesis_stem_output(&identity);
        let bytes = make_sequencer_transaction(
            MakeSequencerTransactionParams {
                seq_name: "boot".into(),
                chain_input: genesis,
                chain_id: bootstrap_sequencer_id(),
                stem_input: Some(stem.clone()),
                timestamp: LogicalTime::must_new(1, 0),
                additional_inputs: vec![],
                endorsements: vec![],
                inflation: 0,
                milestone_data: MilestoneData {
                    name: "boot".into(),
                    chain_height: 1,
                    branch_height: 1,
                },
            },
            &key(),
        )
        .unwrap();
        let tx = Transaction::from_bytes(bytes).unwrap();
        tx.validate_main().unwrap();
        assert!(tx.is_branch());
        let new_stem = tx.stem_output().unwrap();
        let stem_lock = new_stem.output.stem_lock().unwrap();
        assert_eq!(stem_lock.predecessor_output_id, stem.id);
        assert_eq!(stem_lock.supply, 3_000_000);
    }
}
