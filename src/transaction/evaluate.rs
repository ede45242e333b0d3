//! The constraint-evaluation seam.
//!
//! The scripting engine proper is an external collaborator; the attacher only
//! needs `validate(tx, consumed) -> ok | err`. [`StandardEvaluator`] is the
//! built-in implementation covering the recognized constraint kinds: lock
//! satisfaction, chain continuity, stem continuity and amount conservation.

use super::Transaction;
use crate::ledger::output::{Lock, Output};
use crate::ledger::OutputID;

/// Failure of semantic (constraint-level) validation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EvalError {
    #[error("input #{0} not resolvable")]
    MissingInput(u8),
    #[error("lock of input #{input} not satisfied: {reason}")]
    LockNotSatisfied { input: u8, reason: String },
    #[error("chain {0} is consumed but not continued")]
    ChainNotContinued(String),
    #[error("stem continuity broken: {0}")]
    StemBroken(String),
    #[error("amounts not conserved: consumed {consumed} + inflation {inflation} != produced {produced}")]
    NotConserved {
        consumed: u64,
        inflation: u64,
        produced: u64,
    },
}

/// Validates a transaction against its resolved consumed outputs.
pub trait ConstraintEvaluator: Send + Sync {
    fn validate(&self, tx: &Transaction, consumed: &[Output]) -> Result<(), EvalError>;
}

/// The built-in constraint library.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardEvaluator;

impl ConstraintEvaluator for StandardEvaluator {
    fn validate(&self, tx: &Transaction, consumed: &[Output]) -> Result<(), EvalError> {
        if consumed.len() != tx.num_inputs() {
            return Err(EvalError::MissingInput(consumed.len() as u8));
        }

        let sender = tx.sender_address();
        let mut consumed_total: u64 = 0;

        for (i, out) in consumed.iter().enumerate() {
            let idx = i as u8;
            consumed_total = consumed_total.saturating_add(out.amount);
            match &out.lock {
                Lock::Ed25519(addr) => {
                    if *addr != sender {
                        return Err(EvalError::LockNotSatisfied {
                            input: idx,
                            reason: "signature does not match address".into(),
                        });
                    }
                }
                Lock::Chain(chain_id) => {
                    // tag-along: only the sequencer operating the chain may
                    // collect, proven by continuing the chain in the same tx
                    let operated = tx
                        .sequencer_data()
                        .map(|d| d.sequencer_id == *chain_id)
                        .unwrap_or(false);
                    if !operated {
                        return Err(EvalError::LockNotSatisfied {
                            input: idx,
                            reason: format!(
                                "chain lock {} requires the operating sequencer",
                                chain_id.short_string()
                            ),
                        });
                    }
                }
                Lock::Stem(prev_stem) => {
                    self.validate_stem_consumption(tx, idx, out, prev_stem.supply)?;
                }
            }

            // a consumed chain output must be continued by a produced one
            if out.chain_constraint().is_some() {
                let consumed_oid = tx.input_at(idx).ok_or(EvalError::MissingInput(idx))?;
                let chain_id = out
                    .chain_id_at(&consumed_oid)
                    .expect("chain constraint present");
                let continued = tx.produced_outputs().iter().enumerate().any(|(j, o)| {
                    o.chain_id_at(&tx.output_id(j as u8)) == Some(chain_id)
                        && o.chain_constraint()
                            .map(|(next_cc, _)| {
                                next_cc.predecessor_input_index == idx && !next_cc.is_origin()
                            })
                            .unwrap_or(false)
                });
                if !continued {
                    return Err(EvalError::ChainNotContinued(chain_id.short_string()));
                }
            }
        }

        let inflation = tx.inflation_amount();
        let produced = tx.total_amount();
        if consumed_total.saturating_add(inflation) != produced {
            return Err(EvalError::NotConserved {
                consumed: consumed_total,
                inflation,
                produced,
            });
        }
        Ok(())
    }
}

impl StandardEvaluator {
    fn validate_stem_consumption(
        &self,
        tx: &Transaction,
        input_idx: u8,
        _consumed: &Output,
        prev_supply: u64,
    ) -> Result<(), EvalError> {
        if !tx.is_branch() {
            return Err(EvalError::StemBroken(
                "stem output consumed by a non-branch transaction".into(),
            ));
        }
        let consumed_oid = tx
            .input_at(input_idx)
            .ok_or(EvalError::MissingInput(input_idx))?;
        let stem_out = tx
            .stem_output()
            .ok_or_else(|| EvalError::StemBroken("branch without stem output".into()))?;
        let stem_lock = stem_out
            .output
            .stem_lock()
            .ok_or_else(|| EvalError::StemBroken("stem output without stem lock".into()))?;
        if stem_lock.predecessor_output_id != consumed_oid {
            return Err(EvalError::StemBroken(format!(
                "stem predecessor {} does not reference consumed stem {}",
                stem_lock.predecessor_output_id.short_string(),
                consumed_oid.short_string()
            )));
        }
        if stem_lock.supply != prev_supply.saturating_add(stem_lock.inflation_amount) {
            return Err(EvalError::StemBroken("supply counter mismatch".into()));
        }
        Ok(())
    }
}

/// Resolve consumed outputs by input index with a lookup closure; used by the
/// attacher to feed the evaluator.
pub fn resolve_consumed(
    tx: &Transaction,
    mut fetch: impl FnMut(&OutputID) -> Option<Output>,
) -> Result<Vec<Output>, EvalError> {
    let mut ret = Vec::with_capacity(tx.num_inputs());
    for (i, oid) in tx.inputs().iter().enumerate() {
        match fetch(oid) {
            Some(out) => ret.push(out),
            None => return Err(EvalError::MissingInput(i as u8)),
        }
    }
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::identity::{
        bootstrap_sequencer_id, genesis_output, genesis_stem_output, LedgerIdentity,
    };
    use crate::ledger::output::MilestoneData;
    use crate::ledger::LogicalTime;
    use crate::transaction::builder::{
        make_sequencer_transaction, make_transfer, MakeSequencerTransactionParams, TransferParams,
    };
    use ed25519_dalek::SigningKey;

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
    fn transfer_validates() {
        let identity = identity();
        let genesis = genesis_output(&identity);
        let bytes = make_transfer(
            TransferParams {
                inputs: vec![genesis.clone()],
                amount: 1_000,
                target: [9u8; 32],
                timestamp: LogicalTime::must_new(0, 50),
            },
            &key(),
        )
        .unwrap();
        let tx = Transaction::from_bytes(bytes).unwrap();
        // genesis output is chain-constrained, so a plain transfer of it must
        // fail chain continuity
        let err = StandardEvaluator.validate(&tx, &[genesis.output.clone()]);
        assert!(matches!(err, Err(EvalError::ChainNotContinued(_))));
    }

    #[test]
    fn wrong_sender_fails_lock() {
        let identity = identity();
        let genesis = genesis_output(&identity);
        let other = SigningKey::from_bytes(&[2u8; 32]);
        let bytes = make_transfer(
            TransferParams {
                inputs: vec![genesis.clone()],
                amount: 1_000,
                target: [9u8; 32],
                timestamp: LogicalTime::must_new(0, 50),
            },
            &other,
        )
        .unwrap();
        let tx = Transaction::from_bytes(bytes).unwrap();
        let err = StandardEvaluator.validate(&tx, &[genesis.output.clone()]);
        assert!(matches!(err, Err(EvalError::LockNotSatisfied { .. })));
    }

    #[test]
    fn branch_validates_stem_continuity() {
        let identity = identity();
        let genesis = genesis_output(&identity);
        let stem = genesis_stem_output(&identity);
        let bytes = make_sequencer_transaction(
            MakeSequencerTransactionParams {
                seq_name: "boot".into(),
                chain_input: genesis.clone(),
                chain_id: bootstrap_sequencer_id(),
                stem_input: Some(stem.clone()),
                timestamp: LogicalTime::must_new(1, 0),
                additional_inputs: vec![],
                endorsements: vec![],
                inflation: 0,
                milestone_data: MilestoneData::default(),
            },
            &key(),
        )
        .unwrap();
        let tx = Transaction::from_bytes(bytes).unwrap();
        StandardEvaluator
            .validate(&tx, &[genesis.output.clone(), stem.output.clone()])
            .unwrap();
    }
}
