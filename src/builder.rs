//! Coin selection and transaction assembly.
//!
//! Inputs are picked in store-scan order, growing the fee with the
//! projected signed size until the selected balance covers the outputs
//! plus fee exactly or leaves room for a change output. The fee is
//! floored at 1 sat/byte and nudged so change lands on a round-100
//! amount.

use bitcoin::{
    absolute::LockTime, transaction::Version, Amount, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness,
};
use tracing::*;

use crate::{
    chain::{address_to_script, Chain},
    error::{WalletError, WalletResult},
    store::{Utxo, UtxoStore},
};

pub const TX_FEE_PER_KB: u64 = 1000;
pub const MIN_FEE_PER_KB: u64 = 1000;
pub const TX_OUTPUT_SIZE: u64 = 34;
pub const TX_INPUT_SIZE: u64 = 148;
pub const TX_MIN_OUTPUT_AMOUNT: u64 = 3 * TX_FEE_PER_KB * (TX_OUTPUT_SIZE + TX_INPUT_SIZE) / 1000;
pub const TX_MAX_SIZE: u64 = 100_000;

/// Satoshi carried by the Omni recipient output.
pub const OMNI_DUST: u64 = 546;

/// Bound on output-reshaping recursion in the over-size recovery path.
const MAX_RESHAPE_DEPTH: u32 = 8;

/// One requested output.
#[derive(Clone, Debug)]
pub enum OutputSpec {
    /// Pay `amount` to `address`.
    Address { address: String, amount: u64 },
    /// A literal output script, used for the Omni OP_RETURN.
    Script { script: ScriptBuf, amount: u64 },
}

impl OutputSpec {
    fn amount(&self) -> u64 {
        match self {
            OutputSpec::Address { amount, .. } | OutputSpec::Script { amount, .. } => *amount,
        }
    }

    fn set_amount(&mut self, value: u64) {
        match self {
            OutputSpec::Address { amount, .. } | OutputSpec::Script { amount, .. } => {
                *amount = value
            }
        }
    }
}

/// What to build.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    /// Caller-provided fee rate in satoshi per kilobyte; authoritative.
    pub fee_rate: u64,
    /// Restricts the candidate UTXO set to one address.
    pub from: Option<String>,
    pub outputs: Vec<OutputSpec>,
    /// Where surplus goes; the first input's address when empty.
    pub change_address: Option<String>,
    /// Sweep the whole candidate set into the last output.
    pub pay_all: bool,
    /// Shape outputs for an Omni simple send.
    pub is_omni: bool,
}

/// A fully selected, unsigned transaction.
#[derive(Clone, Debug)]
pub struct BuiltTx {
    pub tx: Transaction,
    /// The UTXOs consumed, in input order.
    pub inputs: Vec<Utxo>,
    pub fee: u64,
    pub change: u64,
    pub has_change: bool,
    pub change_address: Option<String>,
}

/// Selects inputs from `store` and assembles the unsigned transaction.
pub fn build_transaction(
    chain: Chain,
    store: &UtxoStore,
    request: &BuildRequest,
) -> WalletResult<BuiltTx> {
    let candidates = store.scan(request.from.as_deref())?;
    build_with(chain, &candidates, request, request.outputs.clone(), 0)
}

fn min_output(fee_rate: u64) -> u64 {
    TX_MIN_OUTPUT_AMOUNT.max((TX_MIN_OUTPUT_AMOUNT * fee_rate).div_ceil(MIN_FEE_PER_KB))
}

fn round_up_100(value: u64) -> u64 {
    value.div_ceil(100) * 100
}

fn fee_for_size(size: u64, fee_rate: u64) -> u64 {
    (size * TX_FEE_PER_KB / 1000).max(round_up_100(size * fee_rate / 1000))
}

/// Serialized size of the output-only skeleton plus `inputs` signed
/// P2PKH inputs and one projected change output.
fn projected_size(skeleton: u64, inputs: u64) -> u64 {
    skeleton + inputs * TX_INPUT_SIZE + TX_OUTPUT_SIZE
}

fn build_with(
    chain: Chain,
    candidates: &[Utxo],
    request: &BuildRequest,
    outputs: Vec<OutputSpec>,
    depth: u32,
) -> WalletResult<BuiltTx> {
    let total: u64 = candidates.iter().map(|u| u.value).sum();
    let amount: u64 = outputs.iter().map(|o| o.amount()).sum();
    let min_out = min_output(request.fee_rate);

    if outputs.is_empty() || depth > MAX_RESHAPE_DEPTH {
        return Err(WalletError::InsufficientFunds { have: total, need: amount });
    }

    let tx_outputs = outputs
        .iter()
        .map(|spec| output_for(chain, spec))
        .collect::<WalletResult<Vec<_>>>()?;
    let skeleton_len = serialized_len(&tx_outputs);

    if request.pay_all {
        return build_sweep(chain, candidates, request, outputs, skeleton_len);
    }

    let mut selected: Vec<Utxo> = Vec::new();
    let mut balance = 0u64;
    let mut fee = 0u64;
    let mut change = 0u64;
    let mut covered = false;

    for utxo in candidates {
        let projected = projected_size(skeleton_len, selected.len() as u64 + 1);
        if projected > TX_MAX_SIZE {
            // Over-size recovery: the input set hit the size cap before
            // covering the outputs. If even the whole candidate set is
            // short, fail; otherwise shrink or drop the last output and
            // rebuild.
            let full_fee =
                fee_for_size(projected_size(skeleton_len, candidates.len() as u64), request.fee_rate);
            if total < amount + full_fee {
                return Err(WalletError::InsufficientFunds { have: total, need: amount + full_fee });
            }
            let cap_fee = fee_for_size(
                projected_size(skeleton_len, selected.len() as u64),
                request.fee_rate,
            );
            let shortfall = (amount + cap_fee).saturating_sub(balance);
            let mut outputs = outputs;
            let last = outputs.last_mut().expect("outputs checked non-empty");
            if last.amount() > shortfall && last.amount() - shortfall >= min_out {
                debug!(shortfall, "transaction over size cap, shrinking last output");
                let reduced = last.amount() - shortfall;
                last.set_amount(reduced);
            } else {
                debug!("transaction over size cap, dropping last output");
                outputs.pop();
            }
            return build_with(chain, candidates, request, outputs, depth + 1);
        }

        selected.push(utxo.clone());
        balance += utxo.value;
        fee = fee_for_size(projected, request.fee_rate);

        if balance >= amount + fee {
            change = balance - amount - fee;
            // Leave change at a round-100 amount.
            fee += change % 100;
            change = balance - amount - fee;
            if change == 0 || change >= min_out {
                covered = true;
                break;
            }
        }
    }

    if !covered {
        return Err(WalletError::InsufficientFunds { have: total, need: amount + fee });
    }

    let has_change = change > 0;
    let change_address = if has_change {
        Some(match &request.change_address {
            Some(addr) if !addr.is_empty() => addr.clone(),
            _ => selected[0].address.clone(),
        })
    } else {
        None
    };

    let mut tx_outputs = tx_outputs;
    if let Some(addr) = &change_address {
        tx_outputs.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: address_to_script(chain, addr)?,
        });
        // Omni wants the recipient dust as the last non-OP_RETURN
        // output: [OP_RETURN, change, recipient].
        if request.is_omni && tx_outputs.len() == 3 {
            tx_outputs.swap(1, 2);
        }
    }

    Ok(BuiltTx {
        tx: assemble(&selected, tx_outputs)?,
        inputs: selected,
        fee,
        change,
        has_change,
        change_address,
    })
}

/// Spends every candidate into the last output, fee off the top.
fn build_sweep(
    chain: Chain,
    candidates: &[Utxo],
    request: &BuildRequest,
    mut outputs: Vec<OutputSpec>,
    skeleton_len: u64,
) -> WalletResult<BuiltTx> {
    let total: u64 = candidates.iter().map(|u| u.value).sum();
    let min_out = min_output(request.fee_rate);

    if candidates.is_empty() {
        return Err(WalletError::InsufficientFunds { have: 0, need: min_out });
    }
    let size = projected_size(skeleton_len, candidates.len() as u64) - TX_OUTPUT_SIZE;
    if size > TX_MAX_SIZE {
        return Err(WalletError::Decode(format!(
            "sweep transaction exceeds {TX_MAX_SIZE} bytes"
        )));
    }

    let fee = fee_for_size(size, request.fee_rate);
    let fixed: u64 = outputs[..outputs.len() - 1].iter().map(|o| o.amount()).sum();
    let need = fee + fixed + min_out;
    if total < need {
        return Err(WalletError::InsufficientFunds { have: total, need });
    }
    let last = outputs.last_mut().expect("sweep outputs non-empty");
    last.set_amount(total - fee - fixed);

    let tx_outputs = outputs
        .iter()
        .map(|spec| output_for(chain, spec))
        .collect::<WalletResult<Vec<_>>>()?;

    Ok(BuiltTx {
        tx: assemble(candidates, tx_outputs)?,
        inputs: candidates.to_vec(),
        fee,
        change: 0,
        has_change: false,
        change_address: None,
    })
}

fn output_for(chain: Chain, spec: &OutputSpec) -> WalletResult<TxOut> {
    Ok(match spec {
        OutputSpec::Address { address, amount } => TxOut {
            value: Amount::from_sat(*amount),
            script_pubkey: address_to_script(chain, address)?,
        },
        OutputSpec::Script { script, amount } => TxOut {
            value: Amount::from_sat(*amount),
            script_pubkey: script.clone(),
        },
    })
}

/// Serialized length of a transaction holding exactly these outputs.
fn serialized_len(outputs: &[TxOut]) -> u64 {
    let tx = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![],
        output: outputs.to_vec(),
    };
    bitcoin::consensus::encode::serialize(&tx).len() as u64
}

fn assemble(inputs: &[Utxo], outputs: Vec<TxOut>) -> WalletResult<Transaction> {
    let mut tx_inputs = Vec::with_capacity(inputs.len());
    for utxo in inputs {
        let txid: Txid = utxo
            .txid
            .parse()
            .map_err(|_| WalletError::Decode(format!("bad txid in store: {}", utxo.txid)))?;
        tx_inputs.push(TxIn {
            previous_output: OutPoint { txid, vout: utxo.vout },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        });
    }
    Ok(Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: tx_inputs,
        output: outputs,
    })
}
