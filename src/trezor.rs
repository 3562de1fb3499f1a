//! Hardware-wallet sign requests.
//!
//! Deposit-branch funds are swept with a Trezor, so the service prepares
//! a Trezor Connect `signTransaction` payload instead of signing
//! locally: BIP44 paths for every input, shaped outputs, and the full
//! referenced previous transactions the device demands.

use bitcoin::script::Instruction;
use hex::DisplayHex;
use serde::Serialize;

use crate::{
    builder::BuiltTx,
    cashaddr,
    chain::Chain,
    error::{WalletError, WalletResult},
    keys::AddressBook,
    traits::Reader,
};

const HARDENED: u32 = 0x8000_0000;
const BIP44_PURPOSE: u32 = 44;

/// A Trezor Connect `signTransaction` request.
#[derive(Clone, Debug, Serialize)]
pub struct TrezorSignRequest {
    pub coin: String,
    /// The caller broadcasts through the service, not the device.
    pub push: bool,
    pub inputs: Vec<TrezorInput>,
    pub outputs: Vec<TrezorOutput>,
    #[serde(rename = "refTxs")]
    pub ref_txs: Vec<RefTx>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrezorInput {
    /// `[44', coin_type', 0', branch, index]`.
    pub address_n: Vec<u32>,
    pub prev_index: u32,
    pub prev_hash: String,
    pub amount: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrezorOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_return_data: Option<String>,
    pub amount: String,
    pub script_type: String,
}

/// A referenced previous transaction, serialized field by field the way
/// the device wants it.
#[derive(Clone, Debug, Serialize)]
pub struct RefTx {
    pub hash: String,
    pub inputs: Vec<RefTxInput>,
    pub bin_outputs: Vec<RefTxOutput>,
    pub version: i32,
    pub lock_time: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct RefTxInput {
    pub prev_hash: String,
    pub prev_index: u32,
    pub script_sig: String,
    pub sequence: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct RefTxOutput {
    pub amount: u64,
    pub script_pubkey: String,
}

/// Assembles the sign request for a built (unsigned) transaction,
/// fetching every referenced previous transaction over RPC.
pub async fn build_sign_request<R: Reader>(
    rpc: &R,
    chain: Chain,
    book: &AddressBook,
    built: &BuiltTx,
) -> WalletResult<TrezorSignRequest> {
    let coin_type = chain.params().bip44_coin_type;

    let mut inputs = Vec::with_capacity(built.inputs.len());
    for utxo in &built.inputs {
        let path = book
            .lookup(&utxo.address)
            .ok_or_else(|| WalletError::UnspendableInput {
                txid: utxo.txid.clone(),
                vout: utxo.vout,
            })?;
        inputs.push(TrezorInput {
            address_n: vec![
                HARDENED | BIP44_PURPOSE,
                HARDENED | coin_type,
                HARDENED,
                path.branch.as_u32(),
                path.index,
            ],
            prev_index: utxo.vout,
            prev_hash: utxo.txid.clone(),
            amount: utxo.value.to_string(),
        });
    }

    let mut outputs = Vec::with_capacity(built.tx.output.len());
    for out in &built.tx.output {
        if out.script_pubkey.is_op_return() {
            outputs.push(TrezorOutput {
                address: None,
                op_return_data: Some(op_return_data(&out.script_pubkey)?),
                amount: out.value.to_sat().to_string(),
                script_type: "PAYTOOPRETURN".to_string(),
            });
        } else {
            outputs.push(TrezorOutput {
                address: Some(display_address(chain, &out.script_pubkey)?),
                op_return_data: None,
                amount: out.value.to_sat().to_string(),
                script_type: "PAYTOADDRESS".to_string(),
            });
        }
    }

    let mut ref_txs = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for utxo in &built.inputs {
        if !seen.insert(utxo.txid.clone()) {
            continue;
        }
        let txid = utxo
            .txid
            .parse()
            .map_err(|_| WalletError::Decode(format!("bad txid in store: {}", utxo.txid)))?;
        let prev = rpc.raw_tx(&txid).await?;
        ref_txs.push(RefTx {
            hash: utxo.txid.clone(),
            inputs: prev
                .input
                .iter()
                .map(|input| RefTxInput {
                    prev_hash: input.previous_output.txid.to_string(),
                    prev_index: input.previous_output.vout,
                    script_sig: input.script_sig.as_bytes().to_lower_hex_string(),
                    sequence: input.sequence.0,
                })
                .collect(),
            bin_outputs: prev
                .output
                .iter()
                .map(|output| RefTxOutput {
                    amount: output.value.to_sat(),
                    script_pubkey: output.script_pubkey.as_bytes().to_lower_hex_string(),
                })
                .collect(),
            version: prev.version.0,
            lock_time: prev.lock_time.to_consensus_u32(),
        });
    }

    Ok(TrezorSignRequest {
        coin: chain.trezor_coin().to_string(),
        push: false,
        inputs,
        outputs,
        ref_txs,
    })
}

/// The pushed data of an OP_RETURN output script, hex encoded.
fn op_return_data(script: &bitcoin::Script) -> WalletResult<String> {
    for instruction in script.instructions() {
        if let Ok(Instruction::PushBytes(bytes)) = instruction {
            return Ok(bytes.as_bytes().to_lower_hex_string());
        }
    }
    Err(WalletError::Decode("op_return carries no data".to_string()))
}

/// The address form Trezor expects for an output script. BCH addresses
/// go out as CashAddr with the full prefix.
fn display_address(chain: Chain, script: &bitcoin::Script) -> WalletResult<String> {
    let addr = crate::chain::script_to_address(chain, script)
        .ok_or_else(|| WalletError::Decode("output script has no address form".to_string()))?;
    match chain.params().cashaddr_hrp {
        Some(hrp) => {
            let (kind, hash) = cashaddr::decode_payload(&addr, hrp)?;
            Ok(cashaddr::encode_payload_with_prefix(hrp, kind, &hash))
        }
        None => Ok(addr),
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        absolute::LockTime, transaction::Version, Amount, Transaction, TxOut,
    };

    use super::*;
    use crate::{
        builder::{build_transaction, BuildRequest, OutputSpec},
        chain::encode_base58,
        keys::AddrPath,
        store::UtxoStore,
        test_utils::MockChain,
    };

    fn addr(tag: u8) -> String {
        encode_base58(Chain::Btc.params().pubkey_hash_id, &[tag; 20])
    }

    #[tokio::test]
    async fn builds_request_with_paths_and_ref_txs() {
        let mut chain = MockChain::default();
        let from = addr(0x01);

        // The previous transaction holding the spent output.
        let funding = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![bitcoin::TxIn::default()],
            output: vec![TxOut {
                value: Amount::from_sat(800_000),
                script_pubkey: crate::chain::address_to_script(Chain::Btc, &from).unwrap(),
            }],
        };
        chain.insert_tx(&funding);
        let funding_txid = funding.compute_txid().to_string();

        let dir = tempfile::tempdir().unwrap();
        let store = UtxoStore::open(dir.path()).unwrap();
        store.create(&funding_txid, 0, &from, 800_000).unwrap();

        let book = AddressBook::new(0, 0);
        book.record(from.clone(), AddrPath::external(6));

        let built = build_transaction(
            Chain::Btc,
            &store,
            &BuildRequest {
                fee_rate: 1000,
                from: None,
                outputs: vec![OutputSpec::Address { address: addr(0x02), amount: 500_000 }],
                change_address: Some(from.clone()),
                pay_all: false,
                is_omni: false,
            },
        )
        .unwrap();

        let request = build_sign_request(&chain, Chain::Btc, &book, &built)
            .await
            .unwrap();

        assert_eq!(request.coin, "Bitcoin");
        assert!(!request.push);
        assert_eq!(request.inputs.len(), 1);
        assert_eq!(
            request.inputs[0].address_n,
            vec![HARDENED | 44, HARDENED, HARDENED, 0, 6]
        );
        assert_eq!(request.inputs[0].prev_hash, funding_txid);
        assert_eq!(request.inputs[0].amount, "800000");

        assert_eq!(request.outputs.len(), 2);
        assert!(request
            .outputs
            .iter()
            .all(|o| o.script_type == "PAYTOADDRESS"));

        assert_eq!(request.ref_txs.len(), 1);
        assert_eq!(request.ref_txs[0].hash, funding_txid);
        assert_eq!(request.ref_txs[0].bin_outputs.len(), 1);
        assert_eq!(request.ref_txs[0].bin_outputs[0].amount, 800_000);
        assert_eq!(request.ref_txs[0].version, 2);

        // Field names the device protocol demands.
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("refTxs").is_some());
        assert!(json["inputs"][0].get("address_n").is_some());
    }

    #[tokio::test]
    async fn omni_op_return_output_shape() {
        let script = crate::omni::simple_send_script(31, 100_000_000);
        let data = op_return_data(&script).unwrap();
        assert_eq!(data, "6f6d6e69000000000000001f0000000005f5e100");
    }
}
