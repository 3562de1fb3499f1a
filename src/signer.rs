//! Per-input P2PKH signing.
//!
//! Every input must be backed by a UTXO entry and a registry path on the
//! change branch; the deposit branch is receive-only here and is spent
//! through the hardware-wallet flow instead. BTC and DSC sign the
//! pre-fork legacy sighash; BCH and BSV sign the BIP-143 form with
//! `SIGHASH_FORKID`, which commits to the input amount.

use bitcoin::bip32::Xpriv;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::sighash::SighashCache;
use bitcoin::{consensus::encode::serialize, EcdsaSighashType, ScriptBuf, Transaction};
use secp256k1::{Message, SECP256K1};

use crate::{
    chain::{address_to_script, Chain},
    error::{WalletError, WalletResult},
    keys::{derive_privkey, AddressBook, Branch},
    store::UtxoStore,
};

/// `SIGHASH_ALL | SIGHASH_FORKID`.
const FORKID_SIGHASH_ALL: u32 = 0x41;

/// Signs every input of `tx` with keys derived from `xpriv`.
///
/// Fails with [`WalletError::UnspendableInput`] when an input has no
/// UTXO entry or registry path, and [`WalletError::ForbiddenInputBranch`]
/// when the path is on the deposit branch.
pub fn sign_transaction(
    chain: Chain,
    xpriv: &Xpriv,
    book: &AddressBook,
    store: &UtxoStore,
    tx: &Transaction,
) -> WalletResult<Transaction> {
    let mut signed = tx.clone();

    for index in 0..signed.input.len() {
        let outpoint = signed.input[index].previous_output;
        let unspendable = || WalletError::UnspendableInput {
            txid: outpoint.txid.to_string(),
            vout: outpoint.vout,
        };

        let utxo = store
            .get(&outpoint.txid.to_string(), outpoint.vout)?
            .ok_or_else(unspendable)?;
        let path = book.lookup(&utxo.address).ok_or_else(unspendable)?;
        if path.branch != Branch::Internal {
            return Err(WalletError::ForbiddenInputBranch);
        }

        let secret = derive_privkey(xpriv, path)?;
        let pubkey = secret.public_key(&*SECP256K1).serialize();
        let script_code = address_to_script(chain, &utxo.address)?;

        let digest = if chain.uses_forkid() {
            forkid_sighash(&signed, index, &script_code, utxo.value)
        } else {
            SighashCache::new(&signed)
                .legacy_signature_hash(index, &script_code, EcdsaSighashType::All.to_u32())
                .map_err(|e| WalletError::Decode(format!("sighash: {e}")))?
                .to_byte_array()
        };

        let signature = SECP256K1.sign_ecdsa(&Message::from_digest(digest), &secret);
        let mut sig_bytes = signature.serialize_der().to_vec();
        sig_bytes.push(if chain.uses_forkid() {
            FORKID_SIGHASH_ALL as u8
        } else {
            EcdsaSighashType::All.to_u32() as u8
        });

        let sig_push = PushBytesBuf::try_from(sig_bytes)
            .map_err(|_| WalletError::Decode("oversized signature".to_string()))?;
        signed.input[index].script_sig = Builder::new()
            .push_slice(sig_push)
            .push_slice(pubkey)
            .into_script();
    }

    Ok(signed)
}

/// The BIP-143 signature hash with the fork id bit, as introduced by
/// Bitcoin Cash and inherited by Bitcoin SV.
fn forkid_sighash(tx: &Transaction, index: usize, script_code: &ScriptBuf, value: u64) -> [u8; 32] {
    let mut prevouts = Vec::new();
    let mut sequences = Vec::new();
    for input in &tx.input {
        prevouts.extend(serialize(&input.previous_output));
        sequences.extend(serialize(&input.sequence));
    }
    let hash_prevouts = sha256d::Hash::hash(&prevouts);
    let hash_sequence = sha256d::Hash::hash(&sequences);

    let mut outputs = Vec::new();
    for output in &tx.output {
        outputs.extend(serialize(output));
    }
    let hash_outputs = sha256d::Hash::hash(&outputs);

    let mut preimage = Vec::new();
    preimage.extend(tx.version.0.to_le_bytes());
    preimage.extend(hash_prevouts.to_byte_array());
    preimage.extend(hash_sequence.to_byte_array());
    preimage.extend(serialize(&tx.input[index].previous_output));
    preimage.extend(serialize(script_code));
    preimage.extend(value.to_le_bytes());
    preimage.extend(serialize(&tx.input[index].sequence));
    preimage.extend(hash_outputs.to_byte_array());
    preimage.extend(tx.lock_time.to_consensus_u32().to_le_bytes());
    preimage.extend(FORKID_SIGHASH_ALL.to_le_bytes());

    sha256d::Hash::hash(&preimage).to_byte_array()
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        absolute::LockTime, script::Instruction, transaction::Version, Amount, OutPoint,
        ScriptBuf, Sequence, TxIn, TxOut, Witness,
    };
    use secp256k1::{ecdsa::Signature, PublicKey};

    use super::*;
    use crate::keys::{derive_address, AddrPath};

    const TEST_XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";
    const TEST_XPRIV: &str = "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi";
    const TXID: &str = "2c9a2b24b999f5a5a8b39b0d7cc36ff23344b65b050e30c43b03b60b50737b0c";

    struct Fixture {
        xpriv: Xpriv,
        book: AddressBook,
        store: UtxoStore,
        _dir: tempfile::TempDir,
    }

    fn fixture(chain: Chain, path: AddrPath, value: u64) -> (Fixture, Transaction) {
        let xpub = TEST_XPUB.parse().unwrap();
        let xpriv: Xpriv = TEST_XPRIV.parse().unwrap();
        let address = derive_address(&xpub, chain, path).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = UtxoStore::open(dir.path()).unwrap();
        store.create(TXID, 0, &address, value).unwrap();

        let book = AddressBook::new(0, 0);
        book.record(address, path);

        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: TXID.parse().unwrap(), vout: 0 },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value - 1_000),
                script_pubkey: ScriptBuf::new_op_return(b"x"),
            }],
        };
        (Fixture { xpriv, book, store, _dir: dir }, tx)
    }

    fn unlock_parts(script: &ScriptBuf) -> (Vec<u8>, Vec<u8>) {
        let pushes: Vec<Vec<u8>> = script
            .instructions()
            .map(|ins| match ins.unwrap() {
                Instruction::PushBytes(b) => b.as_bytes().to_vec(),
                other => panic!("unexpected instruction {other:?}"),
            })
            .collect();
        assert_eq!(pushes.len(), 2);
        (pushes[0].clone(), pushes[1].clone())
    }

    #[test]
    fn signs_legacy_input() {
        let path = AddrPath::internal(4);
        let (f, tx) = fixture(Chain::Btc, path, 100_000);
        let signed = sign_transaction(Chain::Btc, &f.xpriv, &f.book, &f.store, &tx).unwrap();

        let (sig, pubkey) = unlock_parts(&signed.input[0].script_sig);
        assert_eq!(*sig.last().unwrap(), 0x01);
        let expected = derive_privkey(&f.xpriv, path).unwrap().public_key(&*SECP256K1);
        assert_eq!(pubkey, expected.serialize());

        // The signature verifies against the recomputed legacy sighash.
        let utxo = f.store.get(TXID, 0).unwrap().unwrap();
        let script_code = address_to_script(Chain::Btc, &utxo.address).unwrap();
        let digest = SighashCache::new(&tx)
            .legacy_signature_hash(0, &script_code, 0x01)
            .unwrap()
            .to_byte_array();
        let signature = Signature::from_der(&sig[..sig.len() - 1]).unwrap();
        let pubkey = PublicKey::from_slice(&pubkey).unwrap();
        SECP256K1
            .verify_ecdsa(&Message::from_digest(digest), &signature, &pubkey)
            .unwrap();
    }

    #[test]
    fn signs_forkid_input() {
        let path = AddrPath::internal(1);
        let (f, tx) = fixture(Chain::Bch, path, 250_000);
        let signed = sign_transaction(Chain::Bch, &f.xpriv, &f.book, &f.store, &tx).unwrap();

        let (sig, pubkey) = unlock_parts(&signed.input[0].script_sig);
        assert_eq!(*sig.last().unwrap(), 0x41);

        let utxo = f.store.get(TXID, 0).unwrap().unwrap();
        let script_code = address_to_script(Chain::Bch, &utxo.address).unwrap();
        let digest = forkid_sighash(&tx, 0, &script_code, utxo.value);
        let signature = Signature::from_der(&sig[..sig.len() - 1]).unwrap();
        let pubkey = PublicKey::from_slice(&pubkey).unwrap();
        SECP256K1
            .verify_ecdsa(&Message::from_digest(digest), &signature, &pubkey)
            .unwrap();
    }

    #[test]
    fn rejects_deposit_branch_input() {
        let (f, tx) = fixture(Chain::Btc, AddrPath::external(2), 100_000);
        match sign_transaction(Chain::Btc, &f.xpriv, &f.book, &f.store, &tx) {
            Err(WalletError::ForbiddenInputBranch) => {}
            other => panic!("expected forbidden branch, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_input() {
        let (f, mut tx) = fixture(Chain::Btc, AddrPath::internal(0), 100_000);
        tx.input[0].previous_output.vout = 9;
        match sign_transaction(Chain::Btc, &f.xpriv, &f.book, &f.store, &tx) {
            Err(WalletError::UnspendableInput { vout, .. }) => assert_eq!(vout, 9),
            other => panic!("expected unspendable input, got {other:?}"),
        }
    }

    #[test]
    fn forkid_digest_commits_to_amount() {
        let (f, tx) = fixture(Chain::Bch, AddrPath::internal(1), 250_000);
        let utxo = f.store.get(TXID, 0).unwrap().unwrap();
        let script_code = address_to_script(Chain::Bch, &utxo.address).unwrap();
        let a = forkid_sighash(&tx, 0, &script_code, 250_000);
        let b = forkid_sighash(&tx, 0, &script_code, 250_001);
        assert_ne!(a, b);
    }
}
