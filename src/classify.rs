//! Transaction classification.
//!
//! Every non-coinbase transaction seen by the block pipeline or the
//! mempool feed is partitioned against the owned-address registry: owned
//! inputs spend UTXO entries, owned outputs create them, and the
//! owned/foreign counts decide which wallet events the transaction
//! produces. The mempool path applies the same UTXO effects but emits
//! nothing; confirmation is required before notification.

use std::collections::HashMap;

use bitcoin::Transaction;
use tracing::*;

use crate::{
    chain::{script_to_address, Chain},
    error::WalletResult,
    keys::{AddressBook, Branch},
    omni,
    store::UtxoStore,
    traits::Reader,
};

/// The category of a classified wallet event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Foreign funds arriving on a deposit-branch address.
    UserDeposit,
    /// Foreign funds arriving on a change-branch address.
    AdminDeposit,
    /// Wallet funds leaving, authorized through change-branch inputs.
    UserWithdraw,
    /// Wallet funds leaving with deposit-branch inputs involved.
    AdminWithdraw,
    /// An internal sweep, both sides owned.
    FundCollection,
}

/// One classified event. A transaction yields one event per owned
/// address it touches.
#[derive(Clone, Debug, PartialEq)]
pub struct TxEvent {
    pub kind: EventKind,
    pub txid: String,
    pub address: String,
    pub amount: u64,
    pub fee: u64,
    pub coin: String,
    pub block_time: u64,
}

/// A message on the notify channel, in emission order.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// A confirmed wallet event.
    Event(TxEvent),
    /// Every height up to and including this one has been emitted.
    Checkpoint(u64),
}

/// Classifies one transaction and commits its UTXO effects.
///
/// Owned inputs are removed from the store here; owned outputs are
/// created here. With `mempool` set the effects are applied
/// speculatively and no events are returned.
///
/// Per-input and per-output script parse failures are logged and
/// skipped; an RPC failure fetching a previous output aborts the whole
/// transaction so the caller can retry.
pub async fn classify_transaction<R: Reader>(
    rpc: &R,
    chain: Chain,
    book: &AddressBook,
    store: &UtxoStore,
    tx: &Transaction,
    block_time: u64,
    mempool: bool,
) -> WalletResult<Vec<TxEvent>> {
    let txid = tx.compute_txid().to_string();

    let mut owned_inputs = Vec::new();
    let mut foreign_inputs = 0usize;
    let mut sender: Option<String> = None;
    let mut fee: i128 = 0;

    for (i, input) in tx.input.iter().enumerate() {
        if input.previous_output.is_null() {
            continue;
        }
        let prev = rpc.raw_tx(&input.previous_output.txid).await?;
        let vout = input.previous_output.vout;
        let Some(prev_out) = prev.output.get(vout as usize) else {
            warn!(%txid, input = i, "previous output index out of range");
            continue;
        };
        fee += i128::from(prev_out.value.to_sat());

        let Some(addr) = script_to_address(chain, &prev_out.script_pubkey) else {
            debug!(%txid, input = i, "input script has no address form");
            continue;
        };
        if i == 0 {
            sender = Some(addr.clone());
        }
        match book.lookup(&addr) {
            Some(path) => {
                store.remove(&input.previous_output.txid.to_string(), vout)?;
                owned_inputs.push((addr, path));
            }
            None => foreign_inputs += 1,
        }
    }

    let mut owned_outputs = Vec::new();
    let mut foreign_outputs = Vec::new();
    let mut value_by_addr: HashMap<String, u64> = HashMap::new();
    let mut op_returns = Vec::new();
    let mut out_addrs: Vec<Option<String>> = Vec::with_capacity(tx.output.len());

    for (i, out) in tx.output.iter().enumerate() {
        fee -= i128::from(out.value.to_sat());

        if out.script_pubkey.is_op_return() {
            op_returns.push(&out.script_pubkey);
            out_addrs.push(None);
            continue;
        }
        let Some(addr) = script_to_address(chain, &out.script_pubkey) else {
            debug!(%txid, output = i, "output script has no address form");
            out_addrs.push(None);
            continue;
        };
        match book.lookup(&addr) {
            Some(path) => {
                store.create(&txid, i as u32, &addr, out.value.to_sat())?;
                owned_outputs.push((addr.clone(), path));
            }
            None => foreign_outputs.push(addr.clone()),
        }
        value_by_addr.insert(addr.clone(), out.value.to_sat());
        out_addrs.push(Some(addr));
    }

    if mempool {
        return Ok(Vec::new());
    }

    let fee = u64::try_from(fee.max(0)).unwrap_or(0);
    let event = |kind, address: &str, amount| TxEvent {
        kind,
        txid: txid.clone(),
        address: address.to_string(),
        amount,
        fee,
        coin: chain.symbol().to_string(),
        block_time,
    };

    // Omni overlay: a single well-formed USDT OP_RETURN with an
    // identifiable receiver replaces the base classification.
    if chain.supports_omni() && op_returns.len() == 1 {
        if let Some(amount) = omni::parse_usdt_simple_send(op_returns[0]) {
            if let (Some(sender), Some(receiver)) = (
                sender.as_deref(),
                sender.as_deref().and_then(|s| omni_receiver(&out_addrs, s)),
            ) {
                let kind = match (book.lookup(sender), book.lookup(&receiver)) {
                    (None, Some(path)) => Some(if path.branch == Branch::External {
                        EventKind::UserDeposit
                    } else {
                        EventKind::AdminDeposit
                    }),
                    (Some(path), None) => Some(if path.branch == Branch::External {
                        EventKind::AdminWithdraw
                    } else {
                        EventKind::UserWithdraw
                    }),
                    (Some(_), Some(_)) => Some(EventKind::FundCollection),
                    (None, None) => None,
                };
                return Ok(kind
                    .map(|kind| TxEvent {
                        coin: "USDT".to_string(),
                        ..event(kind, &receiver, amount)
                    })
                    .into_iter()
                    .collect());
            }
        }
    }

    let branch0_inputs = owned_inputs
        .iter()
        .filter(|(_, path)| path.branch == Branch::External)
        .count();

    let mut events = Vec::new();
    if owned_inputs.is_empty() && foreign_inputs > 0 && !owned_outputs.is_empty() {
        for (addr, path) in &owned_outputs {
            let kind = if path.branch == Branch::External {
                EventKind::UserDeposit
            } else {
                EventKind::AdminDeposit
            };
            events.push(event(kind, addr, value_by_addr[addr]));
        }
    } else if !owned_inputs.is_empty() && foreign_inputs == 0 && !foreign_outputs.is_empty() {
        let kind = if branch0_inputs == 0 {
            EventKind::UserWithdraw
        } else {
            EventKind::AdminWithdraw
        };
        for addr in &foreign_outputs {
            events.push(event(kind, addr, value_by_addr[addr]));
        }
    } else if !owned_inputs.is_empty()
        && foreign_inputs == 0
        && !owned_outputs.is_empty()
        && foreign_outputs.is_empty()
    {
        for (addr, _) in &owned_outputs {
            events.push(event(EventKind::FundCollection, addr, value_by_addr[addr]));
        }
    }

    Ok(events)
}

/// Finds the Omni receiver by walking output addresses in reverse index
/// order. The first address that differs from the sender is the
/// receiver; when the first address seen *is* the sender (change on
/// top), the next occurrence of the sender is a self-send receiver.
fn omni_receiver(out_addrs: &[Option<String>], sender: &str) -> Option<String> {
    let mut saw_sender_first = false;
    for addr in out_addrs.iter().rev().flatten() {
        if !saw_sender_first {
            if addr.as_str() != sender {
                return Some(addr.clone());
            }
            saw_sender_first = true;
        } else if addr.as_str() == sender {
            return Some(addr.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        absolute::LockTime, transaction::Version, Amount, OutPoint, ScriptBuf, Sequence,
        Transaction, TxIn, TxOut, Witness,
    };

    use super::*;
    use crate::{
        chain::{address_to_script, encode_base58},
        keys::AddrPath,
        omni::USDT_PROPERTY_ID,
        test_utils::MockChain,
    };

    const BLOCK_TIME: u64 = 1_600_000_000;

    fn addr(tag: u8) -> String {
        encode_base58(Chain::Btc.params().pubkey_hash_id, &[tag; 20])
    }

    fn pay_to(address: &str, value: u64) -> TxOut {
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: address_to_script(Chain::Btc, address).unwrap(),
        }
    }

    fn spend(tx: &Transaction, vout: u32) -> TxIn {
        TxIn {
            previous_output: OutPoint { txid: tx.compute_txid(), vout },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }
    }

    fn tx_with(input: Vec<TxIn>, output: Vec<TxOut>) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output,
        }
    }

    struct Fixture {
        chain: MockChain,
        book: AddressBook,
        store: UtxoStore,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        Fixture {
            chain: MockChain::default(),
            book: AddressBook::new(0, 0),
            store: UtxoStore::open(dir.path()).unwrap(),
            _dir: dir,
        }
    }

    async fn classify(f: &Fixture, tx: &Transaction) -> Vec<TxEvent> {
        classify_transaction(&f.chain, Chain::Btc, &f.book, &f.store, tx, BLOCK_TIME, false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn user_deposit_creates_utxo() {
        let mut f = fixture();
        let owned = addr(0x05);
        f.book.record(owned.clone(), AddrPath::external(5));

        let funding = tx_with(vec![], vec![pay_to(&addr(0xAA), 250_000)]);
        f.chain.insert_tx(&funding);

        let tx = tx_with(vec![spend(&funding, 0)], vec![pay_to(&owned, 200_000)]);
        let events = classify(&f, &tx).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::UserDeposit);
        assert_eq!(events[0].address, owned);
        assert_eq!(events[0].amount, 200_000);
        assert_eq!(events[0].fee, 50_000);
        assert_eq!(events[0].coin, "BTC");

        let entry = f.store.get(&tx.compute_txid().to_string(), 0).unwrap().unwrap();
        assert_eq!(entry.address, owned);
        assert_eq!(entry.value, 200_000);
    }

    #[tokio::test]
    async fn user_withdraw_spends_and_creates_change() {
        let mut f = fixture();
        let owned_in = addr(0x02);
        let change = addr(0x07);
        f.book.record(owned_in.clone(), AddrPath::internal(2));
        f.book.record(change.clone(), AddrPath::internal(7));

        let funding = tx_with(vec![], vec![pay_to(&owned_in, 1_000_000)]);
        f.chain.insert_tx(&funding);
        f.store
            .create(&funding.compute_txid().to_string(), 0, &owned_in, 1_000_000)
            .unwrap();

        let external = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
        let tx = tx_with(
            vec![spend(&funding, 0)],
            vec![pay_to(external, 400_000), pay_to(&change, 599_500)],
        );
        let events = classify(&f, &tx).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::UserWithdraw);
        assert_eq!(events[0].address, external);
        assert_eq!(events[0].amount, 400_000);
        assert_eq!(events[0].fee, 500);

        // Input gone, change present.
        assert!(f
            .store
            .get(&funding.compute_txid().to_string(), 0)
            .unwrap()
            .is_none());
        assert!(f
            .store
            .get(&tx.compute_txid().to_string(), 1)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn branch0_input_makes_admin_withdraw() {
        let mut f = fixture();
        let owned_in = addr(0x03);
        f.book.record(owned_in.clone(), AddrPath::external(3));

        let funding = tx_with(vec![], vec![pay_to(&owned_in, 500_000)]);
        f.chain.insert_tx(&funding);

        let tx = tx_with(vec![spend(&funding, 0)], vec![pay_to(&addr(0xBB), 499_000)]);
        let events = classify(&f, &tx).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::AdminWithdraw);
    }

    #[tokio::test]
    async fn fund_collection_emits_per_internal_output() {
        let mut f = fixture();
        let from_a = addr(0x0A);
        let from_b = addr(0x0B);
        let to_inner = addr(0x0C);
        f.book.record(from_a.clone(), AddrPath::external(1));
        f.book.record(from_b.clone(), AddrPath::external(2));
        f.book.record(to_inner.clone(), AddrPath::internal(0));

        let funding = tx_with(
            vec![],
            vec![pay_to(&from_a, 300_000), pay_to(&from_b, 200_000)],
        );
        f.chain.insert_tx(&funding);

        let tx = tx_with(
            vec![spend(&funding, 0), spend(&funding, 1)],
            vec![pay_to(&to_inner, 499_000)],
        );
        let events = classify(&f, &tx).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::FundCollection);
        assert_eq!(events[0].address, to_inner);
        assert_eq!(events[0].amount, 499_000);
    }

    #[tokio::test]
    async fn omni_usdt_deposit() {
        let mut f = fixture();
        let owned = addr(0x03);
        f.book.record(owned.clone(), AddrPath::external(3));

        let sender = addr(0xEE);
        let funding = tx_with(vec![], vec![pay_to(&sender, 100_000)]);
        f.chain.insert_tx(&funding);

        let tx = tx_with(
            vec![spend(&funding, 0)],
            vec![
                TxOut {
                    value: Amount::from_sat(0),
                    script_pubkey: omni::simple_send_script(USDT_PROPERTY_ID, 100_000_000),
                },
                pay_to(&owned, 546),
            ],
        );
        let events = classify(&f, &tx).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::UserDeposit);
        assert_eq!(events[0].coin, "USDT");
        assert_eq!(events[0].amount, 100_000_000);
        assert_eq!(events[0].address, owned);
    }

    #[tokio::test]
    async fn omni_self_send_receiver_discovery() {
        // Change lands on the sender and sits above the dust output; the
        // next occurrence of the sender is the receiver.
        let sender = addr(0x44);
        let out_addrs = vec![
            None, // OP_RETURN
            Some(sender.clone()),
            Some(sender.clone()),
        ];
        assert_eq!(omni_receiver(&out_addrs, &sender), Some(sender.clone()));

        let other = addr(0x55);
        let out_addrs = vec![None, Some(sender.clone()), Some(other.clone())];
        assert_eq!(omni_receiver(&out_addrs, &sender), Some(other));

        let out_addrs = vec![None, Some(sender.clone())];
        assert_eq!(omni_receiver(&out_addrs, &sender), None);
    }

    #[tokio::test]
    async fn mempool_path_applies_effects_silently() {
        let mut f = fixture();
        let owned = addr(0x09);
        f.book.record(owned.clone(), AddrPath::external(9));

        let funding = tx_with(vec![], vec![pay_to(&addr(0xAA), 250_000)]);
        f.chain.insert_tx(&funding);

        let tx = tx_with(vec![spend(&funding, 0)], vec![pay_to(&owned, 200_000)]);
        let events =
            classify_transaction(&f.chain, Chain::Btc, &f.book, &f.store, &tx, 0, true)
                .await
                .unwrap();

        assert!(events.is_empty());
        assert!(f
            .store
            .get(&tx.compute_txid().to_string(), 0)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn foreign_only_transaction_is_none() {
        let mut f = fixture();
        let funding = tx_with(vec![], vec![pay_to(&addr(0xAA), 250_000)]);
        f.chain.insert_tx(&funding);

        let tx = tx_with(vec![spend(&funding, 0)], vec![pay_to(&addr(0xBB), 200_000)]);
        let events = classify(&f, &tx).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn classifier_is_deterministic() {
        let mut f = fixture();
        let owned = addr(0x05);
        f.book.record(owned.clone(), AddrPath::external(5));
        let funding = tx_with(vec![], vec![pay_to(&addr(0xAA), 250_000)]);
        f.chain.insert_tx(&funding);
        let tx = tx_with(vec![spend(&funding, 0)], vec![pay_to(&owned, 200_000)]);

        let first = classify(&f, &tx).await;
        let second = classify(&f, &tx).await;
        assert_eq!(first, second);
    }
}
