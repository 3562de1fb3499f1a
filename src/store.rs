//! The durable UTXO index.
//!
//! Keyed by `(txid, vout)`, valued by `(address, value)`. An entry exists
//! exactly while the output is believed unspent and pays a wallet-owned
//! address. Create and remove are idempotent, which lets the block
//! pipeline replay its confirmation window after a restart without any
//! reconciliation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::WalletResult;

/// One unspent output owned by the wallet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub value: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredOut {
    address: String,
    value: u64,
}

/// Key-value store of the wallet's unspent outputs.
pub struct UtxoStore {
    db: sled::Db,
}

impl UtxoStore {
    /// Opens (or creates) the store under `dir`.
    pub fn open(dir: &Path) -> WalletResult<Self> {
        let db = sled::open(dir)?;
        Ok(Self { db })
    }

    fn key(txid: &str, vout: u32) -> Vec<u8> {
        format!("{txid}/{vout}").into_bytes()
    }

    /// Inserts the entry if absent; an existing entry is left unchanged.
    pub fn create(&self, txid: &str, vout: u32, address: &str, value: u64) -> WalletResult<()> {
        let key = Self::key(txid, vout);
        if self.db.get(&key)?.is_some() {
            return Ok(());
        }
        let stored = StoredOut { address: address.to_string(), value };
        let encoded = serde_json::to_vec(&stored).expect("utxo value serializes");
        self.db.insert(key, encoded)?;
        self.db.flush()?;
        Ok(())
    }

    /// Deletes the entry if present; absent entries are not an error.
    pub fn remove(&self, txid: &str, vout: u32) -> WalletResult<()> {
        if self.db.remove(Self::key(txid, vout))?.is_some() {
            self.db.flush()?;
        }
        Ok(())
    }

    pub fn get(&self, txid: &str, vout: u32) -> WalletResult<Option<Utxo>> {
        let Some(raw) = self.db.get(Self::key(txid, vout))? else {
            return Ok(None);
        };
        Ok(decode_entry(&Self::key(txid, vout), &raw))
    }

    /// Full-range scan, optionally filtered to one address. Iteration
    /// order follows the key order and is stable across runs.
    pub fn scan(&self, address: Option<&str>) -> WalletResult<Vec<Utxo>> {
        let mut out = Vec::new();
        for item in self.db.iter() {
            let (key, raw) = item?;
            let Some(utxo) = decode_entry(&key, &raw) else {
                continue;
            };
            if address.map_or(true, |a| a == utxo.address) {
                out.push(utxo);
            }
        }
        Ok(out)
    }

    /// Sum of stored values, optionally restricted to one address.
    pub fn balance(&self, address: Option<&str>) -> WalletResult<u64> {
        Ok(self.scan(address)?.iter().map(|u| u.value).sum())
    }

    pub fn flush(&self) -> WalletResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_entry(key: &[u8], raw: &[u8]) -> Option<Utxo> {
    let key = std::str::from_utf8(key).ok()?;
    let (txid, vout) = key.rsplit_once('/')?;
    let vout = vout.parse().ok()?;
    let stored: StoredOut = serde_json::from_slice(raw).ok()?;
    Some(Utxo {
        txid: txid.to_string(),
        vout,
        address: stored.address,
        value: stored.value,
    })
}
