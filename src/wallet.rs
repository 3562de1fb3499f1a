//! The wallet itself.
//!
//! One `Wallet` value owns the address registry, the UTXO store, the
//! RPC client, and the configuration snapshot; every operation is a
//! method here. Mutating operations serialize through the wallet mutex
//! for their entire duration, which keeps the rolling indices and coin
//! selection race-free across concurrent HTTP handlers and the
//! pipeline.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitcoin::bip32::{Xpriv, Xpub};
use tokio::sync::Mutex;
use tracing::*;

use crate::{
    builder::{build_transaction, BuildRequest, BuiltTx, OutputSpec, OMNI_DUST},
    chain::{verify_address, Chain},
    client::{tx_from_hex, Auth, Client},
    config::Config,
    error::{WalletError, WalletResult},
    keys::{derive_address, AddrPath, AddressBook, Branch},
    omni,
    shift::{left_shift, parse_amount_sat},
    signer::sign_transaction,
    store::UtxoStore,
    traits::{Broadcaster, OmniReader},
    trezor,
};

pub struct Wallet {
    pub chain: Chain,
    pub book: AddressBook,
    pub store: UtxoStore,
    pub rpc: Client,
    /// Serializes every mutating operation.
    pub guard: Mutex<()>,
    /// Highest height fully processed by the pipeline.
    pub last_height: AtomicU64,

    xpub: Xpub,
    xpriv: Option<Xpriv>,
    fee_rate: u64,
    config_path: PathBuf,
}

impl Wallet {
    /// Opens the store, connects the RPC client, and rehydrates the
    /// address registry up to the configured rolling indices.
    pub fn new(config: &Config, config_path: PathBuf) -> WalletResult<Arc<Wallet>> {
        let xpub: Xpub = config.xpub.parse().map_err(|_| WalletError::InvalidKey)?;
        let xpriv = if config.xpriv.is_empty() {
            None
        } else {
            Some(config.xpriv.parse().map_err(|_| WalletError::InvalidKey)?)
        };

        let store = UtxoStore::open(&config.db_dir)?;
        let rpc = Client::new(
            config.rpc_url.clone(),
            Auth::UserPass(config.rpc_user.clone(), config.rpc_pass.clone()),
            None,
            None,
        )?;

        let book = AddressBook::new(config.ext_index, config.int_index);
        book.rehydrate(&xpub, config.chain)?;
        info!(
            external = config.ext_index,
            internal = config.int_index,
            "address registry ready"
        );
        if config.int_index > 0 {
            let inner = derive_address(&xpub, config.chain, AddrPath::internal(0))?;
            info!(%inner, "inner withdraw address");
        }

        Ok(Arc::new(Wallet {
            chain: config.chain,
            book,
            store,
            rpc,
            guard: Mutex::new(()),
            last_height: AtomicU64::new(config.last_block),
            xpub,
            xpriv,
            fee_rate: config.fee_rate,
            config_path,
        }))
    }

    fn xpriv(&self) -> WalletResult<&Xpriv> {
        self.xpriv.as_ref().ok_or(WalletError::InvalidKey)
    }

    /// The branch-1/0 address operator funds consolidate on.
    fn inner_address(&self) -> WalletResult<String> {
        derive_address(&self.xpub, self.chain, AddrPath::internal(0))
    }

    /// Writes the rolling indices and checkpoint back to the config
    /// file.
    pub fn persist(&self) -> WalletResult<()> {
        let (ext, int) = self.book.indices();
        Config::persist(
            &self.config_path,
            ext,
            int,
            self.last_height.load(Ordering::Relaxed),
        )
    }

    /// Issues the next deposit address.
    pub async fn issue_deposit_address(&self) -> WalletResult<String> {
        let _guard = self.guard.lock().await;
        let addr = self.book.issue_external(&self.xpub, self.chain)?;
        // The rolling index is durable before the caller sees the
        // address.
        self.persist()?;
        info!(%addr, "issued deposit address");
        Ok(addr)
    }

    /// Confirmed balance of one address, or of the whole wallet, as a
    /// decimal string.
    pub fn balance_decimal(&self, address: Option<&str>) -> WalletResult<String> {
        if let Some(addr) = address {
            if !verify_address(self.chain, addr) {
                return Err(WalletError::InvalidAddress(addr.to_string()));
            }
        }
        let sat = self.store.balance(address)?;
        Ok(left_shift(&sat.to_string(), 8))
    }

    /// Total balance held on change-branch addresses.
    pub fn inner_balance_decimal(&self) -> WalletResult<String> {
        let mut sat = 0u64;
        for utxo in self.store.scan(None)? {
            if self
                .book
                .lookup(&utxo.address)
                .is_some_and(|path| path.branch == Branch::Internal)
            {
                sat += utxo.value;
            }
        }
        Ok(left_shift(&sat.to_string(), 8))
    }

    /// Builds, signs, and broadcasts a payment to a foreign address.
    pub async fn send_coin(&self, to: &str, amount: &str) -> WalletResult<String> {
        let _guard = self.guard.lock().await;

        if self.book.contains(to) {
            return Err(WalletError::SelfTransfer);
        }
        if !verify_address(self.chain, to) {
            return Err(WalletError::InvalidAddress(to.to_string()));
        }
        let amount_sat = parse_amount_sat(amount)
            .ok_or_else(|| WalletError::Decode(format!("bad amount: {amount}")))?;

        let change = self.book.change_address(&self.xpub, self.chain)?;
        let built = build_transaction(
            self.chain,
            &self.store,
            &BuildRequest {
                fee_rate: self.fee_rate,
                from: None,
                outputs: vec![OutputSpec::Address { address: to.to_string(), amount: amount_sat }],
                change_address: Some(change),
                pay_all: false,
                is_omni: false,
            },
        )?;

        let txid = self.sign_and_send(&built).await?;
        info!(%txid, %to, %amount, "coin sent");
        Ok(txid)
    }

    /// Broadcasts an externally signed transaction.
    pub async fn send_signed(&self, hex: &str) -> WalletResult<String> {
        let _guard = self.guard.lock().await;
        let tx = tx_from_hex(hex).map_err(|e| WalletError::Decode(format!("bad tx hex: {e}")))?;
        let txid = self.rpc.send_raw_transaction(&tx).await?;
        Ok(txid.to_string())
    }

    /// Builds and broadcasts an Omni simple send.
    pub async fn send_omni(
        &self,
        token: &str,
        from: Option<&str>,
        to: &str,
        amount: &str,
    ) -> WalletResult<String> {
        let _guard = self.guard.lock().await;

        let property_id = self.omni_property(token)?;
        if !verify_address(self.chain, to) {
            return Err(WalletError::InvalidAddress(to.to_string()));
        }
        let amount_sat = parse_amount_sat(amount)
            .ok_or_else(|| WalletError::Decode(format!("bad amount: {amount}")))?;

        let from = match from {
            Some(addr) if !addr.is_empty() => addr.to_string(),
            _ => self.inner_address()?,
        };

        let available = self.omni_available(&from, property_id).await?;
        if amount_sat > available {
            return Err(WalletError::PendingBalanceExceeded {
                available,
                requested: amount_sat,
            });
        }

        let built = build_transaction(
            self.chain,
            &self.store,
            &BuildRequest {
                fee_rate: self.fee_rate,
                from: Some(from.clone()),
                outputs: vec![
                    OutputSpec::Script {
                        script: omni::simple_send_script(property_id, amount_sat),
                        amount: 0,
                    },
                    OutputSpec::Address { address: to.to_string(), amount: OMNI_DUST },
                ],
                change_address: Some(from),
                pay_all: false,
                is_omni: true,
            },
        )?;

        let txid = self.sign_and_send(&built).await?;
        info!(%txid, %to, %amount, "omni tokens sent");
        Ok(txid)
    }

    /// Prepares a Trezor sign request paying `amount` to `to`, or
    /// sweeping everything when no amount is given.
    pub async fn prepare_trezor(&self, to: &str, amount: Option<&str>) -> WalletResult<String> {
        let _guard = self.guard.lock().await;

        if !verify_address(self.chain, to) {
            return Err(WalletError::InvalidAddress(to.to_string()));
        }

        let built = match amount {
            Some(amount) => {
                let amount_sat = parse_amount_sat(amount)
                    .ok_or_else(|| WalletError::Decode(format!("bad amount: {amount}")))?;
                let change = self.book.change_address(&self.xpub, self.chain)?;
                build_transaction(
                    self.chain,
                    &self.store,
                    &BuildRequest {
                        fee_rate: self.fee_rate,
                        from: None,
                        outputs: vec![OutputSpec::Address {
                            address: to.to_string(),
                            amount: amount_sat,
                        }],
                        change_address: Some(change),
                        pay_all: false,
                        is_omni: false,
                    },
                )?
            }
            None => build_transaction(
                self.chain,
                &self.store,
                &BuildRequest {
                    fee_rate: self.fee_rate,
                    from: None,
                    outputs: vec![OutputSpec::Address { address: to.to_string(), amount: 0 }],
                    change_address: None,
                    pay_all: true,
                    is_omni: false,
                },
            )?,
        };

        let request = trezor::build_sign_request(&self.rpc, self.chain, &self.book, &built).await?;
        if built.has_change {
            self.book.commit_change();
            self.persist()?;
        }
        serde_json::to_string(&request)
            .map_err(|e| WalletError::Decode(format!("trezor payload: {e}")))
    }

    /// Prepares a Trezor sign request moving Omni tokens off a deposit
    /// address; the receiver defaults to the inner withdraw address.
    pub async fn prepare_omni_trezor(
        &self,
        token: &str,
        from: &str,
        to: Option<&str>,
        amount: &str,
    ) -> WalletResult<String> {
        let _guard = self.guard.lock().await;

        let property_id = self.omni_property(token)?;
        if !verify_address(self.chain, from) {
            return Err(WalletError::InvalidAddress(from.to_string()));
        }
        let amount_sat = parse_amount_sat(amount)
            .ok_or_else(|| WalletError::Decode(format!("bad amount: {amount}")))?;
        let to = match to {
            Some(addr) if !addr.is_empty() => addr.to_string(),
            _ => self.inner_address()?,
        };

        let built = build_transaction(
            self.chain,
            &self.store,
            &BuildRequest {
                fee_rate: self.fee_rate,
                from: Some(from.to_string()),
                outputs: vec![
                    OutputSpec::Script {
                        script: omni::simple_send_script(property_id, amount_sat),
                        amount: 0,
                    },
                    OutputSpec::Address { address: to, amount: OMNI_DUST },
                ],
                change_address: Some(from.to_string()),
                pay_all: false,
                is_omni: true,
            },
        )?;

        let request = trezor::build_sign_request(&self.rpc, self.chain, &self.book, &built).await?;
        serde_json::to_string(&request)
            .map_err(|e| WalletError::Decode(format!("trezor payload: {e}")))
    }

    /// Confirmed Omni balance of `address` as a decimal string.
    pub async fn omni_balance_decimal(&self, address: &str, token: &str) -> WalletResult<String> {
        let property_id = self.omni_property(token)?;
        let balance = self.rpc.omni_balance(address, property_id).await?;
        Ok(balance.balance)
    }

    /// Logs every UTXO entry; the data stays server-side.
    pub fn dump_utxos(&self) -> WalletResult<usize> {
        let utxos = self.store.scan(None)?;
        for utxo in &utxos {
            info!(txid = %utxo.txid, vout = utxo.vout, address = %utxo.address, value = utxo.value, "utxo");
        }
        Ok(utxos.len())
    }

    fn omni_property(&self, token: &str) -> WalletResult<u32> {
        if !self.chain.supports_omni() {
            return Err(WalletError::OmniUnsupportedOnChain(
                self.chain.params().name.to_string(),
            ));
        }
        omni::property_id_for_token(token)
            .ok_or_else(|| WalletError::Decode(format!("unsupported token: {token}")))
    }

    /// Confirmed balance minus the sender's own pending simple sends.
    async fn omni_available(&self, address: &str, property_id: u32) -> WalletResult<u64> {
        let balance = self.rpc.omni_balance(address, property_id).await?;
        let balance = parse_amount_sat(&balance.balance)
            .ok_or_else(|| WalletError::Decode(format!("bad omni balance: {}", balance.balance)))?;

        let mut pending = 0u64;
        for tx in self.rpc.omni_pending(address).await? {
            if tx.sending_address != address
                || tx.confirmations > 0
                || tx.property_id != Some(property_id)
                || tx.kind.as_deref() != Some("Simple Send")
            {
                continue;
            }
            let Some(amount) = tx.amount.as_deref().and_then(parse_amount_sat) else {
                continue;
            };
            debug!(txid = %tx.txid, amount, "pending omni send");
            pending += amount;
        }
        Ok(balance.saturating_sub(pending))
    }

    async fn sign_and_send(&self, built: &BuiltTx) -> WalletResult<String> {
        let signed = sign_transaction(self.chain, self.xpriv()?, &self.book, &self.store, &built.tx)?;
        let txid = self.rpc.send_raw_transaction(&signed).await?;
        if built.has_change {
            self.book.commit_change();
            self.persist()?;
        }
        Ok(txid.to_string())
    }
}
