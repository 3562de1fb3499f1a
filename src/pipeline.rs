//! The chain-event ingestion pipeline.
//!
//! A cursor walks block heights linearly from the persisted checkpoint
//! toward the node's tip. Classified events from the three newest
//! heights sit in a confirmation buffer and are released exactly three
//! heights later; older heights release immediately. Checkpoint markers
//! interleave with events so downstream consumers can advance their own
//! cursors.
//!
//! A restart replays the confirmation window; downstream deduplicates by
//! txid.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::*;

use crate::{
    chain::Chain,
    classify::{classify_transaction, EventKind, Notification, TxEvent},
    error::WalletResult,
    keys::AddressBook,
    store::UtxoStore,
    traits::{OmniReader, Reader},
    wallet::Wallet,
    zmq_feed::FeedEvent,
};

/// Fallback walk interval when no `hashblock` arrives.
const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Number of blocks an event waits in the buffer before release.
pub const CONFIRM_DEPTH: u64 = 3;

/// User deposits on BTC below this many satoshi are not forwarded.
pub const MIN_BTC_DEPOSIT: u64 = 100_000;

/// The block walker. Exclusively owns the confirmation buffer and the
/// last-processed height.
pub struct BlockPipeline {
    last: u64,
    pool: HashMap<u64, Vec<TxEvent>>,
}

impl BlockPipeline {
    /// Starts a pipeline that resumes after `last` (the persisted
    /// checkpoint).
    pub fn new(last: u64) -> Self {
        Self {
            last,
            pool: HashMap::new(),
        }
    }

    /// Highest fully-processed height.
    pub fn last(&self) -> u64 {
        self.last
    }

    /// Walks from `last + 1` to the node's current tip, classifying
    /// every transaction and emitting notifications.
    ///
    /// An RPC failure stops the walk at the failing height; the next
    /// call resumes from there.
    pub async fn advance<R: Reader>(
        &mut self,
        rpc: &R,
        chain: Chain,
        book: &AddressBook,
        store: &UtxoStore,
        notify: &mpsc::Sender<Notification>,
    ) -> WalletResult<()> {
        let tip = match rpc.best_height().await {
            Ok(tip) => tip,
            Err(err) => {
                warn!(%err, "could not read best height");
                return Ok(());
            }
        };
        let stop = tip.saturating_sub(CONFIRM_DEPTH);

        let mut height = self.last + 1;
        while height <= tip {
            match self.process_height(rpc, chain, book, store, notify, height, stop).await {
                Ok(()) => {
                    self.last = height;
                    height += 1;
                }
                Err(err) => {
                    warn!(%height, %err, "block processing failed, retrying next tick");
                    break;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_height<R: Reader>(
        &mut self,
        rpc: &R,
        chain: Chain,
        book: &AddressBook,
        store: &UtxoStore,
        notify: &mpsc::Sender<Notification>,
        height: u64,
        stop: u64,
    ) -> WalletResult<()> {
        let hash = rpc.block_hash(height).await?;
        let block = rpc.block(&hash).await?;
        let block_time = u64::from(block.header.time);

        let mut events = Vec::new();
        // Index 0 is the coinbase.
        for tx in block.txdata.iter().skip(1) {
            let classified =
                classify_transaction(rpc, chain, book, store, tx, block_time, false).await?;
            events.extend(classified);
        }

        if height < stop {
            for event in events {
                emit(notify, Notification::Event(event)).await;
            }
            emit(notify, Notification::Checkpoint(height)).await;
            return Ok(());
        }

        // Confirmation window: park this height, release the one that
        // just aged out.
        if !events.is_empty() {
            debug!(%height, count = events.len(), "buffering events");
            self.pool.insert(height, events);
        }
        let Some(aged) = height.checked_sub(CONFIRM_DEPTH) else {
            return Ok(());
        };
        if let Some(matured) = self.pool.remove(&aged) {
            for event in matured {
                info!(txid = %event.txid, "transaction confirmed");
                emit(notify, Notification::Event(event)).await;
            }
            emit(notify, Notification::Checkpoint(aged)).await;
        }
        Ok(())
    }
}

async fn emit(notify: &mpsc::Sender<Notification>, message: Notification) {
    // A closed channel only happens during shutdown.
    if notify.send(message).await.is_err() {
        debug!("notify channel closed");
    }
}

/// The long-running ingestion task.
///
/// Advances the block walker on a 60-second ticker and on every
/// `hashblock` announcement, and applies mempool transactions
/// speculatively as they stream in. UTXO-mutating work holds the wallet
/// mutex so it serializes against the HTTP handlers.
pub async fn run_pipeline(
    wallet: Arc<Wallet>,
    mut feed: mpsc::Receiver<FeedEvent>,
    notify: mpsc::Sender<Notification>,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = wallet.last_height.load(Ordering::Relaxed);
    let mut pipeline = BlockPipeline::new(start);
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(%start, "block pipeline resuming");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                walk(&wallet, &mut pipeline, &notify).await;
            }
            event = feed.recv() => match event {
                Some(FeedEvent::NewBlock) => {
                    walk(&wallet, &mut pipeline, &notify).await;
                }
                Some(FeedEvent::RawTx(tx)) => {
                    let _guard = wallet.guard.lock().await;
                    if let Err(err) = classify_transaction(
                        &wallet.rpc,
                        wallet.chain,
                        &wallet.book,
                        &wallet.store,
                        &tx,
                        0,
                        true,
                    )
                    .await
                    {
                        debug!(%err, "mempool transaction skipped");
                    }
                }
                None => break,
            }
        }
    }
    info!(last = pipeline.last(), "block pipeline stopped");
}

async fn walk(wallet: &Wallet, pipeline: &mut BlockPipeline, notify: &mpsc::Sender<Notification>) {
    let _guard = wallet.guard.lock().await;
    if let Err(err) = pipeline
        .advance(&wallet.rpc, wallet.chain, &wallet.book, &wallet.store, notify)
        .await
    {
        warn!(%err, "pipeline advance failed");
    }
    wallet.last_height.store(pipeline.last(), Ordering::Relaxed);
}

/// Drains the notify channel in order, filters events the downstream
/// does not want, and hands the rest to the bookkeeping boundary (a log
/// line here; the fund-flow database lives outside this service).
pub async fn run_notifier<C: OmniReader>(
    rpc: C,
    mut notifications: mpsc::Receiver<Notification>,
) {
    while let Some(message) = notifications.recv().await {
        let event = match message {
            Notification::Checkpoint(height) => {
                debug!(%height, "downstream checkpoint");
                continue;
            }
            Notification::Event(event) => event,
        };

        // Dust-level BTC deposits are ignored.
        if event.coin == "BTC"
            && event.kind == EventKind::UserDeposit
            && event.amount < MIN_BTC_DEPOSIT
        {
            debug!(txid = %event.txid, amount = event.amount, "ignoring small btc deposit");
            continue;
        }

        // USDT events must be valid under Omni consensus.
        if event.coin == "USDT" {
            let Ok(txid) = event.txid.parse() else {
                warn!(txid = %event.txid, "unparseable txid on notify channel");
                continue;
            };
            match rpc.omni_tx_status(&txid).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(txid = %event.txid, "omni transaction is invalid, dropping");
                    continue;
                }
                Err(err) => {
                    warn!(txid = %event.txid, %err, "omni status check failed, dropping");
                    continue;
                }
            }
        }

        let amount = crate::shift::left_shift(&event.amount.to_string(), 8);
        let fee = crate::shift::left_shift(&event.fee.to_string(), 8);
        match event.kind {
            EventKind::UserDeposit => {
                info!(coin = %event.coin, %amount, address = %event.address, txid = %event.txid, "deposit");
            }
            EventKind::UserWithdraw => {
                info!(coin = %event.coin, %amount, address = %event.address, txid = %event.txid, %fee, "withdraw");
            }
            EventKind::AdminDeposit | EventKind::AdminWithdraw | EventKind::FundCollection => {
                info!(kind = ?event.kind, coin = %event.coin, %amount, address = %event.address, txid = %event.txid, "operator transfer");
            }
        }
    }
}
