use bitcoin::{Block, BlockHash, Transaction, Txid};
use std::future::Future;

use crate::{
    client::ClientResult,
    types::{OmniBalance, OmniPendingTransaction},
};

/// Chain-reading functionality the block pipeline and the classifier
/// need from a node.
///
/// # Note
///
/// This is a fully `async` trait. The user should be responsible for
/// handling the `async` nature of the trait methods. And if implementing
/// this trait for a specific type that is not `async`, the user should
/// consider wrapping with [`tokio`](https://tokio.rs)'s
/// [`spawn_blocking`](https://docs.rs/tokio/latest/tokio/task/fn.spawn_blocking.html)
/// or any other method.
pub trait Reader {
    /// Gets the height of the most-work fully-validated chain.
    ///
    /// # Note
    ///
    /// The genesis block has a height of 0.
    fn best_height(&self) -> impl Future<Output = ClientResult<u64>> + Send;

    /// Gets the [`BlockHash`] at given height.
    fn block_hash(&self, height: u64) -> impl Future<Output = ClientResult<BlockHash>> + Send;

    /// Gets a [`Block`] with the given hash.
    fn block(&self, hash: &BlockHash) -> impl Future<Output = ClientResult<Block>> + Send;

    /// Gets a raw [`Transaction`] by its [`Txid`].
    fn raw_tx(&self, txid: &Txid) -> impl Future<Output = ClientResult<Transaction>> + Send;
}

/// Broadcasting functionality.
pub trait Broadcaster {
    /// Sends a raw transaction to the network.
    ///
    /// # Note
    ///
    /// A node answer of "transaction already in block chain" is treated
    /// as success and returns the computed [`Txid`].
    fn send_raw_transaction(
        &self,
        tx: &Transaction,
    ) -> impl Future<Output = ClientResult<Txid>> + Send;
}

/// Omni-layer queries, served by Omni Core alongside the base RPC.
pub trait OmniReader {
    /// Whether the Omni transaction is valid under embedded consensus.
    /// Unconfirmed transactions report `false`.
    fn omni_tx_status(&self, txid: &Txid) -> impl Future<Output = ClientResult<bool>> + Send;

    /// Confirmed token balance of `address` as a decimal string.
    fn omni_balance(
        &self,
        address: &str,
        property_id: u32,
    ) -> impl Future<Output = ClientResult<OmniBalance>> + Send;

    /// Pending (0-conf) Omni transactions touching `address`.
    fn omni_pending(
        &self,
        address: &str,
    ) -> impl Future<Output = ClientResult<Vec<OmniPendingTransaction>>> + Send;
}
