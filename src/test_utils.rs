//! Deterministic in-memory chain used by classifier and pipeline tests.

use std::collections::{BTreeMap, HashMap};

use bitcoin::{
    absolute::LockTime, block, block::Header, hashes::Hash, transaction::Version, Amount, Block,
    BlockHash, CompactTarget, ScriptBuf, Transaction, TxIn, TxMerkleNode, TxOut, Txid,
};

use crate::{client::ClientResult, error::ClientError, traits::Reader};

/// A fake node serving blocks and raw transactions from memory.
#[derive(Default)]
pub struct MockChain {
    pub txs: HashMap<Txid, Transaction>,
    pub blocks: BTreeMap<u64, Block>,
}

impl MockChain {
    /// Makes a transaction fetchable through [`Reader::raw_tx`].
    pub fn insert_tx(&mut self, tx: &Transaction) {
        self.txs.insert(tx.compute_txid(), tx.clone());
    }

    /// Appends a block at `height` containing a coinbase followed by
    /// `txs`, all of which become fetchable as raw transactions.
    pub fn push_block(&mut self, height: u64, txs: Vec<Transaction>) {
        let mut txdata = vec![coinbase(height)];
        txdata.extend(txs);
        for tx in &txdata {
            self.insert_tx(tx);
        }

        let header = Header {
            version: block::Version::from_consensus(2),
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_600_000_000 + height as u32,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: height as u32,
        };
        self.blocks.insert(height, Block { header, txdata });
    }
}

fn coinbase(height: u64) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn::default()],
        output: vec![TxOut {
            value: Amount::from_sat(50 * 100_000_000 + height),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

impl Reader for MockChain {
    async fn best_height(&self) -> ClientResult<u64> {
        Ok(self.blocks.keys().next_back().copied().unwrap_or(0))
    }

    async fn block_hash(&self, height: u64) -> ClientResult<BlockHash> {
        self.blocks
            .get(&height)
            .map(|b| b.block_hash())
            .ok_or_else(|| ClientError::Other(format!("no block at height {height}")))
    }

    async fn block(&self, hash: &BlockHash) -> ClientResult<Block> {
        self.blocks
            .values()
            .find(|b| b.block_hash() == *hash)
            .cloned()
            .ok_or_else(|| ClientError::Other(format!("no block with hash {hash}")))
    }

    async fn raw_tx(&self, txid: &Txid) -> ClientResult<Transaction> {
        self.txs
            .get(txid)
            .cloned()
            .ok_or_else(|| ClientError::Other(format!("no transaction {txid}")))
    }
}
