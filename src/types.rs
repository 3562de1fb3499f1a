use bitcoin::{consensus::encode, Block, Transaction};
use serde::{Deserialize, Serialize};

/// Result of JSON-RPC method `getblockchaininfo`.
///
/// Method call: `getblockchaininfo`
///
/// > Returns an object containing various state info regarding blockchain processing.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GetBlockchainInfo {
    /// Current network name as defined in BIP70 (main, test, signet, regtest).
    pub chain: String,
    /// The current number of blocks processed in the server.
    pub blocks: u64,
    /// The current number of headers we have validated.
    pub headers: u64,
    /// The hash of the currently best block.
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: String,
    /// Estimate of whether this node is in Initial Block Download (IBD) mode.
    #[serde(rename = "initialblockdownload")]
    pub initial_block_download: bool,
}

/// Result of JSON-RPC method `getblock` with verbosity set to 0.
///
/// A string that is serialized, hex-encoded data for block 'hash'.
///
/// Method call: `getblock "blockhash" ( verbosity )`
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct GetBlockVerbosityZero(pub String);

impl GetBlockVerbosityZero {
    /// Converts json straight to a [`Block`].
    pub fn block(self) -> Result<Block, encode::FromHexError> {
        let block: Block = encode::deserialize_hex(&self.0)?;
        Ok(block)
    }
}

/// Result of JSON-RPC method `getrawtransaction` with verbosity set to 0.
///
/// A string that is serialized, hex-encoded data for transaction.
///
/// Method call: `getrawtransaction "txid" ( verbosity )`
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct GetRawTransactionVerbosityZero(pub String);

impl GetRawTransactionVerbosityZero {
    /// Converts json straight to a [`Transaction`].
    pub fn transaction(self) -> Result<Transaction, encode::FromHexError> {
        let transaction: Transaction = encode::deserialize_hex(&self.0)?;
        Ok(transaction)
    }
}

/// Result of JSON-RPC method `omni_gettransaction`.
///
/// Method call: `omni_gettransaction "txid"`
///
/// Only the fields the wallet inspects are modeled; Omni Core returns
/// many more.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct OmniTransaction {
    pub txid: String,
    #[serde(rename = "sendingaddress")]
    pub sending_address: Option<String>,
    #[serde(rename = "referenceaddress")]
    pub reference_address: Option<String>,
    /// Whether the transaction is valid under Omni consensus. Absent
    /// while unconfirmed.
    pub valid: Option<bool>,
    #[serde(rename = "propertyid")]
    pub property_id: Option<u32>,
    /// Human-readable transaction type, e.g. "Simple Send".
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Divisible token amount as a decimal string.
    pub amount: Option<String>,
    #[serde(default)]
    pub confirmations: i64,
}

/// Result of JSON-RPC method `omni_getbalance`.
///
/// Method call: `omni_getbalance "address" propertyid`
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct OmniBalance {
    /// Available balance as a decimal string.
    pub balance: String,
    /// Amount reserved by open orders.
    pub reserved: String,
    /// Amount frozen by the issuer.
    pub frozen: Option<String>,
}

/// One entry of JSON-RPC method `omni_listpendingtransactions`.
///
/// Method call: `omni_listpendingtransactions ( "address" )`
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct OmniPendingTransaction {
    pub txid: String,
    #[serde(rename = "sendingaddress")]
    pub sending_address: String,
    #[serde(rename = "referenceaddress")]
    pub reference_address: Option<String>,
    #[serde(rename = "propertyid")]
    pub property_id: Option<u32>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub amount: Option<String>,
    #[serde(default)]
    pub confirmations: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omni_transaction_deserializes() {
        let raw = r#"{
            "txid": "0f8b9a2c6f5a8d7e6b4c3d2e1f0a9b8c7d6e5f4a3b2c1d0e9f8a7b6c5d4e3f2a",
            "sendingaddress": "1PMycacnJaSqwwJqjawXBErnLsZ7RkXUAs",
            "referenceaddress": "1BpEi6DfDAUFd7GtittLSdBeYJvcoaVggu",
            "ismine": false,
            "confirmations": 12,
            "type": "Simple Send",
            "propertyid": 31,
            "amount": "1.00000000",
            "valid": true
        }"#;
        let tx: OmniTransaction = serde_json::from_str(raw).unwrap();
        assert_eq!(tx.valid, Some(true));
        assert_eq!(tx.property_id, Some(31));
        assert_eq!(tx.kind.as_deref(), Some("Simple Send"));
        assert_eq!(tx.confirmations, 12);
    }

    #[test]
    fn omni_pending_defaults_confirmations() {
        let raw = r#"{
            "txid": "0f8b9a2c6f5a8d7e6b4c3d2e1f0a9b8c7d6e5f4a3b2c1d0e9f8a7b6c5d4e3f2a",
            "sendingaddress": "1PMycacnJaSqwwJqjawXBErnLsZ7RkXUAs",
            "type": "Simple Send",
            "propertyid": 31,
            "amount": "0.50000000"
        }"#;
        let tx: OmniPendingTransaction = serde_json::from_str(raw).unwrap();
        assert_eq!(tx.confirmations, 0);
    }
}
