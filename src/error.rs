use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned inside a JSON-RPC response by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("RPC server returned error '{message}' (code: {code})")]
pub struct BitcoinRpcError {
    pub code: i32,
    pub message: String,
}

/// The error type for errors produced in the [`Client`](crate::client::Client).
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Missing or invalid RPC parameter.
    #[error("missing or invalid rpc params: {0}")]
    Param(String),

    /// Error returned by the RPC server.
    #[error("RPC server returned error '{1}' (code: {0})")]
    Server(i32, String),

    /// Error parsing the RPC response.
    #[error("error parsing rpc response: {0}")]
    Parse(String),

    /// Unrecoverable error with the response body.
    #[error("error with rpc response body: {0}")]
    Body(String),

    /// Non-2xx HTTP status code.
    #[error("HTTP status {0}: {1}")]
    Status(u16, String),

    /// Malformed response from the server, may be recoverable.
    #[error("malformed rpc response: {0}")]
    MalformedResponse(String),

    /// Could not connect to the server, may be recoverable.
    #[error("could not connect to the rpc server: {0}")]
    Connection(String),

    /// Request timed out, may be recoverable.
    #[error("rpc request timed out")]
    Timeout,

    /// Generic request error, may be recoverable.
    #[error("rpc request error: {0}")]
    Request(String),

    /// Error building the request.
    #[error("error building the rpc request: {0}")]
    ReqBuilder(String),

    /// Unexpected HTTP redirect.
    #[error("unexpected HTTP redirect: {0}")]
    HttpRedirect(String),

    /// The maximum number of retries was exceeded.
    #[error("max retries exceeded: {0}")]
    MaxRetriesExceeded(u8),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// Whether the failure is a transport-level one (connection, timeout),
    /// as opposed to an error reported by the node itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_)
                | ClientError::Timeout
                | ClientError::MaxRetriesExceeded(_)
                | ClientError::Status(..)
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(format!("Could not parse response: {value}"))
    }
}

/// The error type for wallet core operations.
#[derive(Debug, Error)]
pub enum WalletError {
    /// The configuration file is missing, unreadable, or inconsistent.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// An RPC call failed; [`ClientError::is_transport`] distinguishes an
    /// unavailable node from a peer-reported error.
    #[error("rpc failure: {0}")]
    Rpc(#[from] ClientError),

    /// Malformed hex, script, or serialized transaction.
    #[error("decode error: {0}")]
    Decode(String),

    /// The configured chain name is not one we know how to operate.
    #[error("unknown chain: {0}")]
    UnknownChain(String),

    /// Address failed validation for the configured chain.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The destination is one of our own addresses.
    #[error("refusing to transfer within the same wallet")]
    SelfTransfer,

    /// Malformed extended key or an unusable child derivation.
    #[error("invalid extended key")]
    InvalidKey,

    /// The candidate UTXO set cannot cover outputs plus fee.
    #[error("insufficient funds: have {have} sat, need {need} sat")]
    InsufficientFunds { have: u64, need: u64 },

    /// A transaction input is not backed by a wallet-owned UTXO.
    #[error("input {txid}:{vout} is not spendable by this wallet")]
    UnspendableInput { txid: String, vout: u32 },

    /// Local signing only spends change-branch outputs; deposit-branch
    /// inputs go through the hardware-wallet path.
    #[error("refusing to sign a deposit-branch input")]
    ForbiddenInputBranch,

    /// Omni-layer operations are only valid on BTC.
    #[error("omni transactions are not supported on {0}")]
    OmniUnsupportedOnChain(String),

    /// Requested Omni amount exceeds confirmed balance minus pending sends.
    #[error("pending omni sends exceed balance: available {available}, requested {requested}")]
    PendingBalanceExceeded { available: u64, requested: u64 },

    /// The UTXO index store failed.
    #[error("utxo store error: {0}")]
    Store(#[from] sled::Error),
}

/// This is an alias for the result type returned by wallet core operations.
pub type WalletResult<T> = Result<T, WalletError>;
