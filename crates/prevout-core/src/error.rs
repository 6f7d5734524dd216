use std::fmt;

use bitcoin::{Amount, Txid};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("invalid transaction data: {0}")]
    InvalidTxData(String),

    #[error("invalid address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("output {vout} not found in transaction {txid}")]
    PrevoutMissing { txid: Txid, vout: u32 },

    #[error("transaction {txid} has outputs ({outputs_total}) exceeding its inputs ({inputs_total})")]
    NegativeFee {
        txid: Txid,
        inputs_total: Amount,
        outputs_total: Amount,
    },

    #[error("failed to resolve {step} of transaction {txid}: {source}")]
    Resolution {
        txid: Txid,
        step: ResolveStep,
        #[source]
        source: Box<CoreError>,
    },

    #[error("resolution task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Wrap `self` with the transaction and resolution step it failed in.
    pub(crate) fn during(self, txid: Txid, step: ResolveStep) -> Self {
        CoreError::Resolution {
            txid,
            step,
            source: Box::new(self),
        }
    }
}

/// Which part of a resolution failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveStep {
    /// Fetching the ancestor referenced by input `input`.
    Ancestor { input: usize, txid: Txid, vout: u32 },
    /// Fetching or resolving one entry of a scripthash history.
    HistoryEntry { position: usize, height: i64 },
    /// Reading the transaction's own inputs.
    Inputs,
}

impl fmt::Display for ResolveStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ancestor { input, txid, vout } => {
                write!(f, "input {input} (prevout {txid}:{vout})")
            }
            Self::HistoryEntry { position, height } => {
                write!(f, "history entry {position} (height {height})")
            }
            Self::Inputs => write!(f, "inputs"),
        }
    }
}

// ==============================================================================
// Transport
// ==============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid server address `{0}`")]
    InvalidAddress(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {addr}")]
    ConnectTimeout { addr: String },

    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TLS server name `{0}`")]
    InvalidServerName(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] rustls::Error),

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("connection closed")]
    Closed,
}

// ==============================================================================
// RPC
// ==============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("call `{method}` timed out")]
    Timeout { method: String },

    #[error("call `{method}` was cancelled")]
    Cancelled { method: String },

    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

// ==============================================================================
// Cache
// ==============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cache payload (de)serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("unknown detail level {0} in cache row")]
    UnknownDetailLevel(i64),

    #[error("cache is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
