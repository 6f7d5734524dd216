use std::path::PathBuf;

use bitcoin::{Network, Txid};
use clap::{Parser, Subcommand};

/// prevout: Electrum client that resolves transaction inputs and classifies
/// address history, with a durable transaction cache.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Electrum server: `ssl://host:port`, `tcp://host:port` or bare
    /// `host:port` (plaintext).
    #[arg(
        long,
        default_value = "ssl://electrum.blockstream.info:50002",
        env = "PREVOUT_SERVER"
    )]
    pub server: String,

    /// Accept any TLS certificate (self-signed servers). Development only.
    #[arg(long)]
    pub insecure_tls: bool,

    /// Timeout for TCP connect plus TLS handshake.
    #[arg(long, default_value = "10")]
    pub connect_timeout_secs: u64,

    /// Timeout applied to every call.
    #[arg(long, default_value = "30")]
    pub request_timeout_secs: u64,

    /// Outbound request rate limit (unlimited when omitted).
    #[arg(long)]
    pub requests_per_second: Option<u32>,

    /// SQLite file for the transaction cache.
    #[arg(long, default_value = "tx_cache.db", env = "PREVOUT_CACHE")]
    pub cache_path: PathBuf,

    /// Network addresses are checked against.
    #[arg(long, default_value = "bitcoin")]
    pub network: Network,

    /// Concurrent ancestor fetches per transaction.
    #[arg(long, default_value = "20")]
    pub input_concurrency: usize,

    /// Concurrent entry resolutions per history.
    #[arg(long, default_value = "10")]
    pub history_concurrency: usize,

    /// Log every wire frame (`prevout::wire=trace`).
    #[arg(long)]
    pub wire_trace: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Negotiate the protocol version and print the server banner.
    Version,
    /// Fetch a transaction as served (through the cache).
    Tx { txid: Txid },
    /// Fetch a transaction with every input resolved and its fee.
    TxDetail { txid: Txid },
    /// Resolved, classified history of an address plus totals.
    History { address: String },
    /// Confirmed and unconfirmed balance of an address.
    Balance { address: String },
    /// Unspent outputs of an address.
    Utxos { address: String },
    /// Broadcast a serialized transaction given as hex.
    Broadcast { raw_tx_hex: String },
    /// Merkle proof of a transaction confirmed at `height`.
    Merkle { txid: Txid, height: u32 },
    /// Print every new chain tip until interrupted.
    WatchHeaders,
}
