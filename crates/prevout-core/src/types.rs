//! Domain types for transactions as served by Electrum servers.
//!
//! Contains the raw verbose transaction (`Transaction`, `TxIn`, `TxOut`),
//! its fully resolved counterpart (`DetailedTransaction`, `ResolvedInput`),
//! and scripthash history entries. Field names follow the server's JSON so
//! the same types decode responses and encode cache payloads.

use bitcoin::amount::serde::as_btc;
use bitcoin::{Amount, BlockHash, OutPoint, Txid};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ==============================================================================
// Transaction Metadata
// ==============================================================================

/// Fields shared by raw and detailed transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxMeta {
    pub txid: Txid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub version: u32,
    pub locktime: u32,
    #[serde(default)]
    pub size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsize: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
    #[serde(
        rename = "blockhash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub block_hash: Option<BlockHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    #[serde(
        rename = "blocktime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub block_time: Option<u64>,
    /// Blocks mined on top of (and including) the confirming block.
    /// Absent on the wire for mempool transactions, decoded as 0.
    #[serde(default)]
    pub confirmations: u32,
}

// ==============================================================================
// Raw Transaction
// ==============================================================================

/// A transaction as returned by `blockchain.transaction.get` in verbose mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(flatten)]
    pub meta: TxMeta,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
}

impl Transaction {
    pub fn txid(&self) -> Txid {
        self.meta.txid
    }

    pub fn confirmations(&self) -> u32 {
        self.meta.confirmations
    }

    /// A coinbase transaction has exactly one input carrying coinbase data.
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].is_coinbase()
    }

    /// The output with index `n`, looked up by its declared index.
    pub fn output(&self, n: u32) -> Option<&TxOut> {
        self.vout
            .get(n as usize)
            .filter(|out| out.n == n)
            .or_else(|| self.vout.iter().find(|out| out.n == n))
    }
}

/// A transaction input in the server's verbose form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxIn {
    /// Coinbase script data; present only on coinbase inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coinbase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<Txid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vout: Option<u32>,
    #[serde(
        rename = "scriptSig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub script_sig: Option<ScriptSig>,
    #[serde(
        rename = "txinwitness",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub witness: Vec<String>,
    pub sequence: u32,
}

impl TxIn {
    pub fn is_coinbase(&self) -> bool {
        self.coinbase.is_some()
    }

    /// The outpoint this input spends. `Ok(None)` for coinbase inputs; an
    /// error when a non-coinbase input lacks its `txid`/`vout` reference.
    pub fn previous_output(&self) -> Result<Option<OutPoint>, CoreError> {
        if self.is_coinbase() {
            return Ok(None);
        }
        match (self.txid, self.vout) {
            (Some(txid), Some(vout)) => Ok(Some(OutPoint::new(txid, vout))),
            _ => Err(CoreError::InvalidTxData(
                "non-coinbase input without txid/vout".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSig {
    #[serde(default)]
    pub asm: String,
    #[serde(default)]
    pub hex: String,
}

/// A transaction output. `value` is decoded from the server's BTC decimal
/// into an exact satoshi `Amount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOut {
    pub n: u32,
    #[serde(with = "as_btc")]
    pub value: Amount,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub asm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
    /// Script template name as reported by the server (`pubkeyhash`,
    /// `witness_v0_keyhash`, `nulldata`, ...).
    #[serde(rename = "type", default)]
    pub script_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Legacy multi-address field emitted by older servers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(rename = "reqSigs", default, skip_serializing_if = "Option::is_none")]
    pub req_sigs: Option<u32>,
}

// ==============================================================================
// Detailed Transaction
// ==============================================================================

/// An input together with a copy of the output it spends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInput {
    #[serde(flatten)]
    pub input: TxIn,
    /// `None` only for coinbase inputs, which spend nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prevout: Option<TxOut>,
}

/// A transaction whose inputs have all been resolved to their prevouts,
/// plus totals derived from them.
///
/// Built once per resolution and immutable afterwards, so it is safe to
/// cache and share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedTransaction {
    #[serde(flatten)]
    pub meta: TxMeta,
    pub vin: Vec<ResolvedInput>,
    pub vout: Vec<TxOut>,
    #[serde(with = "as_btc")]
    pub inputs_total: Amount,
    #[serde(with = "as_btc")]
    pub outputs_total: Amount,
    /// `inputs_total - outputs_total`; `None` for coinbase transactions.
    #[serde(default, with = "as_btc::opt", skip_serializing_if = "Option::is_none")]
    pub fee: Option<Amount>,
}

impl DetailedTransaction {
    pub fn txid(&self) -> Txid {
        self.meta.txid
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].input.is_coinbase()
    }

    /// Drop the resolved prevouts, recovering the raw transaction.
    pub fn to_transaction(&self) -> Transaction {
        Transaction {
            meta: self.meta.clone(),
            vin: self.vin.iter().map(|r| r.input.clone()).collect(),
            vout: self.vout.clone(),
        }
    }
}

// ==============================================================================
// Scripthash History
// ==============================================================================

/// One entry of `blockchain.scripthash.get_history` / `get_mempool`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tx_hash: Txid,
    /// Confirming block height; 0 or -1 for mempool transactions.
    pub height: i64,
    /// Mempool fee in satoshis, only reported for unconfirmed entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
}

impl HistoryEntry {
    pub fn is_mempool(&self) -> bool {
        self.height <= 0
    }
}

/// A history entry with its resolved transaction and direction relative
/// to the queried address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedHistoryEntry {
    #[serde(flatten)]
    pub tx: DetailedTransaction,
    pub height: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mempool_fee: Option<u64>,
    /// `true` when the address receives an output of this transaction.
    pub incoming: bool,
}
