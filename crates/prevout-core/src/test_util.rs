//! Shared test helpers for `prevout-core` unit tests.
//!
//! Builder functions for transactions, inputs, outputs and history entries
//! so that tests across modules share a single source of truth for dummy
//! data construction.

use bitcoin::hashes::Hash;
use bitcoin::{Amount, Txid};

use crate::types::{HistoryEntry, ScriptPubKey, ScriptSig, Transaction, TxIn, TxMeta, TxOut};

/// A mainnet P2SH address used as "the queried address" in tests.
pub const WATCHED_ADDRESS: &str = "3AwUscZWWWqgkEg3t4Xb9kY6c281KDwHW2";
/// Some other address that never matches [`WATCHED_ADDRESS`].
pub const OTHER_ADDRESS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";

// ==============================================================================
// Txid Helpers
// ==============================================================================

/// Create a deterministic `Txid` from a single distinguishing byte.
pub fn txid_from_byte(b: u8) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    Txid::from_byte_array(bytes)
}

// ==============================================================================
// Transaction Builders
// ==============================================================================

/// Build a confirmed transaction (100 confirmations, so cacheable under the
/// default threshold). Override `meta` fields after construction when needed.
pub fn make_tx(txid: Txid, vin: Vec<TxIn>, vout: Vec<TxOut>) -> Transaction {
    Transaction {
        meta: TxMeta {
            txid,
            hash: None,
            version: 2,
            locktime: 0,
            size: 250,
            vsize: Some(140),
            weight: Some(560),
            hex: None,
            block_hash: None,
            time: Some(1_700_000_000),
            block_time: Some(1_700_000_000),
            confirmations: 100,
        },
        vin,
        vout,
    }
}

/// Same as [`make_tx`] with an explicit confirmation count.
pub fn make_tx_with_confirmations(
    txid: Txid,
    vin: Vec<TxIn>,
    vout: Vec<TxOut>,
    confirmations: u32,
) -> Transaction {
    let mut tx = make_tx(txid, vin, vout);
    tx.meta.confirmations = confirmations;
    tx
}

/// A coinbase input (no prevout).
pub fn coinbase_input() -> TxIn {
    TxIn {
        coinbase: Some("03a0bb0d".into()),
        txid: None,
        vout: None,
        script_sig: None,
        witness: Vec::new(),
        sequence: 0xFFFFFFFF,
    }
}

/// A spending input referencing `funding_txid:vout`.
pub fn spending_input(funding_txid: Txid, vout: u32) -> TxIn {
    TxIn {
        coinbase: None,
        txid: Some(funding_txid),
        vout: Some(vout),
        script_sig: Some(ScriptSig {
            asm: String::new(),
            hex: String::new(),
        }),
        witness: Vec::new(),
        sequence: 0xFFFFFFFE,
    }
}

/// An output with index `n` paying `sats` to [`OTHER_ADDRESS`].
pub fn make_output(n: u32, sats: u64) -> TxOut {
    make_output_to(n, sats, OTHER_ADDRESS)
}

/// An output with index `n` paying `sats` to `address`.
pub fn make_output_to(n: u32, sats: u64, address: &str) -> TxOut {
    TxOut {
        n,
        value: Amount::from_sat(sats),
        script_pub_key: ScriptPubKey {
            script_type: "scripthash".into(),
            address: Some(address.to_owned()),
            ..Default::default()
        },
    }
}

/// An output that names its address only in the legacy `addresses` list.
pub fn make_legacy_output(n: u32, sats: u64, addresses: &[&str]) -> TxOut {
    TxOut {
        n,
        value: Amount::from_sat(sats),
        script_pub_key: ScriptPubKey {
            script_type: "multisig".into(),
            addresses: addresses.iter().map(|a| (*a).to_owned()).collect(),
            ..Default::default()
        },
    }
}

/// An `OP_RETURN` output without any address.
pub fn data_output(n: u32) -> TxOut {
    TxOut {
        n,
        value: Amount::ZERO,
        script_pub_key: ScriptPubKey {
            asm: "OP_RETURN 68656c6c6f".into(),
            script_type: "nulldata".into(),
            ..Default::default()
        },
    }
}

// ==============================================================================
// History Builders
// ==============================================================================

pub fn history_entry(txid: Txid, height: i64) -> HistoryEntry {
    HistoryEntry {
        tx_hash: txid,
        height,
        fee: None,
    }
}
