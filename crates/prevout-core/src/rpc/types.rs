//! Result types for Electrum methods that pass through unchanged.
//!
//! Transactions and history entries are shared domain types in
//! `crate::types`; this module only covers the remaining method results.

use bitcoin::amount::serde::as_sat;
use bitcoin::{Amount, SignedAmount, Txid};
use serde::{Deserialize, Serialize};

// ==============================================================================
// Server
// ==============================================================================

/// `server.version` result, sent by the server as a two-element array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct ServerVersion {
    pub server_software: String,
    pub protocol_version: String,
}

impl From<(String, String)> for ServerVersion {
    fn from((server_software, protocol_version): (String, String)) -> Self {
        Self {
            server_software,
            protocol_version,
        }
    }
}

impl From<ServerVersion> for (String, String) {
    fn from(version: ServerVersion) -> Self {
        (version.server_software, version.protocol_version)
    }
}

// ==============================================================================
// Scripthash
// ==============================================================================

/// `blockchain.scripthash.get_balance`. The unconfirmed part may be negative
/// when mempool transactions spend confirmed coins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    #[serde(with = "as_sat")]
    pub confirmed: Amount,
    #[serde(with = "as_sat")]
    pub unconfirmed: SignedAmount,
}

/// One entry of `blockchain.scripthash.listunspent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub tx_hash: Txid,
    pub tx_pos: u32,
    /// 0 for unconfirmed outputs.
    pub height: i64,
    #[serde(with = "as_sat")]
    pub value: Amount,
}

/// A status change pushed for a subscribed scripthash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, Option<String>)", into = "(String, Option<String>)")]
pub struct ScripthashStatus {
    pub scripthash: String,
    /// Hash of the scripthash's history; `None` when it has none.
    pub status: Option<String>,
}

impl From<(String, Option<String>)> for ScripthashStatus {
    fn from((scripthash, status): (String, Option<String>)) -> Self {
        Self { scripthash, status }
    }
}

impl From<ScripthashStatus> for (String, Option<String>) {
    fn from(status: ScripthashStatus) -> Self {
        (status.scripthash, status.status)
    }
}

// ==============================================================================
// Merkle Proofs
// ==============================================================================

/// `blockchain.transaction.get_merkle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub merkle: Vec<String>,
    pub block_height: u32,
    pub pos: u32,
}

/// `blockchain.transaction.id_from_pos` with `merkle = true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleFromPos {
    pub tx_hash: Txid,
    pub merkle: Vec<String>,
}

// ==============================================================================
// Headers
// ==============================================================================

/// Chain tip as returned by `blockchain.headers.subscribe` and pushed on
/// every new block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderNotification {
    pub height: u32,
    /// Serialized block header, hex encoded.
    pub hex: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_version_decodes_from_pair() {
        let v: ServerVersion = serde_json::from_value(json!(["ElectrumX 1.16.0", "1.4"])).unwrap();
        assert_eq!(v.server_software, "ElectrumX 1.16.0");
        assert_eq!(v.protocol_version, "1.4");
    }

    #[test]
    fn balance_is_in_satoshis_and_may_be_negative() {
        let b: Balance =
            serde_json::from_value(json!({"confirmed": 103873966, "unconfirmed": -23684})).unwrap();
        assert_eq!(b.confirmed, Amount::from_sat(103_873_966));
        assert_eq!(b.unconfirmed, SignedAmount::from_sat(-23_684));
    }

    #[test]
    fn scripthash_status_accepts_null_status() {
        let s: ScripthashStatus = serde_json::from_value(json!(["ab", null])).unwrap();
        assert_eq!(s.scripthash, "ab");
        assert_eq!(s.status, None);
    }

    #[test]
    fn pair_shaped_results_serialize_back_to_pairs() {
        let version = ServerVersion {
            server_software: "Fulcrum 1.9.1".into(),
            protocol_version: "1.4".into(),
        };
        let rendered = serde_json::to_value(&version).unwrap();
        assert_eq!(rendered, json!(["Fulcrum 1.9.1", "1.4"]));
        assert_eq!(serde_json::from_value::<ServerVersion>(rendered).unwrap(), version);

        let status = ScripthashStatus {
            scripthash: "ab".into(),
            status: Some("cd".into()),
        };
        let rendered = serde_json::to_value(&status).unwrap();
        assert_eq!(rendered, json!(["ab", "cd"]));
        assert_eq!(serde_json::from_value::<ScripthashStatus>(rendered).unwrap(), status);
    }
}
