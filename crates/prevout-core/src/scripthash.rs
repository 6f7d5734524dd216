//! Electrum scripthashes: SHA-256 of the output script, byte-reversed,
//! lower-case hex.

use std::str::FromStr;

use bitcoin::address::NetworkUnchecked;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::hex::DisplayHex;
use bitcoin::{Address, Network, Script};

use crate::error::CoreError;

pub fn script_scripthash(script: &Script) -> String {
    let mut hash = sha256::Hash::hash(script.as_bytes()).to_byte_array();
    hash.reverse();
    hash.as_slice().to_lower_hex_string()
}

/// Parse `address` and check it belongs to `network`.
pub fn parse_address(address: &str, network: Network) -> Result<Address, CoreError> {
    let invalid = |reason: String| CoreError::InvalidAddress {
        address: address.to_owned(),
        reason,
    };
    Address::<NetworkUnchecked>::from_str(address)
        .map_err(|e| invalid(e.to_string()))?
        .require_network(network)
        .map_err(|e| invalid(e.to_string()))
}

/// Scripthash of the output script paying to `address`.
pub fn address_scripthash(address: &str, network: Network) -> Result<String, CoreError> {
    let address = parse_address(address, network)?;
    Ok(script_scripthash(&address.script_pubkey()))
}
