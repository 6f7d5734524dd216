//! Electrum protocol layer.
//!
//! Defines the [`ElectrumRpc`] trait consumed by the resolution engine and
//! provides the connection-backed implementation ([`ElectrumClient`]) plus a
//! test mock (`mock::MockRpc`).

mod client;
mod context;
mod dispatcher;
#[cfg(test)]
pub mod mock;
mod protocol;
pub mod types;

pub use client::{ElectrumClient, Subscription};
pub use context::{CallContext, Interrupt};
pub use dispatcher::{Dispatcher, DispatcherOptions};
pub use types::{
    Balance, HeaderNotification, MerkleFromPos, MerkleProof, ScripthashStatus, ServerVersion,
    Utxo,
};

use async_trait::async_trait;
use bitcoin::Txid;

use crate::error::CoreError;
use crate::types::{HistoryEntry, Transaction};

/// The Electrum methods the resolution engine needs.
///
/// Implementations handle connection management and response decoding
/// internally; every call honours the given context's cancellation and
/// deadline.
#[async_trait]
pub trait ElectrumRpc: Send + Sync {
    /// `blockchain.transaction.get` in verbose mode.
    async fn get_transaction(&self, ctx: &CallContext, txid: &Txid)
        -> Result<Transaction, CoreError>;

    /// `blockchain.scripthash.get_history`: confirmed entries first, then
    /// mempool entries.
    async fn get_history(
        &self,
        ctx: &CallContext,
        scripthash: &str,
    ) -> Result<Vec<HistoryEntry>, CoreError>;
}
