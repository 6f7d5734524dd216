//! Typed Electrum methods over a [`Dispatcher`].

use std::marker::PhantomData;
use std::num::NonZeroU32;

use async_trait::async_trait;
use bitcoin::{Amount, Txid};
use futures::future::try_join_all;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{CoreError, RpcError};
use crate::transport::{parse_server, Connection, Security, ServerAddr};
use crate::types::{HistoryEntry, Transaction};

use super::context::CallContext;
use super::dispatcher::{Dispatcher, DispatcherOptions};
use super::types::{
    Balance, HeaderNotification, MerkleFromPos, MerkleProof, ScripthashStatus, ServerVersion, Utxo,
};
use super::ElectrumRpc;

const HEADERS_SUBSCRIBE: &str = "blockchain.headers.subscribe";
const SCRIPTHASH_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";

/// Client for one Electrum server connection.
///
/// All methods take `&self`; concurrent calls are multiplexed over the
/// single connection.
pub struct ElectrumClient {
    dispatcher: Dispatcher,
    server: String,
}

impl ElectrumClient {
    /// Dial the configured server and start the dispatcher.
    pub async fn connect(config: &ClientConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let addr = parse_server(&config.server)?;
        let security = Security::for_address(&addr, config.certificate_policy);
        let connection = Connection::open(&addr, security, &config.dial_options()).await?;
        info!(server = %addr, "connected to electrum server");
        Ok(Self::from_connection(connection, &addr, config))
    }

    /// Wrap an established connection, e.g. one over an in-memory pipe.
    pub fn from_connection(connection: Connection, addr: &ServerAddr, config: &ClientConfig) -> Self {
        let options = DispatcherOptions {
            request_timeout: config.request_timeout,
            requests_per_second: config.requests_per_second.and_then(NonZeroU32::new),
            notification_buffer: config.notification_buffer,
        };
        Self {
            dispatcher: Dispatcher::start(connection, options),
            server: addr.to_string(),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_alive(&self) -> bool {
        self.dispatcher.is_alive()
    }

    /// Issue an arbitrary method; for methods without a typed wrapper.
    pub async fn call(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, CoreError> {
        Ok(self.dispatcher.call(ctx, method, params).await?)
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, CoreError> {
        Ok(self.dispatcher.call_typed(ctx, method, params).await?)
    }

    pub fn close(&self) {
        debug!(server = %self.server, "closing electrum client");
        self.dispatcher.close();
    }

    // ==========================================================================
    // Server
    // ==========================================================================

    /// Negotiate the protocol version. Must be the first call on a
    /// connection for servers that enforce it.
    pub async fn server_version(
        &self,
        ctx: &CallContext,
        client_name: &str,
        protocol_version: &str,
    ) -> Result<ServerVersion, CoreError> {
        self.call_typed(
            ctx,
            "server.version",
            vec![json!(client_name), json!(protocol_version)],
        )
        .await
    }

    pub async fn ping(&self, ctx: &CallContext) -> Result<(), CoreError> {
        self.call(ctx, "server.ping", vec![]).await.map(|_| ())
    }

    pub async fn banner(&self, ctx: &CallContext) -> Result<String, CoreError> {
        self.call_typed(ctx, "server.banner", vec![]).await
    }

    // ==========================================================================
    // Transactions
    // ==========================================================================

    /// Serialized transaction, hex encoded.
    pub async fn get_raw_transaction(
        &self,
        ctx: &CallContext,
        txid: &Txid,
    ) -> Result<String, CoreError> {
        self.call_typed(
            ctx,
            "blockchain.transaction.get",
            vec![json!(txid.to_string()), json!(false)],
        )
        .await
    }

    /// Submit a serialized transaction; returns its txid.
    pub async fn broadcast(&self, ctx: &CallContext, raw_tx_hex: &str) -> Result<Txid, CoreError> {
        self.call_typed(ctx, "blockchain.transaction.broadcast", vec![json!(raw_tx_hex)])
            .await
    }

    pub async fn get_merkle(
        &self,
        ctx: &CallContext,
        txid: &Txid,
        height: u32,
    ) -> Result<MerkleProof, CoreError> {
        self.call_typed(
            ctx,
            "blockchain.transaction.get_merkle",
            vec![json!(txid.to_string()), json!(height)],
        )
        .await
    }

    /// Txid of the transaction at `pos` in the block at `height`.
    pub async fn id_from_pos(
        &self,
        ctx: &CallContext,
        height: u32,
        pos: u32,
    ) -> Result<Txid, CoreError> {
        self.call_typed(
            ctx,
            "blockchain.transaction.id_from_pos",
            vec![json!(height), json!(pos), json!(false)],
        )
        .await
    }

    /// Like [`ElectrumClient::id_from_pos`], with the merkle branch.
    pub async fn merkle_from_pos(
        &self,
        ctx: &CallContext,
        height: u32,
        pos: u32,
    ) -> Result<MerkleFromPos, CoreError> {
        self.call_typed(
            ctx,
            "blockchain.transaction.id_from_pos",
            vec![json!(height), json!(pos), json!(true)],
        )
        .await
    }

    // ==========================================================================
    // Scripthashes
    // ==========================================================================

    pub async fn get_balance(&self, ctx: &CallContext, scripthash: &str) -> Result<Balance, CoreError> {
        self.call_typed(ctx, "blockchain.scripthash.get_balance", vec![json!(scripthash)])
            .await
    }

    pub async fn get_mempool(
        &self,
        ctx: &CallContext,
        scripthash: &str,
    ) -> Result<Vec<HistoryEntry>, CoreError> {
        self.call_typed(ctx, "blockchain.scripthash.get_mempool", vec![json!(scripthash)])
            .await
    }

    pub async fn list_unspent(
        &self,
        ctx: &CallContext,
        scripthash: &str,
    ) -> Result<Vec<Utxo>, CoreError> {
        self.call_typed(ctx, "blockchain.scripthash.listunspent", vec![json!(scripthash)])
            .await
    }

    // ==========================================================================
    // Fees
    // ==========================================================================

    /// Fee rate per kvB for confirmation within `blocks`; `None` when the
    /// server cannot estimate.
    pub async fn estimate_fee(
        &self,
        ctx: &CallContext,
        blocks: u32,
    ) -> Result<Option<Amount>, CoreError> {
        let btc_per_kvb: f64 = self
            .call_typed(ctx, "blockchain.estimatefee", vec![json!(blocks)])
            .await?;
        if btc_per_kvb < 0.0 {
            return Ok(None);
        }
        btc_amount("blockchain.estimatefee", btc_per_kvb).map(Some)
    }

    /// Minimum fee rate per kvB the server relays.
    pub async fn relay_fee(&self, ctx: &CallContext) -> Result<Amount, CoreError> {
        let btc_per_kvb: f64 = self.call_typed(ctx, "blockchain.relayfee", vec![]).await?;
        btc_amount("blockchain.relayfee", btc_per_kvb)
    }

    // ==========================================================================
    // Subscriptions
    // ==========================================================================

    /// Current chain tip plus a stream of every new tip.
    pub async fn subscribe_headers(
        &self,
        ctx: &CallContext,
    ) -> Result<(HeaderNotification, Subscription<HeaderNotification>), CoreError> {
        // Register before subscribing so no notification slips in between.
        let subscription = Subscription::new(self.dispatcher.notifications(HEADERS_SUBSCRIBE));
        let tip = self.call_typed(ctx, HEADERS_SUBSCRIBE, vec![]).await?;
        Ok((tip, subscription))
    }

    /// Subscribe to status changes of every scripthash in `scripthashes`.
    ///
    /// Returns the current status of each (in order) and one stream carrying
    /// the changes for all of them.
    pub async fn subscribe_scripthashes(
        &self,
        ctx: &CallContext,
        scripthashes: &[String],
    ) -> Result<(Vec<Option<String>>, Subscription<ScripthashStatus>), CoreError> {
        let subscription = Subscription::new(self.dispatcher.notifications(SCRIPTHASH_SUBSCRIBE));
        let statuses = try_join_all(scripthashes.iter().map(|scripthash| {
            self.call_typed::<Option<String>>(ctx, SCRIPTHASH_SUBSCRIBE, vec![json!(scripthash)])
        }))
        .await?;
        Ok((statuses, subscription))
    }
}

fn btc_amount(method: &str, btc: f64) -> Result<Amount, CoreError> {
    Amount::from_btc(btc).map_err(|e| {
        RpcError::InvalidResponse(format!("`{method}` returned invalid amount {btc}: {e}")).into()
    })
}

#[async_trait]
impl ElectrumRpc for ElectrumClient {
    async fn get_transaction(
        &self,
        ctx: &CallContext,
        txid: &Txid,
    ) -> Result<Transaction, CoreError> {
        self.call_typed(
            ctx,
            "blockchain.transaction.get",
            vec![json!(txid.to_string()), json!(true)],
        )
        .await
    }

    async fn get_history(
        &self,
        ctx: &CallContext,
        scripthash: &str,
    ) -> Result<Vec<HistoryEntry>, CoreError> {
        self.call_typed(ctx, "blockchain.scripthash.get_history", vec![json!(scripthash)])
            .await
    }
}

// ==============================================================================
// Subscription
// ==============================================================================

/// Notifications for one subscribed method, decoded into `T`.
///
/// Ends when the connection is lost. Notifications are dropped while the
/// queue is full, so slow consumers see gaps rather than stalling calls.
pub struct Subscription<T> {
    rx: mpsc::Receiver<Value>,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Subscription<T> {
    fn new(rx: mpsc::Receiver<Value>) -> Self {
        Self {
            rx,
            _item: PhantomData,
        }
    }

    pub async fn next(&mut self) -> Option<Result<T, CoreError>> {
        let params = self.rx.recv().await?;
        Some(decode_notification(params))
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<T, CoreError>> {
        futures::stream::unfold(self, |mut subscription| async move {
            let item = subscription.next().await?;
            Some((item, subscription))
        })
    }
}

/// Header notifications carry the payload as the single element of
/// `params`; scripthash notifications carry it as the whole array.
fn decode_notification<T: DeserializeOwned>(params: Value) -> Result<T, CoreError> {
    let single = match &params {
        Value::Array(items) if items.len() == 1 => Some(items[0].clone()),
        _ => None,
    };
    if let Some(item) = single {
        if let Ok(decoded) = serde_json::from_value(item) {
            return Ok(decoded);
        }
    }
    serde_json::from_value(params)
        .map_err(|e| RpcError::InvalidResponse(format!("undecodable notification: {e}")).into())
}
