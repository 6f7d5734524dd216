//! Detail resolution: turning raw transactions into fully resolved ones.
//!
//! Every non-coinbase input is resolved by fetching the ancestor it spends
//! (through the cache) and copying the referenced output. Fan-out is
//! bounded by a `tokio::sync::Semaphore` and fails fast: the first error
//! cancels the shared child context, aborts the siblings and is returned
//! with the txid and step it happened in. Nothing partial is ever cached.
//!
//! Cache failures never surface from here; they are logged and treated as
//! a miss (reads) or a no-op (writes).

use std::sync::Arc;

use bitcoin::{Amount, OutPoint, Txid};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::{CachedTx, TxCache};
use crate::classify;
use crate::config::ResolverConfig;
use crate::error::{CoreError, ResolveStep};
use crate::rpc::{CallContext, ElectrumRpc};
use crate::scripthash::address_scripthash;
use crate::types::{
    DetailedHistoryEntry, DetailedTransaction, HistoryEntry, ResolvedInput, Transaction, TxOut,
};

/// Resolution engine over an [`ElectrumRpc`] backend and a [`TxCache`].
///
/// Cheap to clone; clones share the backend, cache and configuration.
#[derive(Clone)]
pub struct Resolver {
    rpc: Arc<dyn ElectrumRpc>,
    cache: Arc<TxCache>,
    config: Arc<ResolverConfig>,
}

impl Resolver {
    /// Open the cache described by `config` and build a resolver over it.
    pub fn open(rpc: Arc<dyn ElectrumRpc>, config: ResolverConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let cache = match &config.cache_path {
            Some(path) => TxCache::open(path)?,
            None => TxCache::open_in_memory()?,
        };
        Self::new(rpc, Arc::new(cache), config)
    }

    /// Build a resolver over an already opened cache.
    pub fn new(
        rpc: Arc<dyn ElectrumRpc>,
        cache: Arc<TxCache>,
        config: ResolverConfig,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self {
            rpc,
            cache,
            config: Arc::new(config),
        })
    }

    pub fn cache(&self) -> &Arc<TxCache> {
        &self.cache
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Close the cache. Later resolutions still work, uncached.
    pub fn close(&self) -> Result<(), CoreError> {
        Ok(self.cache.close()?)
    }

    // ==========================================================================
    // Transactions
    // ==========================================================================

    /// A transaction from the cache (any detail level) or the server.
    /// Server results deep enough to be final are cached at raw level.
    pub async fn fetch_transaction(
        &self,
        ctx: &CallContext,
        txid: &Txid,
    ) -> Result<Transaction, CoreError> {
        if let Some(record) = self.cached(*txid).await {
            debug!(%txid, level = ?record.level(), "transaction cache hit");
            return Ok(record.into_transaction());
        }

        let tx = self.rpc.get_transaction(ctx, txid).await?;
        if tx.txid() != *txid {
            return Err(CoreError::InvalidTxData(format!(
                "requested {txid}, server returned {}",
                tx.txid()
            )));
        }
        if self.config.is_cacheable(tx.confirmations()) {
            self.store(CachedTx::Raw(tx.clone())).await;
        }
        Ok(tx)
    }

    /// Resolve every input of `tx` to the output it spends and compute the
    /// totals.
    pub async fn resolve_transaction(
        &self,
        ctx: &CallContext,
        tx: &Transaction,
    ) -> Result<DetailedTransaction, CoreError> {
        let txid = tx.txid();
        if let Some(CachedTx::Detailed(detailed)) = self.cached(txid).await {
            debug!(%txid, "detailed cache hit");
            return Ok(detailed);
        }

        let ctx = ctx.child();
        let semaphore = Arc::new(Semaphore::new(self.config.input_concurrency));
        let resolved = Arc::new(Mutex::new(Vec::with_capacity(tx.vin.len())));
        let mut tasks: JoinSet<Result<(), CoreError>> = JoinSet::new();

        for (index, input) in tx.vin.iter().enumerate() {
            let outpoint = input
                .previous_output()
                .map_err(|e| e.during(txid, ResolveStep::Inputs))?;
            let Some(outpoint) = outpoint else {
                resolved.lock().await.push((
                    index,
                    ResolvedInput {
                        input: input.clone(),
                        prevout: None,
                    },
                ));
                continue;
            };

            let this = self.clone();
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let resolved = resolved.clone();
            let input = input.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                let prevout = this.fetch_prevout(&ctx, outpoint).await.map_err(|e| {
                    e.during(
                        txid,
                        ResolveStep::Ancestor {
                            input: index,
                            txid: outpoint.txid,
                            vout: outpoint.vout,
                        },
                    )
                })?;
                resolved.lock().await.push((
                    index,
                    ResolvedInput {
                        input,
                        prevout: Some(prevout),
                    },
                ));
                Ok(())
            });
        }

        debug!(%txid, inputs = tx.vin.len(), fetches = tasks.len(), "resolving inputs");
        join_fail_fast(&ctx, tasks).await.inspect_err(|err| {
            warn!(%txid, error = %err, "transaction resolution failed");
        })?;

        let mut vin = std::mem::take(&mut *resolved.lock().await);
        vin.sort_unstable_by_key(|(index, _)| *index);
        let vin = vin.into_iter().map(|(_, input)| input).collect();

        let detailed = summarize(tx, vin)?;
        if self.config.is_cacheable(detailed.meta.confirmations) {
            self.store(CachedTx::Detailed(detailed.clone())).await;
        }
        Ok(detailed)
    }

    /// [`Resolver::fetch_transaction`] followed by
    /// [`Resolver::resolve_transaction`].
    pub async fn resolve_txid(
        &self,
        ctx: &CallContext,
        txid: &Txid,
    ) -> Result<DetailedTransaction, CoreError> {
        let tx = self.fetch_transaction(ctx, txid).await?;
        self.resolve_transaction(ctx, &tx).await
    }

    async fn fetch_prevout(&self, ctx: &CallContext, outpoint: OutPoint) -> Result<TxOut, CoreError> {
        let ancestor = self.fetch_transaction(ctx, &outpoint.txid).await?;
        ancestor
            .output(outpoint.vout)
            .cloned()
            .ok_or(CoreError::PrevoutMissing {
                txid: outpoint.txid,
                vout: outpoint.vout,
            })
    }

    // ==========================================================================
    // Histories
    // ==========================================================================

    /// Resolve every entry of a scripthash history and classify it relative
    /// to `address`. The result keeps the order of `entries`.
    pub async fn resolve_history(
        &self,
        ctx: &CallContext,
        address: &str,
        entries: &[HistoryEntry],
    ) -> Result<Vec<DetailedHistoryEntry>, CoreError> {
        let ctx = ctx.child();
        let semaphore = Arc::new(Semaphore::new(self.config.history_concurrency));
        let results = Arc::new(Mutex::new(Vec::with_capacity(entries.len())));
        let address: Arc<str> = Arc::from(address);
        let mut tasks: JoinSet<Result<(), CoreError>> = JoinSet::new();

        for (position, entry) in entries.iter().cloned().enumerate() {
            let this = self.clone();
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let results = results.clone();
            let address = address.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                let step = ResolveStep::HistoryEntry {
                    position,
                    height: entry.height,
                };
                let tx = this
                    .resolve_txid(&ctx, &entry.tx_hash)
                    .await
                    .map_err(|e| e.during(entry.tx_hash, step))?;
                let incoming = classify::is_incoming(&address, &tx);
                results.lock().await.push((
                    position,
                    DetailedHistoryEntry {
                        tx,
                        height: entry.height,
                        mempool_fee: entry.fee,
                        incoming,
                    },
                ));
                Ok(())
            });
        }

        debug!(%address, entries = entries.len(), "resolving history");
        join_fail_fast(&ctx, tasks).await.inspect_err(|err| {
            warn!(%address, error = %err, "history resolution failed");
        })?;

        let mut history = std::mem::take(&mut *results.lock().await);
        history.sort_unstable_by_key(|(position, _)| *position);
        Ok(history.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Look up the history of `address` on the configured network and
    /// resolve it.
    pub async fn address_history(
        &self,
        ctx: &CallContext,
        address: &str,
    ) -> Result<Vec<DetailedHistoryEntry>, CoreError> {
        let scripthash = address_scripthash(address, self.config.network)?;
        let entries = self.rpc.get_history(ctx, &scripthash).await?;
        self.resolve_history(ctx, address, &entries).await
    }

    // ==========================================================================
    // Cache Access
    // ==========================================================================

    async fn cached(&self, txid: Txid) -> Option<CachedTx> {
        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || cache.get(&txid)).await {
            Ok(Ok(record)) => record,
            Ok(Err(err)) => {
                warn!(%txid, error = %err, "cache read failed; treating as miss");
                None
            }
            Err(err) => {
                warn!(%txid, error = %err, "cache read task failed; treating as miss");
                None
            }
        }
    }

    async fn store(&self, record: CachedTx) {
        let txid = record.txid();
        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || cache.put(&record)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(%txid, error = %err, "cache write failed"),
            Err(err) => warn!(%txid, error = %err, "cache write task failed"),
        }
    }
}

/// Wait for every task; on the first failure cancel `ctx`, abort the rest
/// and return that error.
async fn join_fail_fast(
    ctx: &CallContext,
    mut tasks: JoinSet<Result<(), CoreError>>,
) -> Result<(), CoreError> {
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined.map_err(CoreError::from).and_then(|outcome| outcome) {
            ctx.cancel();
            tasks.abort_all();
            return Err(err);
        }
    }
    Ok(())
}

/// Assemble the detailed transaction and its totals with checked
/// arithmetic. Outputs exceeding inputs is an error, never clamped.
fn summarize(tx: &Transaction, vin: Vec<ResolvedInput>) -> Result<DetailedTransaction, CoreError> {
    let txid = tx.txid();
    let overflow = || CoreError::InvalidTxData(format!("value overflow in transaction {txid}"));

    let inputs_total = vin
        .iter()
        .filter_map(|input| input.prevout.as_ref())
        .try_fold(Amount::ZERO, |sum, prevout| sum.checked_add(prevout.value))
        .ok_or_else(overflow)?;
    let outputs_total = tx
        .vout
        .iter()
        .try_fold(Amount::ZERO, |sum, output| sum.checked_add(output.value))
        .ok_or_else(overflow)?;

    let fee = if tx.is_coinbase() {
        None
    } else {
        Some(
            inputs_total
                .checked_sub(outputs_total)
                .ok_or(CoreError::NegativeFee {
                    txid,
                    inputs_total,
                    outputs_total,
                })?,
        )
    };

    Ok(DetailedTransaction {
        meta: tx.meta.clone(),
        vin,
        vout: tx.vout.clone(),
        inputs_total,
        outputs_total,
        fee,
    })
}
