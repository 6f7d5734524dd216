use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Txid;

use crate::error::{CoreError, RpcError};
use crate::types::{HistoryEntry, Transaction};

use super::context::CallContext;
use super::ElectrumRpc;

/// A mock Electrum backend for testing. Returns canned transactions and
/// histories populated via the builder pattern, and counts every call.
pub struct MockRpc {
    transactions: HashMap<Txid, Transaction>,
    histories: HashMap<String, Vec<HistoryEntry>>,
    failing: HashSet<Txid>,
    delay: Option<Duration>,
    calls: Mutex<HashMap<Txid, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRpc {
    pub fn builder() -> MockRpcBuilder {
        MockRpcBuilder {
            transactions: HashMap::new(),
            histories: HashMap::new(),
            failing: HashSet::new(),
            delay: None,
        }
    }

    /// Number of `get_transaction` calls made for `txid`.
    pub fn calls_for(&self, txid: &Txid) -> usize {
        self.calls.lock().unwrap().get(txid).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Highest number of `get_transaction` calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn lookup(&self, ctx: &CallContext, txid: &Txid) -> Result<Transaction, CoreError> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.done() => {
                    return Err(CoreError::from(RpcError::Cancelled {
                        method: "blockchain.transaction.get".into(),
                    }));
                }
            }
        }
        if self.failing.contains(txid) {
            return Err(CoreError::from(RpcError::Server {
                code: 2,
                message: format!("no such transaction {txid}"),
            }));
        }
        self.transactions.get(txid).cloned().ok_or_else(|| {
            CoreError::from(RpcError::Server {
                code: 2,
                message: format!("unknown transaction {txid}"),
            })
        })
    }
}

pub struct MockRpcBuilder {
    transactions: HashMap<Txid, Transaction>,
    histories: HashMap<String, Vec<HistoryEntry>>,
    failing: HashSet<Txid>,
    delay: Option<Duration>,
}

impl MockRpcBuilder {
    pub fn with_tx(mut self, tx: Transaction) -> Self {
        self.transactions.insert(tx.txid(), tx);
        self
    }

    pub fn with_history(mut self, scripthash: &str, history: Vec<HistoryEntry>) -> Self {
        self.histories.insert(scripthash.to_owned(), history);
        self
    }

    /// Make every fetch of `txid` fail with a server error.
    pub fn failing(mut self, txid: Txid) -> Self {
        self.failing.insert(txid);
        self
    }

    /// Sleep before answering each transaction fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn build(self) -> Arc<MockRpc> {
        Arc::new(MockRpc {
            transactions: self.transactions,
            histories: self.histories,
            failing: self.failing,
            delay: self.delay,
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ElectrumRpc for MockRpc {
    async fn get_transaction(
        &self,
        ctx: &CallContext,
        txid: &Txid,
    ) -> Result<Transaction, CoreError> {
        *self.calls.lock().unwrap().entry(*txid).or_default() += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.lookup(ctx, txid).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn get_history(
        &self,
        _ctx: &CallContext,
        scripthash: &str,
    ) -> Result<Vec<HistoryEntry>, CoreError> {
        Ok(self.histories.get(scripthash).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    #[tokio::test]
    async fn counts_calls_and_injects_failures() {
        let funding = make_tx(txid_from_byte(1), vec![coinbase_input()], vec![make_output(0, 5000)]);
        let rpc = MockRpc::builder()
            .with_tx(funding)
            .failing(txid_from_byte(2))
            .build();
        let ctx = CallContext::new();

        rpc.get_transaction(&ctx, &txid_from_byte(1)).await.unwrap();
        rpc.get_transaction(&ctx, &txid_from_byte(1)).await.unwrap();
        let err = rpc
            .get_transaction(&ctx, &txid_from_byte(2))
            .await
            .expect_err("failing txid must error");

        assert!(err.to_string().contains("no such transaction"));
        assert_eq!(rpc.calls_for(&txid_from_byte(1)), 2);
        assert_eq!(rpc.total_calls(), 3);
    }
}
