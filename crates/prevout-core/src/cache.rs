//! Durable transaction cache backed by SQLite.
//!
//! One row per txid holding the transaction as JSON plus its detail level.
//! A row only ever moves from raw to detailed: raw rows may be refreshed or
//! upgraded, detailed rows are final. Eligibility (confirmation depth) is
//! the caller's concern; the cache stores whatever it is given.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bitcoin::Txid;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::CacheError;
use crate::types::{DetailedTransaction, Transaction};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS tx_cache (
        txid TEXT PRIMARY KEY,
        payload TEXT NOT NULL,
        detail_level INTEGER NOT NULL DEFAULT 0
    );
"#;

/// Insert, or replace a row that is still raw. Detailed rows are left
/// untouched, which makes the upgrade monotonic without a read-modify-write.
const UPSERT: &str = "INSERT INTO tx_cache (txid, payload, detail_level) VALUES (?1, ?2, ?3) \
     ON CONFLICT(txid) DO UPDATE SET payload = excluded.payload, detail_level = excluded.detail_level \
     WHERE tx_cache.detail_level = 0";

const SELECT: &str = "SELECT payload, detail_level FROM tx_cache WHERE txid = ?1";

// ==============================================================================
// Records
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DetailLevel {
    Raw = 0,
    Detailed = 1,
}

impl DetailLevel {
    fn from_column(value: i64) -> Result<Self, CacheError> {
        match value {
            0 => Ok(Self::Raw),
            1 => Ok(Self::Detailed),
            other => Err(CacheError::UnknownDetailLevel(other)),
        }
    }
}

/// A cached transaction at the detail level it was stored with.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedTx {
    Raw(Transaction),
    Detailed(DetailedTransaction),
}

impl CachedTx {
    pub fn txid(&self) -> Txid {
        match self {
            Self::Raw(tx) => tx.txid(),
            Self::Detailed(tx) => tx.txid(),
        }
    }

    pub fn level(&self) -> DetailLevel {
        match self {
            Self::Raw(_) => DetailLevel::Raw,
            Self::Detailed(_) => DetailLevel::Detailed,
        }
    }

    /// The raw view, stripping resolved prevouts from a detailed record.
    pub fn into_transaction(self) -> Transaction {
        match self {
            Self::Raw(tx) => tx,
            Self::Detailed(tx) => tx.to_transaction(),
        }
    }

    fn payload(&self) -> Result<String, CacheError> {
        Ok(match self {
            Self::Raw(tx) => serde_json::to_string(tx)?,
            Self::Detailed(tx) => serde_json::to_string(tx)?,
        })
    }
}

// ==============================================================================
// Cache
// ==============================================================================

/// Transaction cache shared via `Arc<TxCache>`.
///
/// The connection sits behind a `std::sync::Mutex` held for exactly one
/// statement at a time. After [`TxCache::close`] every operation fails with
/// [`CacheError::Closed`].
pub struct TxCache {
    conn: Mutex<Option<Connection>>,
}

impl TxCache {
    /// Open (creating if needed) the cache file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        debug!(path = %path.display(), "opened transaction cache");
        Self::with_connection(conn)
    }

    /// A cache that lives only as long as this handle.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CacheError> {
        // In-memory databases answer "memory" here, which is fine.
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The record for `txid` at whatever level it was stored.
    pub fn get(&self, txid: &Txid) -> Result<Option<CachedTx>, CacheError> {
        let row: Option<(String, i64)> = {
            let guard = self.lock();
            let conn = guard.as_ref().ok_or(CacheError::Closed)?;
            conn.query_row(SELECT, params![txid.to_string()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?
        };

        let Some((payload, level)) = row else {
            return Ok(None);
        };
        let record = match DetailLevel::from_column(level)? {
            DetailLevel::Raw => CachedTx::Raw(serde_json::from_str(&payload)?),
            DetailLevel::Detailed => CachedTx::Detailed(serde_json::from_str(&payload)?),
        };
        Ok(Some(record))
    }

    /// Only a detailed record; raw records count as a miss.
    pub fn get_detailed(&self, txid: &Txid) -> Result<Option<DetailedTransaction>, CacheError> {
        Ok(match self.get(txid)? {
            Some(CachedTx::Detailed(tx)) => Some(tx),
            _ => None,
        })
    }

    /// Store `record` under its txid. Returns whether a row was written;
    /// writes over a detailed row are ignored.
    pub fn put(&self, record: &CachedTx) -> Result<bool, CacheError> {
        let payload = record.payload()?;
        let txid = record.txid().to_string();
        let level = record.level() as i64;

        let changed = {
            let guard = self.lock();
            let conn = guard.as_ref().ok_or(CacheError::Closed)?;
            conn.execute(UPSERT, params![txid, payload, level])?
        };
        debug!(%txid, level, written = changed > 0, "cache put");
        Ok(changed > 0)
    }

    pub fn put_raw(&self, tx: &Transaction) -> Result<bool, CacheError> {
        self.put(&CachedTx::Raw(tx.clone()))
    }

    pub fn put_detailed(&self, tx: &DetailedTransaction) -> Result<bool, CacheError> {
        self.put(&CachedTx::Detailed(tx.clone()))
    }

    /// Close the underlying database. Idempotent.
    pub fn close(&self) -> Result<(), CacheError> {
        let conn = self.lock().take();
        match conn {
            Some(conn) => conn.close().map_err(|(_, err)| CacheError::Sqlite(err)),
            None => Ok(()),
        }
    }
}
