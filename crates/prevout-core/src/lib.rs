pub mod cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod resolve;
pub mod rpc;
pub mod scripthash;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_util;

pub use cache::TxCache;
pub use config::{ClientConfig, ResolverConfig};
pub use error::CoreError;
pub use resolve::Resolver;
pub use rpc::{CallContext, ElectrumClient, ElectrumRpc};
