//! Client and resolver configuration.

use std::path::PathBuf;
use std::time::Duration;

use bitcoin::Network;

use crate::error::CoreError;
use crate::transport::{CertificatePolicy, DialOptions, DEFAULT_MAX_FRAME_LEN};

/// Confirmation depth a transaction must strictly exceed before it is cached.
pub const DEFAULT_CONFIRMATION_THRESHOLD: u32 = 6;
/// Concurrent ancestor fetches per resolved transaction.
pub const DEFAULT_INPUT_CONCURRENCY: usize = 20;
/// Concurrent entry resolutions per history.
pub const DEFAULT_HISTORY_CONCURRENCY: usize = 10;

// ==============================================================================
// Client
// ==============================================================================

/// Connection and call settings for [`crate::rpc::ElectrumClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `tcp://host:port`, `ssl://host:port`, or bare `host:port` (plaintext).
    pub server: String,
    pub certificate_policy: CertificatePolicy,
    pub connect_timeout: Option<Duration>,
    /// Applied to every call on top of the caller's own context.
    pub request_timeout: Option<Duration>,
    /// Outbound request rate limit; `None` disables limiting.
    pub requests_per_second: Option<u32>,
    /// Capacity of the transport's frame channel.
    pub frame_buffer: usize,
    /// Longest frame accepted from the server before the connection is
    /// dropped.
    pub max_frame_len: usize,
    /// Capacity of each notification subscriber's queue.
    pub notification_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "ssl://electrum.blockstream.info:50002".into(),
            certificate_policy: CertificatePolicy::WebPki,
            connect_timeout: Some(Duration::from_secs(10)),
            request_timeout: Some(Duration::from_secs(30)),
            requests_per_second: None,
            frame_buffer: 64,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            notification_buffer: 32,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.frame_buffer == 0 {
            return Err(CoreError::Config("frame buffer must be at least 1".into()));
        }
        if self.max_frame_len == 0 {
            return Err(CoreError::Config("max frame length must be at least 1".into()));
        }
        if self.notification_buffer == 0 {
            return Err(CoreError::Config(
                "notification buffer must be at least 1".into(),
            ));
        }
        if self.requests_per_second == Some(0) {
            return Err(CoreError::Config(
                "requests_per_second must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn dial_options(&self) -> DialOptions {
        DialOptions {
            connect_timeout: self.connect_timeout,
            frame_buffer: self.frame_buffer,
            max_frame_len: self.max_frame_len,
            ..DialOptions::default()
        }
    }
}

// ==============================================================================
// Resolver
// ==============================================================================

/// Settings for [`crate::resolve::Resolver`].
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// SQLite file backing the transaction cache; `None` keeps it in memory.
    pub cache_path: Option<PathBuf>,
    pub confirmation_threshold: u32,
    pub input_concurrency: usize,
    pub history_concurrency: usize,
    /// Network that history addresses are checked against.
    pub network: Network,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            confirmation_threshold: DEFAULT_CONFIRMATION_THRESHOLD,
            input_concurrency: DEFAULT_INPUT_CONCURRENCY,
            history_concurrency: DEFAULT_HISTORY_CONCURRENCY,
            network: Network::Bitcoin,
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.input_concurrency == 0 {
            return Err(CoreError::Config(
                "input concurrency must be at least 1".into(),
            ));
        }
        if self.history_concurrency == 0 {
            return Err(CoreError::Config(
                "history concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Whether a transaction seen at `confirmations` deep may be cached.
    pub fn is_cacheable(&self, confirmations: u32) -> bool {
        confirmations > self.confirmation_threshold
    }
}
