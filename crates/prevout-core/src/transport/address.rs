use std::fmt;

use crate::error::TransportError;

/// A parsed Electrum server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
    /// `true` for `ssl://` addresses.
    pub tls: bool,
}

impl ServerAddr {
    /// `host:port`, bracketing IPv6 literals, suitable for dialing.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        write!(f, "{scheme}://{}", self.authority())
    }
}

/// Parse `ssl://host:port`, `tcp://host:port`, or bare `host:port`.
///
/// A bare address is plaintext; TLS must be requested with `ssl://`.
pub fn parse_server(server: &str) -> Result<ServerAddr, TransportError> {
    let invalid = || TransportError::InvalidAddress(server.to_owned());
    let trimmed = server.trim();

    let (tls, rest) = match trimmed.split_once("://") {
        Some(("ssl", rest)) | Some(("tls", rest)) => (true, rest),
        Some(("tcp", rest)) => (false, rest),
        Some(_) => return Err(invalid()),
        None => (false, trimmed),
    };

    let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;

    Ok(ServerAddr {
        host: host.to_owned(),
        port,
        tls,
    })
}
