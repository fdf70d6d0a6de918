//! Host and port of a listen or connect target.

use crate::error::ClientError;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// A host name or IP literal plus a port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the host
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host with any IPv6 brackets removed
    fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// The socket address, if the host is an IP literal
    #[must_use]
    pub fn ip_literal(&self) -> Option<SocketAddr> {
        self.bare_host()
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Resolve to the first socket address the host maps to.
    ///
    /// IP literals never touch the resolver. Host names go through the
    /// system resolver and block the calling thread, so async callers
    /// should resolve first and pass an IP literal.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Setup` if the host is empty or does not resolve.
    pub fn resolve(&self) -> Result<SocketAddr, ClientError> {
        if self.host.is_empty() {
            return Err(ClientError::Setup("empty host".to_string()));
        }
        if let Some(addr) = self.ip_literal() {
            return Ok(addr);
        }

        (self.bare_host(), self.port)
            .to_socket_addrs()
            .map_err(|e| ClientError::Setup(format!("cannot resolve {self}: {e}")))?
            .next()
            .ok_or_else(|| ClientError::Setup(format!("{self} resolved to no addresses")))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ClientError::Setup(format!("missing port in {s:?}")))?;
        let port = port
            .parse()
            .map_err(|_| ClientError::Setup(format!("invalid port in {s:?}")))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
