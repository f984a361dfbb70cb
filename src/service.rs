//! Service endpoints and registration health checks.

use std::fmt;

use crate::error::{Error, Result};

/// Backend-issued version cursor for a service name. `0` means "never observed".
pub type Index = u64;

/// One registered instance of a named service.
///
/// Services are immutable once built; the `host:port` address is computed once at
/// construction so selectors and watchers never re-join it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Service {
    id: String,
    kind: String,
    name: String,
    host: String,
    port: u16,
    address: String,
}

impl Service {
    /// Creates a service instance. The id defaults to the address.
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let address = join_host_port(&host, port);

        Self {
            id: address.clone(),
            kind: String::new(),
            name: name.into(),
            host,
            port,
            address,
        }
    }

    /// Builds a service from a `host:port` string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] when `address` has no valid port.
    pub fn from_address(name: impl Into<String>, address: &str) -> Result<Self> {
        let (host, port) = split_host_port(address)?;
        Ok(Self::new(name, host, port))
    }

    /// Sets the instance id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the service kind (empty for plain services).
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Instance id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Service kind as reported by the registry.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Logical service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host name or IP.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, with IPv6 hosts bracketed.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// Health check attached to a registration. Never cached.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Check {
    /// Check type: `http`, `grpc` or `tcp` (case-insensitive).
    pub kind: String,
    /// URL, gRPC target or `host:port` checked by the registry.
    pub target: String,
    /// Check timeout, e.g. `"5s"`.
    pub timeout: String,
    /// Check interval, e.g. `"10s"`.
    pub interval: String,
}

impl Check {
    /// Creates a check of the given type against `target`.
    #[must_use]
    pub fn new(kind: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            target: target.into(),
            ..Default::default()
        }
    }

    /// Sets the check timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Sets the check interval.
    #[must_use]
    pub fn interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = interval.into();
        self
    }
}

/// Appends the `.http` suffix unless `name` already carries it.
#[must_use]
pub fn http_name(name: &str) -> String {
    with_suffix(name, ".http")
}

/// Appends the `.grpc` suffix unless `name` already carries it.
#[must_use]
pub fn grpc_name(name: &str) -> String {
    with_suffix(name, ".grpc")
}

fn with_suffix(name: &str, suffix: &str) -> String {
    if name.ends_with(suffix) {
        name.to_string()
    } else {
        format!("{name}{suffix}")
    }
}

pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

pub(crate) fn split_host_port(address: &str) -> Result<(String, u16)> {
    let invalid = || Error::InvalidAddress(address.to_string());

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;

    let host = match host.strip_prefix('[') {
        Some(rest) => rest.strip_suffix(']').ok_or_else(invalid)?,
        None if host.contains(':') => return Err(invalid()),
        None => host,
    };

    if host.is_empty() {
        return Err(invalid());
    }

    Ok((host.to_string(), port))
}
