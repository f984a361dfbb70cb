//! Center configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Default number of concurrent refresh tasks.
pub const DEFAULT_REFRESH: usize = 8;

/// Default refresh period in seconds.
pub const DEFAULT_TTL: u64 = 60;

/// Default deadline for non-blocking registry requests, in seconds.
pub const DEFAULT_TIMEOUT: u64 = 5;

/// Default long-poll wait sent to the registry, in seconds.
pub const DEFAULT_WAIT: u64 = 60;

/// Address of the local registry agent.
pub const LOCAL_AGENT: &str = "http://127.0.0.1:8500";

const LOCAL: &str = "local";
const DISABLED: [&str; 3] = ["none", "off", "disable"];

/// Configuration for a [`Center`](crate::Center).
///
/// Durations are whole seconds, matching the configuration file format.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CenterConfig {
    /// Registry location. Empty or `local` means the local agent; `none`, `off` and
    /// `disable` leave the backend unconfigured.
    pub address: String,

    /// Refresh period for cached entries. `0` disables background refresh.
    #[serde(alias = "expired")]
    pub ttl: u64,

    /// Maximum number of concurrent refresh tasks. `0` means [`DEFAULT_REFRESH`].
    pub refresh: usize,

    /// Static `name -> [host:port]` table. When non-empty it replaces the registry.
    pub service: HashMap<String, Vec<String>>,

    /// Deadline for registry calls that are not long-polls.
    pub timeout: u64,

    /// Long-poll wait requested from the registry.
    pub wait: u64,

    /// Evict entries that have not been read for this long. Unset keeps entries forever.
    pub idle: Option<u64>,
}

impl Default for CenterConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            ttl: DEFAULT_TTL,
            refresh: DEFAULT_REFRESH,
            service: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            wait: DEFAULT_WAIT,
            idle: None,
        }
    }
}

impl CenterConfig {
    /// Creates a configuration pointing at the given registry address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Creates a configuration answering from a static table only.
    #[must_use]
    pub fn with_static<I, N, A>(table: I) -> Self
    where
        I: IntoIterator<Item = (N, Vec<A>)>,
        N: Into<String>,
        A: Into<String>,
    {
        let service = table
            .into_iter()
            .map(|(name, addrs)| (name.into(), addrs.into_iter().map(Into::into).collect()))
            .collect();

        Self {
            service,
            ..Default::default()
        }
    }

    /// Sets the refresh period in seconds.
    #[must_use]
    pub fn ttl(mut self, secs: u64) -> Self {
        self.ttl = secs;
        self
    }

    /// Sets the maximum number of concurrent refresh tasks.
    #[must_use]
    pub fn refresh(mut self, tasks: usize) -> Self {
        self.refresh = tasks;
        self
    }

    /// Adds a static entry.
    #[must_use]
    pub fn service<A: Into<String>>(mut self, name: impl Into<String>, addrs: Vec<A>) -> Self {
        self.service
            .insert(name.into(), addrs.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the deadline for non-blocking registry requests in seconds.
    #[must_use]
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    /// Sets the long-poll wait in seconds.
    #[must_use]
    pub fn wait(mut self, secs: u64) -> Self {
        self.wait = secs;
        self
    }

    /// Enables idle eviction after `secs` seconds without reads.
    #[must_use]
    pub fn idle(mut self, secs: u64) -> Self {
        self.idle = Some(secs);
        self
    }

    /// Parses the `center` section of a TOML document.
    ///
    /// The section is either an address string (`center = "10.0.0.5:8500"`) or a
    /// `[center]` table. The legacy `service.center` location is also accepted.
    /// Returns `None` when neither is present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) when the document is not valid TOML
    /// or the section has the wrong shape.
    pub fn from_toml(document: &str) -> Result<Option<Self>> {
        let doc: Document = toml::from_str(document)?;

        let section = doc
            .center
            .or_else(|| doc.service.and_then(|legacy| legacy.center));

        Ok(section.map(|section| match section {
            Section::Address(address) => Self::new(address),
            Section::Table(config) => config,
        }))
    }

    /// Returns `true` when the configuration routes every call to the static table.
    #[must_use]
    pub fn is_static(&self) -> bool {
        !self.service.is_empty()
    }

    /// Returns `true` when the address explicitly disables the registry.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        let address = self.address.trim();
        DISABLED.iter().any(|v| address.eq_ignore_ascii_case(v))
    }

    /// Base URL of the registry HTTP API.
    #[must_use]
    pub fn registry_url(&self) -> String {
        let address = self.address.trim().trim_end_matches('/');

        if address.is_empty() || address.eq_ignore_ascii_case(LOCAL) {
            LOCAL_AGENT.to_string()
        } else if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        }
    }

    /// Effective number of concurrent refresh tasks.
    #[must_use]
    pub fn refresh_tasks(&self) -> usize {
        if self.refresh == 0 {
            DEFAULT_REFRESH
        } else {
            self.refresh
        }
    }

    pub(crate) fn ttl_period(&self) -> Option<Duration> {
        (self.ttl > 0).then(|| Duration::from_secs(self.ttl))
    }

    /// Deadline for non-blocking registry calls. Zero means unbounded.
    pub(crate) fn call_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    pub(crate) fn wait_period(&self) -> Duration {
        Duration::from_secs(self.wait)
    }

    pub(crate) fn idle_period(&self) -> Option<Duration> {
        self.idle.map(Duration::from_secs)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Section {
    Address(String),
    Table(CenterConfig),
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct Document {
    center: Option<Section>,
    service: Option<LegacySection>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct LegacySection {
    center: Option<Section>,
}
