#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Service directory client with cached listings and [Tonic](https://docs.rs/tonic)
//! load-balancing support.
//!
//! Services register themselves with a registry (a Consul agent, or a static table from
//! configuration) and consumers look each other up by name. Listings are cached per name
//! and kept fresh by a background refresher that long-polls the registry, so lookups on
//! the request path never block once a name is known.
//!
//! # Features
//!
//! - **Cached lookups**: the first lookup of a name populates it once, however many
//!   callers ask concurrently; later lookups are served from memory
//! - **Background refresh**: long-poll refresh bounded by a configurable task count
//! - **Endpoint selection**: round robin and consistent hashing over a listing
//! - **Change feeds**: add/delete diffs for a name, ready to drive a Tonic balance channel
//!
//! # Usage
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use std::time::Duration;
//! use tonic::transport::{Channel, Endpoint};
//! use service_center::{Center, CenterConfig, Service, discover, grpc_name};
//!
//! let config = CenterConfig::from_toml(&std::fs::read_to_string("app.toml")?)?
//!     .unwrap_or_default();
//! let center = Center::setup(&config).await?;
//!
//! // Announce ourselves
//! let me = Service::new(grpc_name("billing"), "10.0.0.7", 50051);
//! center.register(&me, None).await?;
//!
//! // Pick one instance of a dependency
//! let ledger = center.robin(&grpc_name("ledger")).await?;
//!
//! // Or keep a balance channel in sync with the registry
//! let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
//! discover(center.watch(&grpc_name("ledger")), tx, |addr| {
//!     Endpoint::from_shared(format!("http://{addr}"))
//!         .unwrap()
//!         .connect_timeout(Duration::from_secs(5))
//! });
//!
//! // let client = LedgerClient::new(channel);
//! ```

pub mod backend;
mod balance;
mod center;
mod config;
mod directory;
mod error;
mod guard;
mod refresh;
mod selector;
mod service;
mod singleflight;
#[cfg(test)]
mod testing;
mod watcher;

pub use backend::{Backend, ConsulRegistry, Listing, Registry, StaticRegistry};
pub use balance::discover;
pub use center::Center;
pub use config::{
    CenterConfig, DEFAULT_REFRESH, DEFAULT_TIMEOUT, DEFAULT_TTL, DEFAULT_WAIT, LOCAL_AGENT,
};
pub use directory::{Directory, Snapshot};
pub use error::{Error, Result};
pub use refresh::{RefreshOptions, Refresher, TickSummary, refresh_entries};
pub use selector::{HASH_SEED, RoundRobin, murmur3_32, pick_by_key, route_hash};
pub use service::{Check, Index, Service, grpc_name, http_name};
pub use watcher::{Closer, Update, Watcher};
