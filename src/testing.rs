//! Scripted registry for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::backend::{Listing, Registry};
use crate::error::{Error, Result};
use crate::service::{Check, Index, Service};

/// What the mock answers to one `watch_service` call.
#[derive(Clone, Debug)]
pub(crate) enum Reply {
    Listing(Vec<Service>, Index),
    Fail,
    Panic,
}

impl Reply {
    pub(crate) fn of(name: &str, addrs: &[&str], index: Index) -> Self {
        Self::Listing(services(name, addrs), index)
    }
}

pub(crate) fn services(name: &str, addrs: &[&str]) -> Vec<Service> {
    addrs
        .iter()
        .map(|addr| Service::from_address(name, addr).unwrap())
        .collect()
}

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Reply>>,
    steady: HashMap<String, Reply>,
    calls: Vec<(String, Index)>,
    registered: Vec<String>,
}

/// Answers queued replies first, then the steady reply, and blocks forever when
/// neither exists (a long-poll that never sees a change).
#[derive(Default)]
pub(crate) struct MockRegistry {
    script: Mutex<Script>,
    delay: Option<Duration>,
}

impl MockRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn push(&self, name: &str, reply: Reply) {
        self.lock()
            .queued
            .entry(name.to_string())
            .or_default()
            .push_back(reply);
    }

    pub(crate) fn set(&self, name: &str, reply: Reply) {
        self.lock().steady.insert(name.to_string(), reply);
    }

    pub(crate) fn calls(&self) -> Vec<(String, Index)> {
        self.lock().calls.clone()
    }

    pub(crate) fn calls_for(&self, name: &str) -> usize {
        self.lock().calls.iter().filter(|(n, _)| n == name).count()
    }

    pub(crate) fn registered(&self) -> Vec<String> {
        self.lock().registered.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_reply(&self, name: &str, index: Index) -> Option<Reply> {
        let mut script = self.lock();
        script.calls.push((name.to_string(), index));

        if let Some(reply) = script.queued.get_mut(name).and_then(VecDeque::pop_front) {
            return Some(reply);
        }

        script.steady.get(name).cloned()
    }
}

impl Registry for MockRegistry {
    async fn register(&self, service: &Service, _check: Option<&Check>) -> Result<()> {
        self.lock().registered.push(service.id().to_string());
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        self.lock().registered.retain(|id| id != service_id);
        Ok(())
    }

    async fn fetch_service(&self, name: &str) -> Result<Listing> {
        self.watch_service(name, 0).await
    }

    async fn watch_service(&self, name: &str, index: Index) -> Result<Listing> {
        let reply = self.next_reply(name, index);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match reply {
            Some(Reply::Listing(services, index)) => Ok((services, index)),
            Some(Reply::Fail) => Err(Error::Protocol(format!("scripted failure for {name}"))),
            Some(Reply::Panic) => panic!("scripted panic for {name}"),
            None => std::future::pending().await,
        }
    }
}
