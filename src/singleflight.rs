//! Collapses concurrent calls for the same key into one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::error::Result;

type Call<T> = Shared<BoxFuture<'static, Result<T>>>;

/// At most one in-flight call per key; later callers await the first one's result.
pub(crate) struct SingleFlight<T: Clone> {
    calls: Mutex<HashMap<String, Call<T>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `work` unless a call for `key` is already in flight, in which case `work` is
    /// dropped unpolled and the caller shares the running call's result.
    pub(crate) async fn run<F>(&self, key: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let call = {
            let mut calls = self.lock();

            match calls.get(key) {
                // A finished call left behind by a cancelled caller is stale.
                Some(call) if call.peek().is_none() => call.clone(),
                _ => {
                    let call = work.boxed().shared();
                    calls.insert(key.to_string(), call.clone());
                    call
                }
            }
        };

        let result = call.clone().await;

        let mut calls = self.lock();
        if calls.get(key).is_some_and(|current| current.ptr_eq(&call)) {
            calls.remove(key);
        }

        result
    }

    /// Returns `true` while a call for `key` has not produced its result.
    pub(crate) fn is_pending(&self, key: &str) -> bool {
        self.lock().get(key).is_some_and(|call| call.peek().is_none())
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Call<T>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
