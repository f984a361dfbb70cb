//! Cancellation and deadlines for blocking registry calls.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Races registry calls against a cancellation token and an optional deadline.
///
/// Losing the race drops the registry future, which cancels the request.
#[derive(Clone, Debug)]
pub(crate) struct CallGuard {
    cancel: CancellationToken,
    deadline: Option<Duration>,
}

impl CallGuard {
    pub(crate) fn new(cancel: CancellationToken, deadline: Option<Duration>) -> Self {
        Self { cancel, deadline }
    }

    /// The same token with a different deadline.
    pub(crate) fn with_deadline(&self, deadline: Option<Duration>) -> Self {
        Self {
            cancel: self.cancel.clone(),
            deadline,
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) async fn run<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let bounded = async {
            match self.deadline {
                Some(deadline) => match tokio::time::timeout(deadline, call).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(deadline)),
                },
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test]
    async fn passes_results_through() {
        let guard = CallGuard::new(CancellationToken::new(), None);
        assert_eq!(guard.run(async { Ok(3) }).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn deadline_expires() {
        let guard = CallGuard::new(
            CancellationToken::new(),
            Some(Duration::from_millis(20)),
        );

        let result: Result<()> = guard.run(std::future::pending()).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_call() {
        let token = CancellationToken::new();
        let guard = CallGuard::new(token.clone(), None);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let result: Result<()> = guard.run(std::future::pending()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_guard_does_not_poll() {
        let token = CancellationToken::new();
        token.cancel();
        let guard = CallGuard::new(token, None).with_deadline(Some(Duration::from_secs(1)));
        let polled = AtomicBool::new(false);

        let result = guard
            .run(async {
                polled.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!polled.load(Ordering::SeqCst));
    }
}
