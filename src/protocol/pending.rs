//! Registry of responses we are waiting for, keyed by id
//!
//! Every wait is bounded: it resolves with the response, a timeout, or a
//! cancellation, and the registration is removed in all three cases.
//! One registry is owned per bridge/transport instance so that several
//! sessions in one process never see each other's responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// How a bounded wait ended
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOutcome<T> {
    Resolved(T),
    TimedOut,
    Cancelled,
}

impl<T> PendingOutcome<T> {
    /// Collapse into a value, substituting `fallback` for timeout/cancel
    pub fn unwrap_or_else(self, fallback: impl FnOnce() -> T) -> T {
        match self {
            PendingOutcome::Resolved(value) => value,
            PendingOutcome::TimedOut | PendingOutcome::Cancelled => fallback(),
        }
    }
}

/// Owned insert/resolve/expire registry
pub struct PendingRegistry<T> {
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<T>>>>,
}

impl<T> Clone for PendingRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            waiters: Arc::clone(&self.waiters),
        }
    }
}

impl<T> Default for PendingRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingRegistry<T> {
    pub fn new() -> Self {
        Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register interest in `id` and get the receiving half
    ///
    /// Registering before the request goes out avoids losing a response
    /// that races the wait.
    pub fn insert(&self, id: impl Into<String>) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.into(), tx);
        rx
    }

    /// Deliver a response. Returns false when nobody is waiting for `id`.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        match self.lock().remove(id) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drop a registration without resolving it
    pub fn expire(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait on a receiver obtained from [`insert`](Self::insert)
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<T>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> PendingOutcome<T> {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => PendingOutcome::Cancelled,
            result = tokio::time::timeout(timeout, rx) => match result {
                Ok(Ok(value)) => PendingOutcome::Resolved(value),
                // Sender dropped: the registry was torn down
                Ok(Err(_)) => PendingOutcome::Cancelled,
                Err(_) => PendingOutcome::TimedOut,
            },
        };
        self.expire(id);
        outcome
    }

    /// Insert and wait in one step
    pub async fn register_and_wait(
        &self,
        id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> PendingOutcome<T> {
        let rx = self.insert(id);
        self.wait(id, rx, timeout, cancel).await
    }

    /// Resolve nothing, drop everything (transport shut down)
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<T>>> {
        // A poisoned map only means another waiter panicked; the data is still usable
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_before_wait() {
        let registry = PendingRegistry::new();
        let rx = registry.insert("a");
        assert!(registry.resolve("a", 7u32));
        let cancel = CancellationToken::new();
        let outcome = registry
            .wait("a", rx, Duration::from_secs(1), &cancel)
            .await;
        assert_eq!(outcome, PendingOutcome::Resolved(7));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_registration() {
        let registry: PendingRegistry<u32> = PendingRegistry::new();
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        let outcome = registry
            .register_and_wait("slow", Duration::from_secs(60), &cancel)
            .await;
        assert_eq!(outcome, PendingOutcome::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert!(!registry.contains("slow"));
        // Late responses find nobody waiting
        assert!(!registry.resolve("slow", 1));
    }

    #[tokio::test]
    async fn test_cancel_resolves_immediately() {
        let registry: PendingRegistry<u32> = PendingRegistry::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = registry
            .register_and_wait("x", Duration::from_secs(3600), &cancel)
            .await;
        assert_eq!(outcome, PendingOutcome::Cancelled);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registries_are_isolated() {
        let a: PendingRegistry<u32> = PendingRegistry::new();
        let b: PendingRegistry<u32> = PendingRegistry::new();
        let _rx = a.insert("same-id");
        assert!(!b.resolve("same-id", 1));
        assert!(a.contains("same-id"));
    }
}
