//! Liveness state and graceful drain coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::info;

type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Tracks the sidecar's liveness state and coordinates graceful drain.
///
/// The draining flag transitions once (serving -> draining) and is read
/// by the interceptor before admitting new calls, so readers never
/// block the writer. [`HealthChecker::drained`] resolves when drain
/// begins; the server uses it as its shutdown trigger and then lets
/// in-flight streams complete before closing the listener.
pub struct HealthChecker {
    server_type: String,
    draining: AtomicBool,
    drain_tx: watch::Sender<bool>,
    shutdown_hooks: Mutex<Vec<ShutdownHook>>,
}

impl HealthChecker {
    pub fn new(server_type: impl Into<String>) -> Self {
        let (drain_tx, _) = watch::channel(false);
        Self {
            server_type: server_type.into(),
            draining: AtomicBool::new(false),
            drain_tx,
            shutdown_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Identity tag used to classify this process in health checks.
    pub fn server_type(&self) -> &str {
        &self.server_type
    }

    /// True once [`HealthChecker::begin_drain`] has been called.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Flip into the draining state. Idempotent; the transition is
    /// monotonic and never reversed.
    pub fn begin_drain(&self) {
        if !self.draining.swap(true, Ordering::AcqRel) {
            info!(server_type = %self.server_type, "drain started, rejecting new streams");
            let _ = self.drain_tx.send(true);
        }
    }

    /// Resolves once drain has begun.
    pub async fn drained(&self) {
        let mut rx = self.drain_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Register a hook to run after the listener has closed.
    pub fn register_shutdown(&self, hook: impl FnOnce() + Send + 'static) {
        self.shutdown_hooks
            .lock()
            .expect("shutdown hook lock poisoned")
            .push(Box::new(hook));
    }

    /// Run registered shutdown hooks, in registration order.
    pub fn run_shutdown_hooks(&self) {
        let hooks = std::mem::take(
            &mut *self
                .shutdown_hooks
                .lock()
                .expect("shutdown hook lock poisoned"),
        );
        for hook in hooks {
            hook();
        }
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("server_type", &self.server_type)
            .field("draining", &self.is_draining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn drain_is_monotonic_and_observable() {
        let health = Arc::new(HealthChecker::new("sidecar"));
        assert!(!health.is_draining());

        let waiter = {
            let health = health.clone();
            tokio::spawn(async move { health.drained().await })
        };

        health.begin_drain();
        health.begin_drain(); // second call is a no-op
        assert!(health.is_draining());
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn drained_resolves_when_already_draining() {
        let health = HealthChecker::new("sidecar");
        health.begin_drain();
        health.drained().await;
    }

    #[test]
    fn shutdown_hooks_run_once_in_order() {
        let health = HealthChecker::new("sidecar");
        let counter = Arc::new(AtomicUsize::new(0));

        for expected in 0..3 {
            let counter = counter.clone();
            health.register_shutdown(move || {
                assert_eq!(counter.fetch_add(1, Ordering::SeqCst), expected);
            });
        }

        health.run_shutdown_hooks();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        health.run_shutdown_hooks();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
