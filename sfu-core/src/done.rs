//! One-shot completion latch
//!
//! Every session owns one of these. The WebSocket read loop, the engine
//! callbacks and the track pipes all share it: the first `finish()` wins and
//! every observer sees the session as done from then on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct Done {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    fired: AtomicBool,
    notify: Notify,
}

impl Done {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the latch. Idempotent and safe to call from any task.
    pub fn finish(&self) {
        if !self.inner.fired.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Resolves once the latch has fired; immediately if it already has.
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent finish() cannot
        // slip between the check and the await.
        notified.as_mut().enable();
        if self.is_done() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn starts_open() {
        let done = Done::new();
        assert!(!done.is_done());
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let done = Done::new();
        done.finish();
        done.finish();
        assert!(done.is_done());
    }

    #[tokio::test]
    async fn wait_after_finish_returns_immediately() {
        let done = Done::new();
        done.finish();
        done.wait().await;
    }

    #[tokio::test]
    async fn wait_observes_finish_from_another_task() {
        let done = Done::new();
        let waiter = done.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        done.finish();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait() did not observe finish()")
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_finish_fires_once() {
        let done = Done::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let done = done.clone();
            handles.push(tokio::spawn(async move { done.finish() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(done.is_done());
        done.wait().await;
    }
}
