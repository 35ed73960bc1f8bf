//! Cooperative cancellation signal for request handlers.
//!
//! Every request carries a [`CancellationToken`] that is cancelled when the
//! client goes away. Nothing is aborted forcibly: long-running handlers (SSE
//! producers in particular) are expected to poll [`CancellationToken::is_cancelled`]
//! or race [`CancellationToken::cancelled`] against their own work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A token that can be used to signal cancellation across async operations.
///
/// # Examples
///
/// ```
/// use ferrous_modular::CancellationToken;
///
/// let token = CancellationToken::new();
/// let observer = token.clone();
/// assert!(!observer.is_cancelled());
///
/// token.cancel_with_reason("User disconnect.");
/// assert!(observer.is_cancelled());
/// assert_eq!(observer.reason().as_deref(), Some("User disconnect."));
/// ```
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancellationTokenInner>,
}

#[derive(Default)]
struct CancellationTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
    reason: Mutex<Option<String>>,
}

impl CancellationToken {
    /// Creates a new, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token, signaling that associated operations should stop.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Cancels the token and records why. The first reason wins.
    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_none() && !self.is_cancelled() {
                *slot = Some(reason.into());
            }
        }
        self.cancel();
    }

    /// Returns true if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The reason given on cancellation, if any.
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Completes once cancellation is requested.
    ///
    /// Suitable for `tokio::select!` against the handler's own work.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel() cannot slip between.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Returns a guard that cancels this token when dropped.
    ///
    /// The binding layer keeps one inside every request future and every SSE
    /// body stream, so dropping either (client disconnect) trips the signal.
    pub fn drop_guard(&self, reason: &'static str) -> DropGuard {
        DropGuard {
            token: Some(self.clone()),
            reason,
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Cancels its token on drop unless disarmed.
#[must_use = "dropping the guard cancels the token immediately"]
pub struct DropGuard {
    token: Option<CancellationToken>,
    reason: &'static str,
}

impl DropGuard {
    /// Releases the token without cancelling it.
    pub fn disarm(mut self) -> CancellationToken {
        match self.token.take() {
            Some(token) => token,
            None => CancellationToken::new(),
        }
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel_with_reason(self.reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_reason_wins() {
        let token = CancellationToken::new();
        token.cancel_with_reason("first");
        token.cancel_with_reason("second");
        assert_eq!(token.reason().as_deref(), Some("first"));
    }

    #[test]
    fn guard_cancels_on_drop_but_not_when_disarmed() {
        let token = CancellationToken::new();
        let guard = token.drop_guard("gone");
        let same = guard.disarm();
        assert!(!same.is_cancelled());

        {
            let _guard = token.drop_guard("gone");
        }
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn cancelled_future_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let woke = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter timed out")
            .expect("waiter panicked");
        assert!(woke);
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("should not wait");
    }
}
