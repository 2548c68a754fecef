//! Cooperative cancellation tokens.
//!
//! Every long-running operation in the crate accepts a [`CancelToken`];
//! cancelling it makes the operation return [`PlinthError::Cancelled`]
//! (awaiting lock acquires return `None` instead).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::PlinthError;

/// A cloneable token for cooperative cancellation.
///
/// Clones share state: cancelling any clone cancels them all. Child
/// tokens created with [`CancelToken::child`] are cancelled when their
/// parent is, but cancelling a child leaves the parent untouched.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<CancelToken>>,
}

impl CancelToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a child token cancelled together with this one.
    pub fn child(&self) -> Self {
        let child = CancelToken::new();
        if self.is_cancelled() {
            child.cancel();
        } else {
            self.inner.children.lock().push(child.clone());
        }
        child
    }

    /// Cancel this token, all clones, and all children.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.notify.notify_waiters();
        let children = std::mem::take(&mut *self.inner.children.lock());
        for child in children {
            child.cancel();
        }
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until the token is cancelled. Returns immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check between registering and awaiting to close the race
            // with a concurrent cancel().
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Return `Err(Cancelled)` if the token has been cancelled.
    pub fn check(&self) -> Result<(), PlinthError> {
        if self.is_cancelled() {
            Err(PlinthError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// RAII scope that cancels its token when dropped.
pub struct CancelScope {
    token: CancelToken,
}

impl CancelScope {
    /// Create a scope with a fresh token.
    pub fn new() -> Self {
        Self {
            token: CancelToken::new(),
        }
    }

    /// Create a scope whose token is a child of `parent`.
    pub fn with_parent(parent: &CancelToken) -> Self {
        Self {
            token: parent.child(),
        }
    }

    /// The token governed by this scope.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancelScope {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
