//! # Abort Scopes
//!
//! An [`AbortScope`] owns the lifetime of every timer and background loop of
//! one component. Aborting a scope aborts all of its children; tasks spawned
//! through [`AbortScope::spawn`] are dropped at their next await point and
//! [`AbortScope::sleep`] returns `false` once the scope is aborted, so a loop
//! that checks it before re-arming can never fire again after `abort()`.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
pub struct AbortScope {
    inner: Arc<ScopeInner>,
}

#[derive(Debug)]
struct ScopeInner {
    tx: watch::Sender<bool>,
    children: Mutex<Vec<Weak<ScopeInner>>>,
}

impl ScopeInner {
    fn new(aborted: bool) -> Self {
        let (tx, _) = watch::channel(aborted);
        Self {
            tx,
            children: Mutex::new(Vec::new()),
        }
    }

    fn abort(&self) {
        self.tx.send_replace(true);
        let children = match self.children.lock() {
            Ok(mut children) => std::mem::take(&mut *children),
            Err(_) => return,
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.abort();
        }
    }
}

impl Default for AbortScope {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortScope {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner::new(false)),
        }
    }

    /// Create a scope that is aborted together with `self`, but can also be
    /// aborted on its own.
    pub fn child(&self) -> Self {
        let Ok(mut children) = self.inner.children.lock() else {
            return Self {
                inner: Arc::new(ScopeInner::new(true)),
            };
        };
        let inner = Arc::new(ScopeInner::new(self.is_aborted()));
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&inner));
        Self { inner }
    }

    pub fn abort(&self) {
        self.inner.abort();
    }

    pub fn is_aborted(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Resolves once the scope is aborted.
    pub async fn aborted(&self) {
        let mut rx = self.inner.tx.subscribe();
        let _ = rx.wait_for(|aborted| *aborted).await;
    }

    /// Sleep for `duration`. Returns `false` if the scope was aborted first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_aborted() {
            return false;
        }
        tokio::select! {
            _ = self.aborted() => false,
            _ = tokio::time::sleep(duration) => !self.is_aborted(),
        }
    }

    /// Spawn a task that is dropped when the scope is aborted.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scope = self.clone();
        tokio::spawn(async move {
            if scope.is_aborted() {
                return;
            }
            tokio::select! {
                _ = scope.aborted() => {}
                _ = fut => {}
            }
        })
    }
}
