//! Aggregate query activity shared by every engine of a client
//!
//! A [`GlobalQueryState`] is created by the application, handed to the
//! [`QueryClient`](crate::QueryClient) and observed by anything that wants a
//! global loading indicator or error banner. Only the engines mutate it.

use crate::error::QueryError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Listener invoked after every change
pub type StateListener = Arc<dyn Fn(&GlobalSnapshot) + Send + Sync>;

/// Point-in-time view of the global state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSnapshot {
    /// Fetches and mutations currently running
    pub active_count: usize,

    /// Most recent terminal error of any query or mutation
    pub last_error: Option<QueryError>,
}

impl GlobalSnapshot {
    pub fn is_fetching(&self) -> bool {
        self.active_count > 0
    }
}

#[derive(Default)]
struct StateInner {
    last_error: Option<QueryError>,
    listeners: Vec<(u64, StateListener)>,
    next_listener_id: u64,
}

/// Active counter and last error, with change listeners
#[derive(Default)]
pub struct GlobalQueryState {
    active: AtomicUsize,
    inner: Mutex<StateInner>,
}

impl GlobalQueryState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_fetching(&self) -> bool {
        self.active_count() > 0
    }

    pub fn last_error(&self) -> Option<QueryError> {
        self.inner.lock().last_error.clone()
    }

    pub fn snapshot(&self) -> GlobalSnapshot {
        GlobalSnapshot {
            active_count: self.active_count(),
            last_error: self.last_error(),
        }
    }

    /// Register a listener; it stays registered until unsubscribed
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Unsubscribe
    where
        F: Fn(&GlobalSnapshot) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, Arc::new(listener)));

        Unsubscribe {
            id,
            state: Arc::downgrade(self),
        }
    }

    /// Dismiss the last error
    pub fn clear_error(&self) {
        self.inner.lock().last_error = None;
        self.notify();
    }

    /// Drop every listener
    pub fn shutdown(&self) {
        let dropped = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.listeners).len()
        };
        info!("Global query state shut down ({} listeners dropped)", dropped);
    }

    /// Count one unit of activity and tell listeners
    pub(crate) fn begin(self: &Arc<Self>) -> ActivityGuard {
        let guard = self.begin_quiet();
        self.notify();
        guard
    }

    /// Count one unit of activity; the caller notifies once its locks are released
    pub(crate) fn begin_quiet(self: &Arc<Self>) -> ActivityGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            state: self.clone(),
        }
    }

    pub(crate) fn record_error(&self, error: QueryError) {
        debug!("Recording global error: {}", error);
        self.inner.lock().last_error = Some(error);
        self.notify();
    }

    pub(crate) fn notify(&self) {
        let (snapshot, listeners) = {
            let inner = self.inner.lock();
            let snapshot = GlobalSnapshot {
                active_count: self.active_count(),
                last_error: inner.last_error.clone(),
            };
            let listeners: Vec<StateListener> =
                inner.listeners.iter().map(|(_, l)| l.clone()).collect();
            (snapshot, listeners)
        };

        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn remove_listener(&self, id: u64) {
        self.inner.lock().listeners.retain(|(lid, _)| *lid != id);
    }
}

/// One running fetch or mutation; settles the count when dropped
pub struct ActivityGuard {
    state: Arc<GlobalQueryState>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
        self.state.notify();
    }
}

/// Removes a listener registered with [`GlobalQueryState::subscribe`]
#[must_use = "dropping an Unsubscribe leaves the listener registered"]
pub struct Unsubscribe {
    id: u64,
    state: Weak<GlobalQueryState>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(state) = self.state.upgrade() {
            state.remove_listener(self.id);
        }
    }
}
