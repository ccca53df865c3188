//! Query status and the result handed to callers

use crate::error::QueryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a query key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryStatus {
    /// Never fetched, or disabled
    Idle,

    /// First fetch running, nothing cached yet
    Loading,

    /// Data available (possibly stale and being refetched)
    Success,

    /// Last fetch failed after all retries
    Error,
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryStatus::Idle => write!(f, "idle"),
            QueryStatus::Loading => write!(f, "loading"),
            QueryStatus::Success => write!(f, "success"),
            QueryStatus::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of one query as seen by a caller
///
/// An errored query still carries its last successfully fetched value in
/// `data` when the cache has one.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub data: Option<T>,
    pub error: Option<QueryError>,
    pub status: QueryStatus,

    /// Data is older than the query's stale time
    pub is_stale: bool,

    /// A fetch for this key is running
    pub is_fetching: bool,

    /// When the cached value was written
    pub updated_at: Option<DateTime<Utc>>,
}

impl<T> QueryResult<T> {
    pub(crate) fn idle() -> Self {
        Self {
            data: None,
            error: None,
            status: QueryStatus::Idle,
            is_stale: false,
            is_fetching: false,
            updated_at: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// Errored but still holding a previously fetched value
    pub fn has_stale_fallback(&self) -> bool {
        self.is_error() && self.data.is_some()
    }
}
