//! Queries: cache-first reads, background revalidation and subscriptions

pub mod engine;
pub mod options;
pub mod result;

pub use engine::{QueryEngine, QuerySubscription};
pub use options::{ErrorCallback, Query, QueryFetcher, QueryOptions, SettledCallback, SuccessCallback};
pub use result::{QueryResult, QueryStatus};
