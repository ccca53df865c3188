//! Fetch execution: request de-duplication and retry with backoff

pub mod coordinator;
pub mod retry;

pub use coordinator::{fetcher, DispatchOptions, FetchCoordinator, FetchHandle, Fetcher, SettleHook};
pub use retry::{execute_with_retry, RetryClassifier, RetryOutcome, RetryPolicy};
