//! Utility modules for cdp-sink

pub mod db_retry;
pub mod rate_limit;

pub use db_retry::retry_on_lock;
pub use rate_limit::{CreditsCache, RateLimitLock, RequestPacer};
