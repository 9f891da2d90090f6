//! Provider adapters: one trait, configuration-driven wire families,
//! centralized retry policy.

pub mod client;
pub mod retry;
pub mod types;

pub use client::{HttpProvider, ProviderClient};
pub use retry::{query_with_retry, RetryConfig};
pub use types::{NormalizedResponse, ProviderQuery};
