//! Search fan-out: provider boundary, rate-limited calls, per-entity
//! tasks, and the bounded worker pool that runs them.
//!
//! One [`RateLimiter`] is shared by every in-flight search of a run. Each
//! entity's outcome is captured in a [`SearchResult`](newsfeed_shared::SearchResult),
//! so a single failure never aborts the batch.

mod client;
mod dispatcher;
mod provider;
mod runner;

pub use client::{RateLimitedClient, RateLimiter};
pub use dispatcher::ConcurrentDispatcher;
pub use provider::{SearchProvider, SearchQuery, SerperProvider, parse_published};
pub use runner::{EntityTaskRunner, QueryTemplate};
