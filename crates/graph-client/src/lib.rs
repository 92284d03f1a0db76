//! Authenticated, rate-limited HTTP client for the Graph API
//!
//! The client knows nothing about how tokens are minted; it pulls them
//! through the [`TokenSource`] seam, which the auth crate implements.

mod client;
mod paging;
mod rate_limit;

pub use client::{ApiClient, TokenSource};
pub use paging::{DEFAULT_MAX_PAGES, PageOptions};
pub use rate_limit::{DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW, RateLimiter};
