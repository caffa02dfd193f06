//! HTTP access with bounded exponential-backoff retry
//!
//! Every network call in the pipeline goes through [`HttpFetcher`]. Each
//! worker builds its own fetcher, so no connection pool or session state is
//! shared between workers.

mod backoff;
mod http;

pub use backoff::BackoffPolicy;
pub use http::{FetchConfig, HttpFetcher};
