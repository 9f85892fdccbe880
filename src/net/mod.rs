//! Network boundary: request/response values, the fetch provider, and
//! synthesized offline responses.

mod client;
pub mod offline;
mod types;

pub use client::{fetch_with_timeout, FetchError, Fetcher, HttpFetcher};
pub use types::{Method, Request, Response};
