//! HTTP client for the node-graph server that executes submitted jobs.

#![warn(missing_docs)]

pub mod http;

pub use http::HttpBackend;
