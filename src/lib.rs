//! proxyrelay - OpenAI-compatible relay over a rotating proxy pool
//!
//! This library provides the core functionality for the proxyrelay server:
//! the verified proxy pool, the retrying dispatcher that consumes it, the
//! response relay, and the HTTP API that ties them together.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod pool;
pub mod relay;
pub mod upstream;

pub use config::Config;
pub use error::Error;
