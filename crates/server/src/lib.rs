//! HTTP service wiring for the natural-language SQL assistant: config,
//! database access, upload store, metrics, and the axum router.

pub mod config;
pub mod db;
pub mod files;
pub mod http;
pub mod metrics;
mod rate_limit;
