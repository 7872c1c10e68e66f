//! Infrastructure adapters and runtime bootstrap.

pub mod cache;
pub mod cache_warmer;
pub mod error;
pub mod http;
pub mod records;
pub mod telemetry;
