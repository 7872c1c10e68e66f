//! Response caching, cache warming and query telemetry for the record service.
//!
//! The persistence layer and the HTTP routing layer are collaborators: this crate
//! instruments the former and plugs into the latter as axum middleware.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
pub mod monitor;
pub(crate) mod sync;
