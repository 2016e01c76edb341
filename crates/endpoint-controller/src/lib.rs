//! Endpoints and EndpointSlice controllers.
//!
//! Both controllers share the informer caches and a change dispatcher; each
//! owns a work queue and a worker pool, so a Service is never reconciled
//! concurrently within one pipeline while distinct Services run in parallel.

pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod mock;
