//! Application module
//!
//! Wiring of caches, informers, controllers and background tasks, plus the
//! lifecycle that runs them.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
