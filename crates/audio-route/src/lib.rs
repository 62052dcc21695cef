//! Audio route coordination core.
//!
//! Connects playback, record, voice and FM loopback routes to codec endpoints
//! and keeps every hardware path in step with asynchronous device readiness.

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod hw;
pub mod loopback;
pub mod registry;
pub mod route;
pub mod sessions;

pub use context::Context;
pub use error::{Result, RouteError};
