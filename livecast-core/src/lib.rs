//! `LiveCast` signaling core
//!
//! Stream sessions, WebRTC negotiation on top of [`livecast_sfu`], moderated
//! per-stream chat and the event fan-out that ties them to client
//! connections.

pub mod bootstrap;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod hub;
pub mod logging;
pub mod models;
pub mod service;

#[cfg(test)]
pub mod test_helpers;

pub use config::Config;
pub use error::{Error, Result};
