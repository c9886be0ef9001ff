//! Startup wiring
//!
//! - Configuration discovery and validation
//! - Service construction and dependency injection

pub mod config;
pub mod services;

pub use config::load_config;
pub use services::{init_services, Services};
