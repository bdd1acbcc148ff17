//! Basic library shared by the alarm services
//!
//! Provides:
//! - logging initialization (console plus optional rolling file)
//! - graceful shutdown signal handling

pub mod logging;
pub mod shutdown;

pub use logging::LogConfig;
pub use shutdown::{shutdown_token, wait_for_shutdown};
