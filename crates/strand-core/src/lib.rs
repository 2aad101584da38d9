//! # strand-core
//!
//! Dependency-free leaf crate for the strand fiber runtime: error types,
//! leveled stderr logging, and environment-variable helpers shared by the
//! runtime and I/O crates.

pub mod env;
pub mod error;
pub mod slog;

pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{EventError, SchedError, SchedResult};
pub use slog::{set_flush_enabled, set_log_level, LogLevel};
