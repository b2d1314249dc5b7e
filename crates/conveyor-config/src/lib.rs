//! KDL configuration parsing for the Conveyor pipeline scheduler.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (resources, resource types, jobs)
//! - System configuration for the scheduler process
//! - Human-friendly durations ("30s", "1m", "1h30m")

pub mod duration;
pub mod error;
pub mod pipeline;
pub mod system;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use pipeline::parse_pipeline;
pub use system::{SystemConfig, parse_system_config};
