//! Configuration for the dockrun build worker.
//!
//! Every setting can be given as a command-line flag or an environment
//! variable, and falls back to a documented default.

pub mod error;
pub mod settings;

pub use error::{ConfigError, ConfigResult};
pub use settings::RunnerConfig;
