#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Host bootstrap for the weft runtime
//!
//! Layered configuration, logging initialization, signal handling and path
//! utilities, plus [`run_server`] tying them to a [`weft_runtime::RuntimeContext`].

pub mod config;
pub mod logging;
pub mod paths;
pub mod run;
pub mod signals;

pub use config::{
    AppConfig, ConfigError, ConfigOverrides, LogFormat, LoggingConfig, ValidatedConfig,
    discover_config, load_config, load_layered,
};
pub use logging::init_logging;
pub use run::run_server;
pub use signals::{ShutdownSignal, wait_for_shutdown};
