//! Logging setup for tether binaries.
//!
//! ```no_run
//! use tether_observe::{LoggerConfig, LoggerFormat, logger_init};
//!
//! let cfg = LoggerConfig::default().with_format(LoggerFormat::Json).with_level("debug");
//! logger_init(&cfg).expect("logger");
//! ```

mod logger;
pub use logger::*;

mod outcome;
pub use outcome::{log_exit, severity};
