use std::io::IsTerminal;

use crate::logger::{error::LoggerError, format::LoggerFormat};

/// Environment variable holding the log filter (`info`, `tether=debug,warn`, ...).
pub const ENV_LOG: &str = "TETHER_LOG";
/// Environment variable holding the output format.
pub const ENV_LOG_FORMAT: &str = "TETHER_LOG_FORMAT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    /// `EnvFilter` directive string.
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color: std::io::stdout().is_terminal(),
        }
    }
}

impl LoggerConfig {
    /// Defaults overridden by `TETHER_LOG` and `TETHER_LOG_FORMAT` when set.
    pub fn from_env() -> Result<Self, LoggerError> {
        let mut cfg = Self::default();
        if let Ok(level) = std::env::var(ENV_LOG) {
            cfg.level = level;
        }
        if let Ok(format) = std::env::var(ENV_LOG_FORMAT) {
            cfg.format = format.parse()?;
        }
        Ok(cfg)
    }

    pub fn with_format(mut self, format: LoggerFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_color(mut self, on: bool) -> Self {
        self.use_color = on;
        self
    }
}
