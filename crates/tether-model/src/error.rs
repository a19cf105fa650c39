use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("missing required config key '{0}'")]
    MissingKey(String),
    #[error("invalid value for config key '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}
