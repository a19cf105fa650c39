use std::fmt;

use serde::{Deserialize, Serialize};

/// Terminal outcome of a task.
///
/// Produced exactly once by a handle's monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitResult {
    /// Process exit code; `-1` when the process did not exit normally or the status is unknown.
    pub exit_code: i32,
    /// Signal that terminated the process, `0` if none.
    pub signal: i32,
    /// Diagnostic for outcomes that are not a plain exit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WaitResult {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            signal: 0,
            error: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            exit_code: -1,
            signal,
            error: None,
        }
    }

    /// Outcome whose exit status could not be observed.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            signal: 0,
            error: Some(error.into()),
        }
    }

    /// Returns `true` for a clean zero exit.
    pub fn successful(&self) -> bool {
        self.exit_code == 0 && self.signal == 0 && self.error.is_none()
    }
}

impl fmt::Display for WaitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit code: {}, signal: {}", self.exit_code, self.signal)?;
        if let Some(err) = &self.error {
            write!(f, ", error: {err}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_clean_exit_is_successful() {
        assert!(WaitResult::exited(0).successful());
        assert!(!WaitResult::exited(1).successful());
        assert!(!WaitResult::signaled(9).successful());
        assert!(!WaitResult::failed("lost").successful());
    }

    #[test]
    fn display_includes_diagnostic() {
        let res = WaitResult::failed("status unavailable");
        assert_eq!(
            res.to_string(),
            "exit code: -1, signal: 0, error: status unavailable"
        );
    }
}
