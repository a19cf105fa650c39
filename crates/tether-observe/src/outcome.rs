use tether_model::WaitResult;
use tracing::{Level, error, info, warn};

/// Level a task outcome is reported at.
pub fn severity(res: &WaitResult) -> Level {
    if res.successful() {
        Level::INFO
    } else if res.error.is_some() {
        Level::ERROR
    } else {
        Level::WARN
    }
}

/// Emit one record describing how a task ended.
pub fn log_exit(task: &str, res: &WaitResult) {
    let level = severity(res);
    if level == Level::INFO {
        info!(target: "tether.task", task, "task completed");
    } else if level == Level::WARN {
        warn!(
            target: "tether.task",
            task,
            exit_code = res.exit_code,
            signal = res.signal,
            "task ended unsuccessfully"
        );
    } else {
        let reason = res.error.as_deref().unwrap_or("");
        error!(target: "tether.task", task, reason, "task outcome unknown");
    }
}
