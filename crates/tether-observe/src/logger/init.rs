use std::sync::atomic::{AtomicBool, Ordering};

use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing::Subscriber;
use tracing_subscriber::{
    EnvFilter, fmt, fmt::time::OffsetTime, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::logger::{config::LoggerConfig, error::LoggerError};

pub(super) fn text(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    let layer = fmt::layer()
        .with_ansi(cfg.use_color)
        .with_target(cfg.with_targets)
        .with_timer(local_timer());
    install(tracing_subscriber::registry().with(filter(&cfg.level)?).with(layer))
}

pub(super) fn json(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    let layer = fmt::layer()
        .json()
        .with_ansi(false)
        .with_target(cfg.with_targets)
        .with_current_span(true)
        .with_timer(local_timer());
    install(tracing_subscriber::registry().with(filter(&cfg.level)?).with(layer))
}

#[cfg(all(target_os = "linux", feature = "journald"))]
pub(super) fn journald(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    let layer = tracing_journald::layer()
        .map_err(|e| LoggerError::InitializationFailed(format!("journald: {e}")))?
        .with_syslog_identifier("tether".to_string());
    install(tracing_subscriber::registry().with(filter(&cfg.level)?).with(layer))
}

#[cfg(not(all(target_os = "linux", feature = "journald")))]
pub(super) fn journald(_cfg: &LoggerConfig) -> Result<(), LoggerError> {
    Err(LoggerError::JournaldNotSupported)
}

pub(super) fn filter(level: &str) -> Result<EnvFilter, LoggerError> {
    EnvFilter::try_new(level).map_err(|_| LoggerError::InvalidLogLevel(level.to_string()))
}

fn local_timer() -> OffsetTime<Rfc3339> {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetTime::new(offset, Rfc3339)
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

fn install<S>(subscriber: S) -> Result<(), LoggerError>
where
    S: Subscriber + Send + Sync + 'static,
{
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(LoggerError::AlreadyInitialized);
    }
    // A subscriber installed by someone else still occupies the global slot.
    subscriber
        .try_init()
        .map_err(|e| LoggerError::InitializationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{LoggerFormat, logger_init};

    #[test]
    fn bad_directive_is_rejected() {
        assert_eq!(
            filter("web=loud").unwrap_err(),
            LoggerError::InvalidLogLevel("web=loud".into())
        );
        assert!(filter("info,tether.driver=debug").is_ok());
    }

    #[test]
    fn second_init_reports_already_initialized() {
        let cfg = LoggerConfig::default().with_color(false);
        // Another test in this binary may have won the race; either way the global is now set.
        let _ = logger_init(&cfg);
        assert_eq!(logger_init(&cfg), Err(LoggerError::AlreadyInitialized));
        assert_eq!(
            logger_init(&cfg.clone().with_format(LoggerFormat::Json)),
            Err(LoggerError::AlreadyInitialized)
        );
    }

    #[test]
    fn invalid_level_fails_before_install() {
        let cfg = LoggerConfig::default().with_level("web=loud");
        assert!(matches!(
            logger_init(&cfg),
            Err(LoggerError::InvalidLogLevel(_))
        ));
    }
}
