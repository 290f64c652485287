//! Production-ready structured logging configuration
//!
//! Provides cloud-native logging with:
//! - JSON output for production
//! - Pretty formatting for development
//! - Configurable via environment variables
//! - Automatic context propagation

use crate::config::get_config;
use std::sync::RwLock;
use tracing::Span;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};
use uuid::Uuid;

/// The session block the orchestrator most recently published as active, set
/// by [`set_current_session_id`] on every dispatch. Falls back to a fresh id
/// when nothing has been published yet or no session is currently active.
static LAST_ACTIVE_SESSION_ID: RwLock<Option<String>> = RwLock::new(None);

/// Initialize the logging system based on configuration
pub fn init_logging() {
    let config = get_config();

    // Use configuration values
    let log_level = &config.logging.level;
    let log_output = &config.logging.output;
    let log_format = &config.logging.format;

    // Build environment filter
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // Configure output based on config
    match log_output.as_str() {
        "file" => init_file_logging(env_filter, log_format, &config.paths.log_directory),
        "both" => init_combined_logging(env_filter, log_format, &config.paths.log_directory),
        _ => init_console_logging(env_filter, log_format),
    }
}

fn init_console_logging(filter: EnvFilter, format: &str) {
    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        "json" => {
            subscriber
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_target(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .init();
        }
        _ => {
            subscriber
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(true)
                        .with_span_events(FmtSpan::CLOSE)
                        .pretty(),
                )
                .init();
        }
    }
}

fn init_file_logging(filter: EnvFilter, format: &str, log_dir: &std::path::Path) {
    let file_appender = tracing_appender::rolling::daily(log_dir, "usage-ledger.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        "json" => {
            subscriber
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(non_blocking)
                        .with_current_span(true)
                        .with_span_list(true),
                )
                .init();
        }
        _ => {
            subscriber
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
        }
    }
}

fn init_combined_logging(filter: EnvFilter, format: &str, log_dir: &std::path::Path) {
    let file_appender = tracing_appender::rolling::daily(log_dir, "usage-ledger.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        "json" => {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stdout))
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        }
        _ => {
            subscriber
                .with(fmt::layer().pretty().with_writer(std::io::stdout))
                .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
                .init();
        }
    }
}

/// Create a span tagged with the active session's id, for tracing calls that
/// happen inside the orchestrator's dispatch path (see [`current_session_id`]).
#[macro_export]
macro_rules! span_with_context {
    ($level:expr, $name:expr, $($field:tt)*) => {
        tracing::span!($level, $name, session_id = %$crate::logging::current_session_id(), $($field)*)
    };
}

/// The session id tracing calls should tag themselves with: the enclosing
/// span's `session_id` field if one is already open, else the id the
/// orchestrator last published as active (see [`set_current_session_id`]),
/// else a fresh id (no session has ever been active).
pub fn current_session_id() -> String {
    if let Some(field) = Span::current().field("session_id") {
        return field.to_string();
    }
    LAST_ACTIVE_SESSION_ID
        .read()
        .unwrap()
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Records the session block the orchestrator just published as active, so
/// subsequent log spans opened via [`span_with_context!`] pick it up even
/// outside the dispatch call's own span.
pub fn set_current_session_id(session_id: Option<String>) {
    *LAST_ACTIVE_SESSION_ID.write().unwrap() = session_id;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_a_fresh_id_when_nothing_published() {
        set_current_session_id(None);
        let id = current_session_id();
        assert!(!id.is_empty());
    }

    #[test]
    fn reflects_the_last_published_session_id() {
        set_current_session_id(Some("session-abc".to_string()));
        assert_eq!(current_session_id(), "session-abc");
        set_current_session_id(None);
    }
}
