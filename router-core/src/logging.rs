//! # Logging
//!
//! Two independently rotating log streams: an application log for
//! diagnostics and a traffic log for the raw line-by-line PSX protocol
//! conversation, gated by `[log] traffic` in config. The traffic log is a
//! distinct `tracing` target (`"traffic"`) rather than a log level, so it
//! can be toggled without silencing application diagnostics.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

pub const TRAFFIC_TARGET: &str = "traffic";

/// Guards returned by `init` must be held for the process lifetime; once
/// dropped, the non-blocking appenders stop flushing.
pub struct LoggingGuards {
    _app_guard: WorkerGuard,
    _traffic_guard: WorkerGuard,
}

/// Initialize application + traffic logging into `directory`. Traffic
/// lines are filtered out of the application log and vice versa so neither
/// stream drowns the other.
pub fn init(directory: &Path, traffic_enabled: bool) -> anyhow::Result<LoggingGuards> {
    let app_appender = tracing_appender::rolling::daily(directory, "router.log");
    let (app_writer, app_guard) = tracing_appender::non_blocking(app_appender);

    let traffic_appender = tracing_appender::rolling::daily(directory, "traffic.log");
    let (traffic_writer, traffic_guard) = tracing_appender::non_blocking(traffic_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let app_layer = tracing_subscriber::fmt::layer()
        .with_writer(app_writer.and(std::io::stderr).with_filter(|meta| {
            meta.target() != TRAFFIC_TARGET
        }))
        .with_ansi(false);

    let traffic_layer = tracing_subscriber::fmt::layer()
        .with_writer(traffic_writer.with_filter(move |meta| {
            traffic_enabled && meta.target() == TRAFFIC_TARGET
        }))
        .with_ansi(false)
        .without_time();

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(app_layer)
        .with(traffic_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(LoggingGuards {
        _app_guard: app_guard,
        _traffic_guard: traffic_guard,
    })
}

/// Record one protocol line on the traffic target. Kept as a helper so
/// call sites don't need to repeat the target string.
#[macro_export]
macro_rules! traffic_log {
    ($($arg:tt)*) => {
        tracing::info!(target: $crate::logging::TRAFFIC_TARGET, $($arg)*)
    };
}
