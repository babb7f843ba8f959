//! Logging bootstrap: console and/or rolling file output, text or JSON,
//! level from settings with `RUST_LOG` override.

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use gryag_core::Settings;

/// Initialise the global subscriber. The returned guard must live for the
/// process lifetime so buffered file output is flushed on shutdown.
pub fn init(settings: &Settings) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gryag={0},warn", settings.log_level)));

    let json = settings.log_format == "json";

    let console_layer = if settings.enable_console_logging {
        let layer = tracing_subscriber::fmt::layer().with_target(true);
        let layer = if json {
            layer.json().boxed()
        } else {
            layer.boxed()
        };
        Some(layer)
    } else {
        None
    };

    let (file_layer, guard) = if settings.enable_file_logging {
        let dir = settings
            .log_dir
            .as_deref()
            .context("LOG_DIR required for file logging")?;
        let appender = tracing_appender::rolling::daily(dir, "gryag.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        let layer = if json {
            layer.json().boxed()
        } else {
            layer.boxed()
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
