use std::{fmt::Display, io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::lite::config;

/// Keeps the non-blocking writer flushing until dropped.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// Level a message of the given verbosity is logged at: 0 is info, 1 debug, 2 and up trace.
pub fn verbosity_level(verbosity: u8) -> tracing::Level {
    match verbosity {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

/// Logs `message` with `error` attached at the level for `verbosity`.
pub fn log_verbose(verbosity: u8, error: &dyn Display, message: &str) {
    let level = verbosity_level(verbosity);
    if level == tracing::Level::INFO {
        tracing::info!(error = %error, "{message}");
    } else if level == tracing::Level::DEBUG {
        tracing::debug!(error = %error, "{message}");
    } else {
        tracing::trace!(error = %error, "{message}");
    }
}

fn level_name(level: tracing::Level) -> &'static str {
    if level == tracing::Level::INFO {
        "info"
    } else if level == tracing::Level::DEBUG {
        "debug"
    } else {
        "trace"
    }
}

/// Filter directive for a configured level. Unknown levels fall back to `info`.
///
/// Besides level names, a verbosity number is accepted: `0` shows verbosity-0 messages
/// only, `1` adds debug detail such as refused dials, `2` and up everything.
fn level_directive(level: &str) -> &'static str {
    let level = level.trim().to_ascii_lowercase();
    if let Ok(v) = level.parse::<u8>() {
        return level_name(verbosity_level(v));
    }
    match level.as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let fmt = logging.format.trim().to_ascii_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(&logging.level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(logging.output.trim())?;

    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(fmt == "text" && logging.output.trim() == "stderr")
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let base_fmt = if fmt == "json" {
        base_fmt.json().boxed()
    } else {
        base_fmt.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(base_fmt)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn make_writer(
    output: &str,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        other => {
            let p = Path::new(other);
            if let Some(parent) = p.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("logging: mkdir {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_directives() {
        assert_eq!(level_directive("TRACE"), "trace");
        assert_eq!(level_directive(" debug "), "debug");
        assert_eq!(level_directive("warning"), "warn");
        assert_eq!(level_directive("verbose"), "info");
        assert_eq!(level_directive("0"), "info");
        assert_eq!(level_directive("1"), "debug");
        assert_eq!(level_directive("7"), "trace");
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(verbosity_level(0), tracing::Level::INFO);
        assert_eq!(verbosity_level(1), tracing::Level::DEBUG);
        assert_eq!(verbosity_level(2), tracing::Level::TRACE);
    }

    #[test]
    fn file_output_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("prism_lite_log_test_{}", std::process::id()));
        let path = dir.join("nested").join("lite.log");
        let (_writer, guard) = make_writer(path.to_str().expect("utf8 path")).expect("writer");
        drop(guard);
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
