use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::natpunch::config::{LoggingConfig, Rotation};

/// Keeps the non-blocking writer flushing; drop it last.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

pub fn init(logging: &LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(&logging.level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(logging.output.trim(), logging.rotation)?;

    let json = logging.format == "json";
    let base = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(!json && logging.output.trim() == "stderr")
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);
    let base = if json { base.json().boxed() } else { base.boxed() };

    tracing_subscriber::registry()
        .with(filter)
        .with(base)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

fn make_writer(
    output: &str,
    rotation: Rotation,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    match output {
        "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        other => {
            let p = Path::new(other);
            let dir = p.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir).with_context(|| format!("logging: mkdir {}", dir.display()))?;

            let file_name = p
                .file_name()
                .with_context(|| format!("logging: output {other:?} has no file name"))?;

            match rotation {
                Rotation::Never => {
                    let file = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(p)
                        .with_context(|| format!("logging: open {}", p.display()))?;
                    Ok(tracing_appender::non_blocking(file))
                }
                Rotation::Daily => Ok(tracing_appender::non_blocking(rolling::daily(dir, file_name))),
                Rotation::Hourly => Ok(tracing_appender::non_blocking(rolling::hourly(dir, file_name))),
            }
        }
    }
}
