use std::path::PathBuf;

use clap::{Args, ValueEnum};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable output for local runs
    Pretty,
    /// One JSON object per event, for log shippers
    Json,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingConfig {
    /// Log filter directive (overridden by RUST_LOG)
    #[arg(long, env = "BOOTSTRAP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, value_enum, env = "BOOTSTRAP_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Also write daily-rolling log files into this directory
    #[arg(long, env = "BOOTSTRAP_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(level)?),
    }
}

/// Initialize structured logging on stderr (stdout carries the report).
///
/// The returned guard must live as long as the process when a log
/// directory is configured, or buffered file lines are lost.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = build_filter(&config.log_level)?;

    let (file_writer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "doc-bootstrap.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => {
            let stderr_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_writer(std::io::stderr);
            let file_layer = file_writer.map(|writer| {
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_ansi(false)
                    .with_writer(writer)
            });
            registry.with(stderr_layer).with(file_layer).try_init()?;
        }
        LogFormat::Pretty => {
            let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
            let file_layer =
                file_writer.map(|writer| fmt::layer().with_ansi(false).with_writer(writer));
            registry.with(stderr_layer).with(file_layer).try_init()?;
        }
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert!(build_filter("info,doc_bootstrap=debug").is_ok());
        assert!(build_filter("doc_bootstrap=notalevel").is_err());
    }
}
