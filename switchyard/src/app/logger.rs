use std::fmt;
use std::path::Path;

use anyhow::{anyhow, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use crate::config;

struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

fn level_directive(level: &str) -> Result<&'static str> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "" | "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" | "fatal" | "panic" => Ok("error"),
        _ => Err(anyhow!("unknown log level: {}", level)),
    }
}

fn env_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = level_directive(level)?;
    EnvFilter::try_new(format!("switchyard={},switchyard_cli={}", level, level))
        .map_err(|e| anyhow!("invalid log filter: {}", e))
}

/// Installs the global subscriber. The returned guard flushes file output
/// when dropped and must be kept alive for as long as logging is wanted.
pub fn setup_logger(config: &config::Log) -> Result<Option<WorkerGuard>> {
    if config.disabled {
        return Ok(None);
    }
    let filter = env_filter(&config.level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalTime)
        .with_target(false);

    match config.output.as_deref() {
        Some(output) if !output.is_empty() && output != "console" => {
            let path = Path::new(output);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file = path
                .file_name()
                .ok_or_else(|| anyhow!("invalid log output: {}", output))?;
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            builder
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
                .map_err(|e| anyhow!("setup logger failed: {}", e))?;
            Ok(Some(guard))
        }
        _ => {
            builder
                .with_ansi(true)
                .try_init()
                .map_err(|e| anyhow!("setup logger failed: {}", e))?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive("").unwrap(), "info");
        assert_eq!(level_directive("WARN").unwrap(), "warn");
        assert_eq!(level_directive("panic").unwrap(), "error");
        assert!(level_directive("loud").is_err());
    }
}
