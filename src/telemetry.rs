//! Structured logging setup (spec.md §4.9 ambient stack). Inspired by
//! `examples/Masorubka1-iscsi-client-rs/src/cfg/logger.rs`'s
//! config-driven `tracing-subscriber` setup, trimmed to this core's needs:
//! no async runtime, no span-field capture layer, just level filtering and
//! a choice of writer.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryOutput {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// An `EnvFilter` directive string, e.g. `"info"` or
    /// `"syslog_ingest_core=debug,warn"`.
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default = "default_output")]
    pub output: TelemetryOutput,
    /// Required when `output == File`.
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

fn default_output() -> TelemetryOutput {
    TelemetryOutput::Stderr
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            output: default_output(),
            file_path: None,
            json: false,
        }
    }
}

/// Installs the global `tracing` subscriber. The returned `WorkerGuard` must
/// be held for the process lifetime; dropping it stops the non-blocking
/// writer from flushing.
pub fn init(config: &TelemetryConfig) -> io::Result<WorkerGuard> {
    let (writer, guard) = make_writer(config)?;
    let filter = EnvFilter::try_new(&config.filter)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true);

    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(guard)
}

fn make_writer(config: &TelemetryConfig) -> io::Result<(BoxMakeWriter, WorkerGuard)> {
    Ok(match config.output {
        TelemetryOutput::Stdout => {
            let (w, g) = tracing_appender::non_blocking(io::stdout());
            (BoxMakeWriter::new(w), g)
        }
        TelemetryOutput::Stderr => {
            let (w, g) = tracing_appender::non_blocking(io::stderr());
            (BoxMakeWriter::new(w), g)
        }
        TelemetryOutput::File => {
            let path = config
                .file_path
                .as_deref()
                .map(PathBuf::from)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "file_path required for output=file"))?;
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, path.file_name().unwrap_or_default());
            let (w, g) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(w), g)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_stderr_info() {
        let cfg = TelemetryConfig::default();
        assert_eq!(cfg.filter, "info");
        assert_eq!(cfg.output, TelemetryOutput::Stderr);
        assert!(!cfg.json);
    }
}
