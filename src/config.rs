// Declarative pipeline setup from a JSON5 config file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::dispatch::InitMode;
use crate::sink::Sink;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: json5::Error,
    },
}

/// Top-level pipeline configuration.
///
/// ```json5
/// {
///   mode: "perfectly_ordered",
///   level: "LOG_INFO",
///   disk_threshold_percent: 95,
///   sinks: [
///     { type: "file", path: "app.log" },
///     { type: "size_rotated", path: "big.log", max_bytes: 1048576, keep: 5 },
///     { type: "udp_v4", host: "127.0.0.1", port: 5015 },
///   ],
/// }
/// ```
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub mode: QueueMode,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub disk_threshold_percent: Option<f64>,
    #[serde(default)]
    pub sinks: Vec<SinkSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    #[default]
    PerfectlyOrdered,
    AllowUnordered,
}

impl From<QueueMode> for InitMode {
    fn from(mode: QueueMode) -> Self {
        match mode {
            QueueMode::PerfectlyOrdered => InitMode::PerfectlyOrdered,
            QueueMode::AllowUnordered => InitMode::AllowUnordered,
        }
    }
}

/// Log-line and timestamp templates for one sink.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatSpec {
    pub log: String,
    #[serde(default = "default_date_format")]
    pub date: String,
}

fn default_date_format() -> String {
    crate::format::DEFAULT_DATE_FORMAT.to_string()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSpec {
    File {
        path: PathBuf,
        #[serde(default)]
        format: Option<FormatSpec>,
    },
    SizeRotated {
        path: PathBuf,
        max_bytes: u64,
        keep: u32,
        #[serde(default)]
        format: Option<FormatSpec>,
    },
    IntervalRotated {
        path: PathBuf,
        seconds: u64,
        keep: u32,
        #[serde(default)]
        format: Option<FormatSpec>,
    },
    Daily {
        path: PathBuf,
        hour: u32,
        minute: u32,
        second: u32,
        #[serde(default)]
        format: Option<FormatSpec>,
    },
    UdpV4 {
        host: String,
        port: u16,
        #[serde(default)]
        format: Option<FormatSpec>,
    },
    UdpV6 {
        host: String,
        port: u16,
        #[serde(default)]
        format: Option<FormatSpec>,
    },
}

pub fn load(path: impl AsRef<Path>) -> Result<PipelineConfig, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    json5::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Initialize the pipeline and register every configured sink. The returned
/// handles own the sinks; dropping one deregisters that sink. Must be
/// called within a tokio runtime.
pub fn apply(config: &PipelineConfig) -> Vec<Arc<dyn Sink>> {
    crate::init(config.mode.into());
    if let Some(level) = &config.level {
        crate::set_level(level);
    }
    if let Some(percent) = config.disk_threshold_percent {
        crate::set_disk_space_threshold(percent);
    }

    config
        .sinks
        .iter()
        .map(|spec| match spec {
            SinkSpec::File { path, format } => with_format(crate::register_file(path), format),
            SinkSpec::SizeRotated {
                path,
                max_bytes,
                keep,
                format,
            } => with_format(
                crate::register_size_rotated(path, *max_bytes, *keep),
                format,
            ),
            SinkSpec::IntervalRotated {
                path,
                seconds,
                keep,
                format,
            } => with_format(
                crate::register_interval_rotated(path, *seconds, *keep),
                format,
            ),
            SinkSpec::Daily {
                path,
                hour,
                minute,
                second,
                format,
            } => with_format(
                crate::register_daily(path, *hour, *minute, *second),
                format,
            ),
            SinkSpec::UdpV4 { host, port, format } => {
                with_format(crate::register_udp_v4(host, *port), format)
            }
            SinkSpec::UdpV6 { host, port, format } => {
                with_format(crate::register_udp_v6(host, *port), format)
            }
        })
        .collect()
}

fn with_format<S: Sink + 'static>(sink: Arc<S>, format: &Option<FormatSpec>) -> Arc<dyn Sink> {
    if let Some(format) = format {
        sink.set_configuration(&format.log, &format.date);
    }
    sink
}
