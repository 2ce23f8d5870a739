//! Tracing initialization shared by every daemon.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Global level: trace, debug, info, warn, error.
    pub level: String,
    /// Optional log file; stdout when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Rotation knobs, honored by external log shippers. Kept in the schema
    /// so configs carrying them still parse.
    #[serde(default)]
    pub max_size: Option<u64>,
    #[serde(default)]
    pub max_backups: Option<u32>,
    #[serde(default)]
    pub max_age: Option<u32>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_size: None,
            max_backups: None,
            max_age: None,
        }
    }
}

/// Initialize the global tracing subscriber. Returns the appender guard that
/// must stay alive for the process lifetime when logging to a file.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match &config.file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log file path has no file name"))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
            Ok(None)
        }
    }
}
