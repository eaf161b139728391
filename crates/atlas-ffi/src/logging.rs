//! Logging setup for hosts embedding the bridge
//!
//! The bridge itself only emits `tracing` events; nothing is printed unless a
//! subscriber is installed. `init_logging` installs a `tracing-subscriber` fmt
//! subscriber from configuration, and does nothing if one is already set.

use crate::error::{FfiError, FfiResult};
use atlas_ffi_config::{FfiConfig, LogFormat};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Subscriber settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Extra filter directives, e.g. "atlas_ffi::arena=trace"
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            filter: None,
        }
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings from the `[logging]` section
    pub fn from_config(config: &FfiConfig) -> FfiResult<Self> {
        let level = config
            .log_level()
            .parse::<Level>()
            .map_err(|e| FfiError::Logging(e.to_string()))?;
        Ok(Self {
            level,
            format: config.log_format(),
            filter: config.logging.as_ref().and_then(|l| l.filter.clone()),
        })
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Filter combining the level with any extra directives
    pub fn build_filter(&self) -> FfiResult<EnvFilter> {
        let mut directives = self.level.to_string().to_ascii_lowercase();
        if let Some(extra) = self.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            directives.push(',');
            directives.push_str(extra);
        }
        EnvFilter::try_new(&directives).map_err(|e| FfiError::Logging(e.to_string()))
    }
}

/// Install the global subscriber
///
/// Returns `Ok(false)` when a subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> FfiResult<bool> {
    let filter = config.build_filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    };
    Ok(installed)
}
