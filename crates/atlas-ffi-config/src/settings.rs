//! FFI settings (atlas-ffi.toml / ~/.atlas/ffi.toml)
//!
//! Every section and field is optional; absent values fall back to the
//! bridge defaults.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the project-level configuration file
pub const PROJECT_CONFIG_FILE: &str = "atlas-ffi.toml";

/// Name of the global configuration file inside ~/.atlas
pub const GLOBAL_CONFIG_FILE: &str = "ffi.toml";

/// Complete FFI configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct FfiConfig {
    /// Stable-address arena settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arena: Option<ArenaSection>,

    /// Symbol resolver settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver: Option<ResolverSection>,

    /// Logging settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingSection>,
}

/// `[arena]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ArenaSection {
    /// Upper bound on the bytes held by live allocations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_live_bytes: Option<usize>,
}

/// `[resolver]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ResolverSection {
    /// Extra directories searched when loading libraries (highest priority first)
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,

    /// Libraries loaded when the bridge is created
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preload: Vec<String>,

    /// Cache resolved symbol addresses (default: true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_symbols: Option<bool>,
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    /// Minimum level: "trace", "debug", "info", "warn" or "error"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Extra filter directives, e.g. "atlas_ffi=trace"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Output format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<LogFormat>,

    /// Where bridge events are recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<EventSink>,
}

/// Log line format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Event log backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventSink {
    #[default]
    Memory,
    Null,
}

impl FfiConfig {
    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config = Self::parse(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without validating it
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Validate field values
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(arena) = &self.arena {
            if arena.max_live_bytes == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "arena.max_live_bytes".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if let Some(logging) = &self.logging {
            if let Some(level) = &logging.level {
                validate_level("logging.level", level)?;
            }
        }

        if let Some(resolver) = &self.resolver {
            if let Some(empty) = resolver.preload.iter().find(|name| name.trim().is_empty()) {
                return Err(ConfigError::InvalidValue {
                    field: "resolver.preload".to_string(),
                    reason: format!("library name must not be blank, got '{}'", empty),
                });
            }
        }

        Ok(())
    }

    /// Merge another config into this one
    ///
    /// Scalar fields from `other` win when set; path and preload lists are
    /// prepended so the more specific source is searched first.
    pub fn merge(&mut self, other: &FfiConfig) {
        if let Some(arena) = &other.arena {
            let target = self.arena.get_or_insert_with(Default::default);
            if arena.max_live_bytes.is_some() {
                target.max_live_bytes = arena.max_live_bytes;
            }
        }

        if let Some(resolver) = &other.resolver {
            let target = self.resolver.get_or_insert_with(Default::default);
            let mut paths = resolver.search_paths.clone();
            paths.extend(target.search_paths.drain(..));
            target.search_paths = paths;

            for lib in &resolver.preload {
                if !target.preload.contains(lib) {
                    target.preload.push(lib.clone());
                }
            }
            if resolver.cache_symbols.is_some() {
                target.cache_symbols = resolver.cache_symbols;
            }
        }

        if let Some(logging) = &other.logging {
            let target = self.logging.get_or_insert_with(Default::default);
            if logging.level.is_some() {
                target.level = logging.level.clone();
            }
            if logging.filter.is_some() {
                target.filter = logging.filter.clone();
            }
            if logging.format.is_some() {
                target.format = logging.format;
            }
            if logging.events.is_some() {
                target.events = logging.events;
            }
        }
    }

    /// Effective live-bytes budget, if any
    pub fn max_live_bytes(&self) -> Option<usize> {
        self.arena.as_ref().and_then(|a| a.max_live_bytes)
    }

    /// Extra library search paths
    pub fn search_paths(&self) -> &[PathBuf] {
        self.resolver
            .as_ref()
            .map(|r| r.search_paths.as_slice())
            .unwrap_or(&[])
    }

    /// Libraries to load eagerly
    pub fn preload(&self) -> &[String] {
        self.resolver
            .as_ref()
            .map(|r| r.preload.as_slice())
            .unwrap_or(&[])
    }

    /// Whether resolved symbols are cached (default: true)
    pub fn cache_symbols(&self) -> bool {
        self.resolver
            .as_ref()
            .and_then(|r| r.cache_symbols)
            .unwrap_or(true)
    }

    /// Effective log level (default: "info")
    pub fn log_level(&self) -> &str {
        self.logging
            .as_ref()
            .and_then(|l| l.level.as_deref())
            .unwrap_or("info")
    }

    /// Effective log format
    pub fn log_format(&self) -> LogFormat {
        self.logging
            .as_ref()
            .and_then(|l| l.format)
            .unwrap_or_default()
    }

    /// Effective event sink
    pub fn event_sink(&self) -> EventSink {
        self.logging
            .as_ref()
            .and_then(|l| l.events)
            .unwrap_or_default()
    }
}

/// Validate a log level name
pub(crate) fn validate_level(field: &str, value: &str) -> ConfigResult<()> {
    if !matches!(
        value.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!(
                "must be one of trace, debug, info, warn, error; got '{}'",
                value
            ),
        });
    }
    Ok(())
}
