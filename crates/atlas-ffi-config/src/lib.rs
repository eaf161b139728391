//! Atlas FFI Configuration
//!
//! Configuration for the native call bridge:
//! - Arena limits (`[arena]`)
//! - Symbol resolution and library preloading (`[resolver]`)
//! - Logging and event recording (`[logging]`)
//!
//! # Sources
//!
//! Each source overrides the ones listed before it:
//! 1. `~/.atlas/ffi.toml`
//! 2. The nearest `atlas-ffi.toml` at or above the starting directory
//! 3. `ATLAS_FFI_*` environment variables
//!
//! # Example
//!
//! ```no_run
//! use atlas_ffi_config::ConfigLoader;
//! use std::path::Path;
//!
//! let loaded = ConfigLoader::new().load_from_directory(Path::new(".")).unwrap();
//! println!("arena limit: {:?}", loaded.config.max_live_bytes());
//! ```

pub mod loader;
pub mod settings;

use std::path::PathBuf;
use thiserror::Error;

/// Failure while reading, parsing, or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("FFI configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Could not read FFI configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed TOML in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Bad value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Cannot locate the home directory")]
    HomeNotFound,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

pub use loader::{ConfigLoader, LoadedConfig};
pub use settings::{
    ArenaSection, EventSink, FfiConfig, LogFormat, LoggingSection, ResolverSection,
};
