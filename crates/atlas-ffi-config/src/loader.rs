//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::settings::{validate_level, FfiConfig, GLOBAL_CONFIG_FILE, PROJECT_CONFIG_FILE};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Environment variable overriding `arena.max_live_bytes`
pub const ENV_MAX_LIVE_BYTES: &str = "ATLAS_FFI_MAX_LIVE_BYTES";
/// Environment variable prepending library search paths (platform path list)
pub const ENV_LIBRARY_PATH: &str = "ATLAS_FFI_LIBRARY_PATH";
/// Environment variable overriding `logging.level`
pub const ENV_LOG: &str = "ATLAS_FFI_LOG";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.atlas/ffi.toml) - lowest priority
/// 2. Project config (./atlas-ffi.toml) - overrides global
/// 3. Environment variables (ATLAS_FFI_*) - overrides project
pub struct ConfigLoader {
    /// Explicit global config path (defaults to ~/.atlas/ffi.toml)
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Effective configuration after merging every source
    pub config: FfiConfig,

    /// Directory where atlas-ffi.toml was found
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use a specific global config file instead of ~/.atlas/ffi.toml
    pub fn with_global_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.global_config_path = Some(path.into());
        self
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find atlas-ffi.toml, merges it over the
    /// global config, then applies environment overrides.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<LoadedConfig> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;
        self.finish(project_root, project_config)
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<LoadedConfig> {
        let project_config = FfiConfig::load_from_file(config_path)?;
        let project_root = config_path.parent().map(|p| p.to_path_buf());
        self.finish(project_root, project_config)
    }

    fn finish(
        &mut self,
        project_root: Option<PathBuf>,
        project_config: FfiConfig,
    ) -> ConfigResult<LoadedConfig> {
        let mut config = self.load_global_config()?;
        config.merge(&project_config);
        let config = apply_env_overrides(config)?;

        Ok(LoadedConfig {
            config,
            project_root,
        })
    }

    /// Find project configuration by walking up directory tree
    fn find_project_config(&self, start_dir: &Path) -> ConfigResult<(Option<PathBuf>, FfiConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let project_config = FfiConfig::load_from_file(&config_path)?;
                return Ok((Some(current), project_config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, FfiConfig::default())),
            }
        }
    }

    /// Load the global configuration; a missing file or home directory yields defaults
    fn load_global_config(&mut self) -> ConfigResult<FfiConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => match Self::global_config_path() {
                Ok(path) => {
                    self.global_config_path = Some(path.clone());
                    path
                }
                Err(ConfigError::HomeNotFound) => return Ok(FfiConfig::default()),
                Err(e) => return Err(e),
            },
        };

        if !path.exists() {
            return Ok(FfiConfig::default());
        }

        FfiConfig::load_from_file(&path)
    }

    /// Get the global config file path (~/.atlas/ffi.toml)
    pub fn global_config_path() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".atlas").join(GLOBAL_CONFIG_FILE))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply ATLAS_FFI_* environment overrides
fn apply_env_overrides(mut config: FfiConfig) -> ConfigResult<FfiConfig> {
    if let Ok(raw) = env::var(ENV_MAX_LIVE_BYTES) {
        let bytes = raw
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|b| *b > 0)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: ENV_MAX_LIVE_BYTES.to_string(),
                reason: format!("expected a positive byte count, got '{}'", raw),
            })?;
        config.arena.get_or_insert_with(Default::default).max_live_bytes = Some(bytes);
    }

    if let Some(raw) = env::var_os(ENV_LIBRARY_PATH) {
        let resolver = config.resolver.get_or_insert_with(Default::default);
        let mut paths: Vec<PathBuf> = env::split_paths(&raw)
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        paths.append(&mut resolver.search_paths);
        resolver.search_paths = paths;
    }

    if let Ok(level) = env::var(ENV_LOG) {
        validate_level(ENV_LOG, &level)?;
        config.logging.get_or_insert_with(Default::default).level = Some(level);
    }

    Ok(config)
}
