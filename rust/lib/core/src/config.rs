use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::DomainError;

/// Engine configuration shared by the binaries.
///
/// Built from a TOML file, command-line flags, or both (flags win).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base directory; relative defaults below resolve against it.
    pub data_dir: Option<PathBuf>,

    /// Path to the redb database file.
    /// Defaults to `{data_dir}/domobj.redb` if not specified.
    pub db_path: Option<PathBuf>,

    /// Mapping file or directory.
    /// Defaults to `{data_dir}/mapping` if not specified.
    pub mapping_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Parse configuration from command-line arguments.
    ///
    /// Supported flags:
    /// - `--data-dir=PATH`
    /// - `--db=PATH`
    /// - `--mapping=PATH`
    pub fn from_args(args: &[String]) -> Self {
        let mut config = EngineConfig::default();
        config.apply_args(args);
        config
    }

    /// Override fields with the flags present in `args`.
    pub fn apply_args(&mut self, args: &[String]) {
        for arg in args {
            if let Some(val) = arg.strip_prefix("--data-dir=") {
                self.data_dir = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--db=") {
                self.db_path = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--mapping=") {
                self.mapping_path = Some(PathBuf::from(val));
            }
        }
    }

    /// Load a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, DomainError> {
        let content = fs::read_to_string(path)
            .map_err(|e| DomainError::Argument(format!("cannot read config {:?}: {}", path, e)))?;
        toml::from_str(&content)
            .map_err(|e| DomainError::Argument(format!("invalid config {:?}: {}", path, e)))
    }

    /// Resolve the redb database path, falling back to `{data_dir}/domobj.redb`.
    pub fn resolve_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.resolve_data_subpath("domobj.redb"))
    }

    /// Resolve the mapping path, falling back to `{data_dir}/mapping`.
    pub fn resolve_mapping_path(&self) -> PathBuf {
        self.mapping_path
            .clone()
            .unwrap_or_else(|| self.resolve_data_subpath("mapping"))
    }

    fn resolve_data_subpath(&self, name: &str) -> PathBuf {
        self.data_dir
            .as_ref()
            .map(|d| d.join(name))
            .unwrap_or_else(|| PathBuf::from(name))
    }
}
