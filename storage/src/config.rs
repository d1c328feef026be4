use crate::crypto::{DEFAULT_KDF_ITERATIONS, MIN_KDF_ITERATIONS};
use crate::{Result, StorageError};
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix for environment overrides, e.g. `SEALDB_SYNC_WRITES=true`.
pub const ENV_PREFIX: &str = "SEALDB";

/// Session tuning knobs.
///
/// `sync_writes` is off by default: mutations then reach the OS page cache
/// but are not forced to stable storage. Turning it on adds a `sync_data`
/// after every page write, WAL append and metadata rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// PBKDF2 rounds for the passphrase key.
    pub kdf_iterations: u32,
    pub sync_writes: bool,
    /// Take an exclusive lock on the database for the session.
    pub lock: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            sync_writes: false,
            lock: true,
        }
    }
}

impl DbConfig {
    /// Defaults, overlaid by the optional config file, overlaid by
    /// `SEALDB_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let config: DbConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(StorageError::InvalidConfig(format!(
                "kdf_iterations must be at least {}, got {}",
                MIN_KDF_ITERATIONS, self.kdf_iterations
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.kdf_iterations, 200_000);
        assert!(!config.sync_writes);
        assert!(config.lock);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sealdb.toml");
        std::fs::write(&path, "kdf_iterations = 250000\nsync_writes = true\n").unwrap();

        let config = DbConfig::load(Some(&path)).unwrap();
        assert_eq!(config.kdf_iterations, 250_000);
        assert!(config.sync_writes);
        assert!(config.lock);
    }

    #[test]
    fn test_weak_kdf_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sealdb.toml");
        std::fs::write(&path, "kdf_iterations = 1000\n").unwrap();

        assert!(matches!(
            DbConfig::load(Some(&path)),
            Err(StorageError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            DbConfig::load(Some(&path)),
            Err(StorageError::Config(_))
        ));
    }
}
