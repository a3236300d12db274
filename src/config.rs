//! Configuration management for cipherfs

use crate::crypto::{CIPHER_BLOCK, DEFAULT_STREAM_BLOCK};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default upper bound for resolved backing paths
pub const DEFAULT_MAX_PATH_LEN: usize = 4096;

/// Default permission bits of staging (plaintext) files
pub const DEFAULT_STAGING_MODE: u32 = 0o600;

/// Main configuration structure
///
/// Built once at startup and handed to the core; nothing reads mount state
/// from a global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Mount configuration
    pub mount: MountConfig,

    /// Cipher and key configuration
    pub crypto: CryptoConfig,

    /// Staging file configuration
    pub staging: StagingConfig,

    /// Longest resolved path accepted, in bytes
    pub max_path_len: usize,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Directory holding the ciphertext tree
    pub backing_dir: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Allow root to access the mount
    pub allow_root: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// Extra `-o` options passed through to FUSE
    #[serde(default)]
    pub fuse_options: Vec<String>,
}

/// Cipher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Bytes read per streaming step
    pub block_size: usize,

    /// Where the passphrase comes from
    pub key: KeySource,
}

/// Staging file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Permission bits for newly created staging files
    pub file_mode: u32,
}

/// Source of the encryption passphrase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySource {
    /// Ask on the terminal at mount time
    Prompt,
    /// Read from an environment variable
    Env { var: String },
    /// Read from a file
    File {
        path: PathBuf,
        #[serde(default)]
        encoding: KeyEncoding,
    },
    /// Fixed passphrase in the configuration (testing only)
    Static { passphrase: String },
}

/// Encoding of a key file
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyEncoding {
    #[default]
    Raw,
    Hex,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mount: MountConfig::default(),
            crypto: CryptoConfig::default(),
            staging: StagingConfig::default(),
            max_path_len: DEFAULT_MAX_PATH_LEN,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/cipherfs"),
            backing_dir: PathBuf::new(),
            allow_other: false,
            allow_root: false,
            auto_unmount: true,
            fuse_options: Vec::new(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        CryptoConfig {
            block_size: DEFAULT_STREAM_BLOCK,
            key: KeySource::Prompt,
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        StagingConfig {
            file_mode: DEFAULT_STAGING_MODE,
        }
    }
}

impl Config {
    /// Configuration for a backing directory with every other field defaulted
    pub fn for_backing_dir(backing_dir: impl Into<PathBuf>) -> Self {
        let mut config = Config::default();
        config.mount.backing_dir = backing_dir.into();
        config
    }

    /// Read a configuration file as-is, without overrides or validation
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::read(path)?;
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CIPHERFS_BACKING_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.mount.backing_dir = PathBuf::from(dir);
            }
        }

        if let Ok(var) = std::env::var("CIPHERFS_KEY_ENV") {
            let var = var.trim().to_string();
            if !var.is_empty() {
                self.crypto.key = KeySource::Env { var };
            }
        }

        if let Ok(path) = std::env::var("CIPHERFS_KEY_FILE") {
            let path = path.trim();
            if !path.is_empty() {
                self.crypto.key = KeySource::File {
                    path: PathBuf::from(path),
                    encoding: KeyEncoding::Raw,
                };
            }
        }

        if let Ok(block_size) = std::env::var("CIPHERFS_BLOCK_SIZE") {
            if let Ok(size) = block_size.trim().parse::<usize>() {
                self.crypto.block_size = size;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mount.backing_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Backing directory is required".to_string(),
            ));
        }

        if !self.mount.backing_dir.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "Backing directory {:?} is not a directory",
                self.mount.backing_dir
            )));
        }

        if self.crypto.block_size == 0 || self.crypto.block_size % CIPHER_BLOCK != 0 {
            return Err(Error::InvalidConfig(format!(
                "Block size must be a non-zero multiple of {}",
                CIPHER_BLOCK
            )));
        }

        if self.max_path_len == 0 {
            return Err(Error::InvalidConfig(
                "Maximum path length must be greater than 0".to_string(),
            ));
        }

        if self.staging.file_mode & !0o7777 != 0 {
            return Err(Error::InvalidConfig(format!(
                "Staging file mode {:o} has bits outside 0o7777",
                self.staging.file_mode
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
        let config = Config::default();
        assert_eq!(config.crypto.block_size, 1024);
        assert_eq!(config.max_path_len, 4096);
        assert_eq!(config.staging.file_mode, 0o600);
        assert_eq!(config.crypto.key, KeySource::Prompt);
    }

    #[test]
    fn test_validate() {
        let dir = tempdir().unwrap();

        let config = Config::for_backing_dir(dir.path());
        assert!(config.validate().is_ok());

        assert!(Config::default().validate().is_err());

        let mut bad_block = Config::for_backing_dir(dir.path());
        bad_block.crypto.block_size = 1000;
        assert!(matches!(bad_block.validate(), Err(Error::InvalidConfig(_))));

        let mut missing = Config::for_backing_dir(dir.path().join("missing"));
        missing.max_path_len = 10;
        assert!(missing.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::for_backing_dir(dir.path());
        config.crypto.key = KeySource::File {
            path: dir.path().join("key"),
            encoding: KeyEncoding::Hex,
        };
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.mount.backing_dir, dir.path());
        assert_eq!(loaded.crypto.key, config.crypto.key);
    }

    #[test]
    fn test_key_source_json() {
        let source: KeySource =
            serde_json::from_str(r#"{"type":"env","var":"MY_KEY"}"#).unwrap();
        assert_eq!(source, KeySource::Env { var: "MY_KEY".to_string() });

        let file: KeySource =
            serde_json::from_str(r#"{"type":"file","path":"/etc/key"}"#).unwrap();
        assert_eq!(
            file,
            KeySource::File {
                path: PathBuf::from("/etc/key"),
                encoding: KeyEncoding::Raw,
            }
        );
    }
}
