//! Storage configuration.
//!
//! Provides configurable parameters for the region file pool, payload
//! compression, and flush behavior. Configuration can be loaded from
//! and saved to a file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::codec::{custom_codec_registered, Codec};
use crate::region_storage::DEFAULT_POOL_CAPACITY;

/// Configuration file name.
const CONFIG_FILE: &str = "storage.toml";

/// Storage configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // === File Pool ===
    /// Maximum number of simultaneously open region files per root
    pub pool_capacity: usize,

    // === Payloads ===
    /// Codec applied to newly written chunk records
    /// (gzip / zlib / none / lz4, or a registered custom codec name)
    pub default_codec: String,

    // === Flushing ===
    /// Force an OS-level file sync when a synchronize drains
    pub fsync_on_synchronize: bool,
    /// Dirty section columns written back per storage tick
    pub section_flush_budget: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            default_codec: "zlib".to_string(),
            fsync_on_synchronize: true,
            section_flush_budget: 8,
        }
    }
}

impl StorageConfig {
    /// Load configuration from the default file location.
    /// Returns default config if file doesn't exist.
    pub fn load() -> Self {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from a specific path.
    /// Returns default config if file doesn't exist or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found, using defaults");
            return Self::default();
        }

        match fs::File::open(path) {
            Ok(mut file) => {
                let mut contents = String::new();
                if let Err(e) = file.read_to_string(&mut contents) {
                    warn!("Failed to read config file: {e}");
                    return Self::default();
                }

                match toml::from_str(&contents) {
                    Ok(config) => {
                        info!("Loaded config from {}", path.display());
                        config
                    },
                    Err(e) => {
                        warn!("Failed to parse config file: {e}");
                        Self::default()
                    },
                }
            },
            Err(e) => {
                warn!("Failed to open config file: {e}");
                Self::default()
            },
        }
    }

    /// Save configuration to the default file location.
    pub fn save(&self) -> io::Result<()> {
        self.save_to(Self::config_path())
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path.
    fn config_path() -> PathBuf {
        // Try to use standard config directory
        if let Some(config_dir) = dirs_config_path() {
            config_dir.join("strata").join(CONFIG_FILE)
        } else {
            // Fall back to current directory
            PathBuf::from(CONFIG_FILE)
        }
    }

    /// Validate and clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        self.pool_capacity = self.pool_capacity.clamp(1, 4096);
        self.section_flush_budget = self.section_flush_budget.clamp(1, 1024);

        // Unknown codec names would fail every write once the registry
        // lookup misses, so fall back to the stock codec up front.
        if let Codec::Custom(name) = Codec::from_name(&self.default_codec) {
            if !custom_codec_registered(&name) {
                warn!("Unknown codec {name:?} in config, falling back to zlib");
                self.default_codec = "zlib".to_string();
            }
        }
    }

    /// Codec selected by [`Self::default_codec`].
    #[must_use]
    pub fn codec(&self) -> Codec {
        Codec::from_name(&self.default_codec)
    }
}

/// Get platform-specific config directory.
fn dirs_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join("Library/Application Support"))
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        None
    }
}
