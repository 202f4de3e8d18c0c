//! Node settings persistence via TOML.
//!
//! Settings are stored at `<config_dir>/dfs/settings.toml`.
//! Missing or corrupted config files return sensible defaults.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use data_encoding::HEXLOWER;
use dfs_store::crypto::{new_encryption_key, KEY_LEN};
use dfs_store::PathTransform;
use serde::{Deserialize, Serialize};

const SETTINGS_FILE: &str = "settings.toml";

/// Per-node settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Owner id this node stores its own objects under.
    pub id: String,
    /// Address the transport binds and advertises.
    pub listen_addr: String,
    /// Root directory of the local object store.
    pub storage_root: PathBuf,
    /// Key-to-path mapping used by the object store.
    pub path_transform: PathTransform,
    /// TOML file shared by every node as the peer registry.
    pub registry_path: PathBuf,
    /// Hex-encoded 32-byte key for objects pushed to peers.
    pub encryption_key: String,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("", "", "dfs")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("dfs-data"));

        Self {
            id: HEXLOWER.encode(&rand::random::<[u8; 32]>()),
            listen_addr: "127.0.0.1:3000".to_string(),
            storage_root: data_dir.join("store"),
            path_transform: PathTransform::Cas,
            registry_path: data_dir.join("registry.toml"),
            encryption_key: HEXLOWER.encode(&new_encryption_key()),
        }
    }
}

impl Settings {
    /// Load settings from the default config path.
    ///
    /// Returns defaults if the file doesn't exist or is corrupted.
    pub fn load() -> Self {
        Self::load_from_dir(Self::config_dir())
    }

    /// Save settings to the default config path.
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(Self::config_dir())
    }

    /// Load settings from a specific config directory.
    pub fn load_from_dir(config_dir: PathBuf) -> Self {
        let path = config_dir.join(SETTINGS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(settings) => {
                    tracing::info!(path = %path.display(), "settings loaded");
                    settings
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "corrupted settings file, using defaults"
                    );
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    path = %path.display(),
                    "settings file not found, using defaults"
                );
                Self::default()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to read settings file, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Load settings, writing the defaults out on first use so the generated
    /// id and encryption key survive restarts.
    pub fn load_or_init(config_dir: PathBuf) -> Result<Self> {
        let exists = Self::file_in(&config_dir).exists();
        let settings = Self::load_from_dir(config_dir.clone());
        if !exists {
            settings.save_to_dir(config_dir)?;
        }
        Ok(settings)
    }

    /// Save settings to a specific config directory.
    pub fn save_to_dir(&self, config_dir: PathBuf) -> Result<()> {
        std::fs::create_dir_all(&config_dir).with_context(|| {
            format!(
                "failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let path = Self::file_in(&config_dir);
        let contents = toml::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(&path, &contents)
            .with_context(|| format!("failed to write settings file: {}", path.display()))?;

        tracing::info!(path = %path.display(), "settings saved");
        Ok(())
    }

    /// Decode and validate the encryption key.
    pub fn encryption_key_bytes(&self) -> Result<Vec<u8>> {
        let key = HEXLOWER
            .decode(self.encryption_key.as_bytes())
            .context("encryption key is not lowercase hex")?;
        if key.len() != KEY_LEN {
            bail!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                key.len()
            );
        }
        Ok(key)
    }

    /// Get the default config directory.
    pub fn config_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "dfs")
            .map(|d| d.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("dfs-config"))
    }

    fn file_in(config_dir: &Path) -> PathBuf {
        config_dir.join(SETTINGS_FILE)
    }
}
