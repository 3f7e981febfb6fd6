use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for vmmgr.
///
/// Every field has a default, so running without a config file works.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub hypervisor: HypervisorConfig,
    pub storage: StorageConfig,
    pub menu: MenuConfig,
}

impl Config {
    /// Load configuration from an explicit path, or from the first
    /// `vmmgr/config.toml` under the user's config directory. A missing
    /// file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::locate(),
        };

        let config = match path {
            Some(ref p) if p.is_file() => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config: {}", p.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("parsing config: {}", p.display()))?
            }
            _ => Config::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Default config file location under the XDG config directory.
    pub fn locate() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vmmgr").join("config.toml"))
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.hypervisor.connect_uri.is_empty(),
            "hypervisor.connect_uri must not be empty"
        );
        anyhow::ensure!(
            !self.hypervisor.virsh_binary.is_empty(),
            "hypervisor.virsh_binary must not be empty"
        );
        anyhow::ensure!(
            !self.storage.qemu_img_binary.is_empty(),
            "storage.qemu_img_binary must not be empty"
        );
        anyhow::ensure!(
            !self.menu.fzf_binary.is_empty(),
            "menu.fzf_binary must not be empty"
        );
        Ok(())
    }
}

/// Hypervisor connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Libvirt connection URI.
    pub connect_uri: String,
    /// Path to the virsh binary.
    pub virsh_binary: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            connect_uri: "qemu:///system".into(),
            virsh_binary: "virsh".into(),
        }
    }
}

/// Disk image tooling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the qemu-img binary.
    pub qemu_img_binary: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            qemu_img_binary: "qemu-img".into(),
        }
    }
}

/// Interactive menu settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MenuConfig {
    /// Path to the fzf binary used for all pickers.
    pub fzf_binary: String,
    /// Send desktop notifications after lifecycle and clone actions.
    pub notifications: bool,
}

impl Default for MenuConfig {
    fn default() -> Self {
        Self {
            fzf_binary: "fzf".into(),
            notifications: true,
        }
    }
}
