use directories::ProjectDirs;
use eyre::{Context as _, ContextCompat as _};
use serde::Serialize;
use std::path::PathBuf;

pub const CONFIG_DIR_ENV: &str = "WALLETVAULT_CONFIG_DIR";
pub const DATA_DIR_ENV: &str = "WALLETVAULT_DATA_DIR";

#[derive(Debug, Clone, Serialize)]
pub struct VaultPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
}

impl VaultPaths {
    pub fn discover() -> eyre::Result<Self> {
        // Both must be set; tests and CI point them at a temp dir.
        if let (Ok(config_dir), Ok(data_dir)) =
            (std::env::var(CONFIG_DIR_ENV), std::env::var(DATA_DIR_ENV))
        {
            return Ok(Self::at(config_dir.into(), data_dir.into()));
        }

        // Linux: ~/.config/walletvault and ~/.local/share/walletvault
        // macOS: ~/Library/Application Support/walletvault
        let proj =
            ProjectDirs::from("", "", "walletvault").context("failed to resolve project dirs")?;
        Ok(Self::at(
            proj.config_dir().to_path_buf(),
            proj.data_dir().to_path_buf(),
        ))
    }

    pub fn at(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        let log_file = data_dir.join("walletvault.log.jsonl");
        Self {
            config_dir,
            data_dir,
            log_file,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn vault_file(&self) -> PathBuf {
        self.data_dir.join("vault.json")
    }

    pub fn records_db(&self) -> PathBuf {
        self.data_dir.join("wallets.db")
    }

    pub fn records_index(&self) -> PathBuf {
        self.data_dir.join("wallets.json")
    }

    pub fn ensure_private_dirs(&self) -> eyre::Result<()> {
        crate::fsutil::ensure_private_dir(&self.config_dir)
            .with_context(|| format!("prepare {}", self.config_dir.display()))?;
        crate::fsutil::ensure_private_dir(&self.data_dir)
            .with_context(|| format!("prepare {}", self.data_dir.display()))?;
        Ok(())
    }
}
