use crate::{
    balance::RpcBalanceLookup,
    keys::{self, DEFAULT_DERIVATION_PATH},
    paths::VaultPaths,
    service::ServiceOptions,
};
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_BALANCE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_PAGE_SIZE: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordsBackend {
    #[default]
    Sqlite,
    Json,
    Memory,
}

impl RecordsBackend {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sql" | "turso" => Some(Self::Sqlite),
            "json" => Some(Self::Json),
            "memory" | "mem" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Overrides `<data_dir>/vault.json`.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsConfig {
    pub backend: RecordsBackend,
    /// Overrides `<data_dir>/wallets.db` (sqlite) or `<data_dir>/wallets.json` (json).
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    /// JSON-RPC endpoint for `eth_getBalance`. Balances are skipped when unset.
    pub rpc_url: Option<String>,
    pub fallback_rpc_urls: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            fallback_rpc_urls: vec![],
            timeout_ms: DEFAULT_BALANCE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletsConfig {
    pub default_derivation_path: String,
    /// 12 or 24.
    pub generated_words: usize,
    pub page_size: u64,
}

impl Default for WalletsConfig {
    fn default() -> Self {
        Self {
            default_derivation_path: DEFAULT_DERIVATION_PATH.to_owned(),
            generated_words: 12,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub vault: VaultConfig,
    pub records: RecordsConfig,
    pub balance: BalanceConfig,
    pub wallets: WalletsConfig,
}

impl AppConfig {
    pub fn validate(&self) -> eyre::Result<()> {
        keys::validate_derivation_path(&self.wallets.default_derivation_path)
            .context("wallets.default_derivation_path")?;
        if !matches!(self.wallets.generated_words, 12 | 24) {
            eyre::bail!(
                "wallets.generated_words must be 12 or 24, got {}",
                self.wallets.generated_words
            );
        }
        if self.balance.timeout_ms == 0 {
            eyre::bail!("balance.timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn vault_path(&self, paths: &VaultPaths) -> PathBuf {
        self.vault.file.clone().unwrap_or_else(|| paths.vault_file())
    }

    pub fn records_path(&self, paths: &VaultPaths) -> PathBuf {
        match (&self.records.path, self.records.backend) {
            (Some(p), _) => p.clone(),
            (None, RecordsBackend::Json) => paths.records_index(),
            (None, RecordsBackend::Sqlite | RecordsBackend::Memory) => paths.records_db(),
        }
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            default_derivation_path: self.wallets.default_derivation_path.clone(),
            generated_words: self.wallets.generated_words,
            balance_timeout: Duration::from_millis(self.balance.timeout_ms),
        }
    }

    pub fn balance_lookup(&self) -> RpcBalanceLookup {
        RpcBalanceLookup::new(self.balance.rpc_url.as_deref(), &self.balance.fallback_rpc_urls)
    }
}

/// Apply `WALLETVAULT_*` overrides; `lookup` is `std::env::var` outside tests.
fn apply_env_overrides(cfg: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    let get = |var: &str| {
        lookup(var)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    };

    if let Some(v) = get("WALLETVAULT_RPC_URL") {
        cfg.balance.rpc_url = Some(v);
    }
    if let Some(v) = get("WALLETVAULT_BALANCE_TIMEOUT_MS") {
        match v.parse::<u64>() {
            Ok(n) if n > 0 => cfg.balance.timeout_ms = n,
            Ok(_) | Err(_) => tracing::warn!(value = %v, "ignoring WALLETVAULT_BALANCE_TIMEOUT_MS"),
        }
    }
    if let Some(v) = get("WALLETVAULT_RECORDS_BACKEND") {
        match RecordsBackend::parse(&v) {
            Some(b) => cfg.records.backend = b,
            None => tracing::warn!(value = %v, "ignoring WALLETVAULT_RECORDS_BACKEND"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(paths: &VaultPaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read `config.toml`, writing the defaults on first run, then apply env overrides.
    ///
    /// Overrides are never written back.
    pub fn load_or_init_default(&self) -> eyre::Result<AppConfig> {
        self.load_with(|k| std::env::var(k).ok())
    }

    fn load_with(&self, lookup: impl Fn(&str) -> Option<String>) -> eyre::Result<AppConfig> {
        let mut cfg = if self.path.exists() {
            let s = fs::read_to_string(&self.path).context("read config.toml")?;
            toml::from_str(&s).context("parse config.toml")?
        } else {
            let cfg = AppConfig::default();
            self.save(&cfg)?;
            cfg
        };
        apply_env_overrides(&mut cfg, lookup);
        cfg.validate().context("invalid config.toml")?;
        Ok(cfg)
    }

    pub fn save(&self, cfg: &AppConfig) -> eyre::Result<()> {
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        crate::fsutil::write_string_atomic_restrictive(
            &self.path,
            &s,
            crate::fsutil::MODE_FILE_PRIVATE,
        )
        .context("write config.toml")?;
        Ok(())
    }
}
