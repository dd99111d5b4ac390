#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use clap::{Parser, Subcommand};
use eyre::Context as _;
use secrecy::ExposeSecret as _;
use std::process::ExitCode;
use tracing_subscriber::prelude::*;
use walletvault::{
    config::{AppConfig, ConfigStore, RecordsBackend},
    errors::{UserError, VaultError, WalletError},
    paths::VaultPaths,
    records::{JsonRecordStore, MemoryRecordStore, SqlRecordStore, WalletRecordStore},
    service::WalletService,
    vault::SecretVault,
};

mod cli_output;

#[derive(Parser, Debug)]
#[command(name = "walletvault", version)]
/// Encrypted wallet key vault.
///
/// Secrets (password, private key, mnemonic) are prompted without echo on a
/// terminal. When stdin is piped, each secret is one line, in this order:
/// password (unless `WALLETVAULT_PASSWORD` is set), then the key or phrase.
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new encrypted vault.
    Init,

    /// Verify the vault password without changing anything.
    CheckPassword,

    /// Re-encrypt the vault under a new password.
    ChangePassword,

    /// Import a wallet from a hex private key.
    ImportKey { alias: String },

    /// Import a wallet from a BIP-39 mnemonic.
    ImportMnemonic {
        alias: String,
        /// Derivation path (defaults to `wallets.default_derivation_path`).
        #[arg(long)]
        path: Option<String>,
    },

    /// Generate a new mnemonic wallet. Secrets are shown once.
    Generate { alias: String },

    /// List wallets.
    List {
        #[arg(long, default_value_t = 1)]
        page: u64,
        /// Defaults to `wallets.page_size`.
        #[arg(long)]
        page_size: Option<u64>,
        /// Look up native balances (requires `balance.rpc_url`).
        #[arg(long, default_value_t = false)]
        balances: bool,
    },

    /// Show one wallet.
    Show {
        alias: String,
        #[arg(long, default_value_t = false)]
        balance: bool,
    },

    /// Rename a wallet.
    Rename { alias: String, new_alias: String },

    /// Replace a wallet's private key. A mnemonic wallet becomes key-imported.
    ReplaceKey { alias: String },

    /// Print a wallet's private key (or mnemonic) to stdout.
    Export {
        alias: String,
        #[arg(long, default_value_t = false)]
        mnemonic: bool,
    },

    /// Delete a wallet and its secrets.
    Delete {
        alias: String,
        /// Skip the confirmation prompt (required for non-interactive shells).
        #[arg(long, default_value_t = false)]
        yes: bool,
    },

    /// Print resolved paths.
    Paths,
}

fn init_logging(paths: &VaultPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("walletvault.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

/// Print the structured form of a failure and pick the exit code.
fn report_failure(err: &eyre::Report) -> eyre::Result<ExitCode> {
    let user = if let Some(w) = err.downcast_ref::<WalletError>() {
        serde_json::to_value(UserError::from(w))
    } else if let Some(v) = err.downcast_ref::<VaultError>() {
        serde_json::to_value(UserError::from(v))
    } else {
        Ok(serde_json::json!({ "code": "error", "message": format!("{err:#}") }))
    }
    .context("serialize error")?;
    cli_output::print_json(&serde_json::json!({ "error": user }))?;
    Ok(ExitCode::FAILURE)
}

fn open_vault(cfg: &AppConfig, paths: &VaultPaths) -> SecretVault {
    SecretVault::file_backed(cfg.vault_path(paths))
}

fn unlock(vault: &SecretVault) -> eyre::Result<()> {
    let pw = cli_output::read_password("Vault password: ")?;
    vault.unlock(&pw)?;
    if let Err(e) = vault.test_password(&pw) {
        vault.close()?;
        return Err(e.into());
    }
    Ok(())
}

async fn wallet_command<R: WalletRecordStore>(
    records: &R,
    vault: &SecretVault,
    cfg: &AppConfig,
    cmd: Command,
) -> eyre::Result<()> {
    let svc = WalletService::new(records, vault).with_options(cfg.service_options());
    match cmd {
        Command::ImportKey { alias } => {
            let key = cli_output::read_secret("Private key: ")?;
            let w = svc.import_private_key(&alias, key.expose_secret()).await?;
            cli_output::print_json(&w)
        }
        Command::ImportMnemonic { alias, path } => {
            let phrase = cli_output::read_secret("Mnemonic: ")?;
            let w = svc
                .import_mnemonic(&alias, phrase.expose_secret(), path.as_deref())
                .await?;
            cli_output::print_json(&w)
        }
        Command::Generate { alias } => {
            let g = svc.generate(&alias).await?;
            cli_output::print_generated_warning();
            cli_output::print_json(&serde_json::json!({
                "wallet": g.record,
                "mnemonic": g.mnemonic.expose_secret(),
                "private_key": g.private_key.expose_secret(),
            }))
        }
        Command::List {
            page,
            page_size,
            balances,
        } => {
            let size = page_size.unwrap_or(cfg.wallets.page_size);
            if balances {
                let lookup = cfg.balance_lookup();
                cli_output::print_json(&svc.list_wallets_with_balances(page, size, &lookup).await?)
            } else {
                cli_output::print_json(&svc.list_wallets(page, size).await?)
            }
        }
        Command::Show { alias, balance } => {
            let w = svc.get_wallet_by_alias(&alias).await?;
            if balance {
                let lookup = cfg.balance_lookup();
                cli_output::print_json(&svc.get_wallet_with_balance(w.id, &lookup).await?)
            } else {
                cli_output::print_json(&w)
            }
        }
        Command::Rename { alias, new_alias } => {
            let w = svc.get_wallet_by_alias(&alias).await?;
            cli_output::print_json(&svc.update_alias(w.id, &new_alias).await?)
        }
        Command::ReplaceKey { alias } => {
            let w = svc.get_wallet_by_alias(&alias).await?;
            let key = cli_output::read_secret("New private key: ")?;
            let updated = svc.update_private_key(w.id, key.expose_secret()).await?;
            cli_output::print_json(&updated)
        }
        Command::Export { alias, mnemonic } => {
            let w = svc.get_wallet_by_alias(&alias).await?;
            let out = if mnemonic {
                serde_json::json!({ "alias": w.alias, "mnemonic": svc.get_mnemonic(w.id).await?.expose_secret() })
            } else {
                serde_json::json!({ "alias": w.alias, "private_key": svc.get_private_key(w.id).await?.expose_secret() })
            };
            cli_output::print_json(&out)
        }
        Command::Delete { alias, yes } => {
            let w = svc.get_wallet_by_alias(&alias).await?;
            cli_output::confirm_or_bail(&format!("delete wallet '{}' ({})", w.alias, w.address), yes)?;
            svc.delete_wallet(w.id).await?;
            cli_output::print_json(&serde_json::json!({ "deleted": w }))
        }
        Command::Init
        | Command::CheckPassword
        | Command::ChangePassword
        | Command::Paths => eyre::bail!("not a wallet command"),
    }
}

async fn with_records(
    cfg: &AppConfig,
    paths: &VaultPaths,
    vault: &SecretVault,
    cmd: Command,
) -> eyre::Result<()> {
    let path = cfg.records_path(paths);
    match cfg.records.backend {
        RecordsBackend::Sqlite => {
            let store = SqlRecordStore::open(&path).await?;
            wallet_command(&store, vault, cfg, cmd).await
        }
        RecordsBackend::Json => {
            let store = JsonRecordStore::open(path)?;
            wallet_command(&store, vault, cfg, cmd).await
        }
        RecordsBackend::Memory => {
            tracing::warn!("memory record store: wallets are not kept after this command");
            cli_output::print_notice(
                "walletvault: records.backend = \"memory\" keeps no wallets between runs",
            );
            let store = MemoryRecordStore::new();
            wallet_command(&store, vault, cfg, cmd).await
        }
    }
}

async fn run(cmd: Command, paths: &VaultPaths) -> eyre::Result<()> {
    let cfg = ConfigStore::new(paths).load_or_init_default()?;
    let vault = open_vault(&cfg, paths);
    match cmd {
        Command::Paths => cli_output::print_json(&serde_json::json!({
            "config_dir": paths.config_dir,
            "data_dir": paths.data_dir,
            "log_file": paths.log_file,
            "config_file": paths.config_file(),
            "vault_file": cfg.vault_path(paths),
            "records": cfg.records_path(paths),
        })),
        Command::Init => {
            let pw = match std::env::var(cli_output::PASSWORD_ENV) {
                Ok(pw) => secrecy::SecretString::new(pw.into()),
                Err(_) => cli_output::read_new_password()?,
            };
            vault.create(&pw)?;
            vault.close()?;
            cli_output::print_notice("walletvault: vault created");
            cli_output::print_json(&serde_json::json!({ "vault": cfg.vault_path(paths), "created": true }))
        }
        Command::CheckPassword => {
            let pw = cli_output::read_password("Vault password: ")?;
            vault.test_password(&pw)?;
            cli_output::print_json(&serde_json::json!({ "ok": true }))
        }
        Command::ChangePassword => {
            let old = cli_output::read_password("Current vault password: ")?;
            let new = cli_output::read_new_password()?;
            vault.change_password(&old, &new)?;
            vault.close()?;
            cli_output::print_json(&serde_json::json!({ "changed": true }))
        }
        wallet_cmd @ (Command::ImportKey { .. }
        | Command::ImportMnemonic { .. }
        | Command::Generate { .. }
        | Command::List { .. }
        | Command::Show { .. }
        | Command::Rename { .. }
        | Command::ReplaceKey { .. }
        | Command::Export { .. }
        | Command::Delete { .. }) => {
            unlock(&vault)?;
            let out = with_records(&cfg, paths, &vault, wallet_cmd).await;
            let closed = vault.close();
            out?;
            closed?;
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = VaultPaths::discover()?;
    paths.ensure_private_dirs()?;
    let _log_guard = init_logging(&paths);

    match run(cli.cmd, &paths).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            tracing::debug!(error = %format!("{e:#}"), "command failed");
            report_failure(&e)
        }
    }
}
