use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

/// Malformed key material. Always raised before any side effect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid private key format ({reason}): got {length} hex characters, expected 64")]
    InvalidFormat { length: usize, reason: &'static str },

    #[error("invalid mnemonic: {word_count} words (expected a valid 12 or 24 word BIP-39 phrase)")]
    InvalidMnemonic { word_count: usize },

    #[error("invalid derivation path {path:?}: {reason}")]
    InvalidDerivationPath { path: String, reason: String },

    #[error("key derivation failed: {0}")]
    Derivation(String),
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("failed to decrypt secret: {0}")]
    DecryptionFailed(String),

    #[error("vault i/o at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("vault already exists at {0}")]
    AlreadyExists(String),

    #[error("password must not be empty")]
    EmptyPassword,

    #[error("incorrect password")]
    IncorrectPassword,

    #[error("vault has not been created")]
    NotInitialized,

    #[error("vault is locked")]
    Locked,

    #[error("vault is in use by another process")]
    Busy,

    #[error("vault file is corrupt: {0}")]
    Corrupt(String),

    #[error("unsupported vault file version: {0}")]
    UnsupportedVersion(u32),

    #[error("vault crypto: {0}")]
    Crypto(String),

    #[error("vault lock poisoned")]
    Poisoned,
}

impl VaultError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a filesystem helper failure, keeping the underlying I/O kind.
    pub(crate) fn fs(path: impl Into<PathBuf>, e: &eyre::Report) -> Self {
        let kind = e
            .root_cause()
            .downcast_ref::<std::io::Error>()
            .map_or(std::io::ErrorKind::Other, std::io::Error::kind);
        Self::io(path, std::io::Error::new(kind, format!("{e:#}")))
    }
}

/// Which unique column a record-store conflict was raised on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueField {
    Alias,
    Address,
}

#[derive(Debug, Error, Clone)]
pub enum RecordStoreError {
    #[error("wallet record not found: {0}")]
    NotFound(String),

    #[error("wallet record conflict on {field:?}: {value}")]
    Conflict { field: UniqueField, value: String },

    #[error("record store: {0}")]
    Backend(String),
}

impl RecordStoreError {
    pub(crate) fn backend(e: &eyre::Report) -> Self {
        Self::Backend(format!("{e:#}"))
    }
}

#[derive(Debug, Error, Clone)]
pub enum BalanceError {
    #[error("balance lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("balance lookup failed: {0}")]
    Transport(String),

    #[error("invalid address for balance lookup: {0}")]
    InvalidAddress(String),

    #[error("no rpc url configured for balance lookup")]
    NotConfigured,
}

/// Coarse classification used by callers to pick user guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    Storage,
    Vault,
    External,
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error(transparent)]
    Validation(#[from] KeyError),

    #[error("invalid alias {0:?}: must be 1-64 characters without surrounding whitespace")]
    InvalidAlias(String),

    #[error("alias already exists: {0}")]
    DuplicateAlias(String),

    #[error("address already exists: {0}")]
    DuplicateAddress(String),

    #[error("wallet not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(RecordStoreError),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

impl From<RecordStoreError> for WalletError {
    fn from(e: RecordStoreError) -> Self {
        match e {
            RecordStoreError::NotFound(what) => Self::NotFound(what),
            RecordStoreError::Conflict {
                field: UniqueField::Alias,
                value,
            } => Self::DuplicateAlias(value),
            RecordStoreError::Conflict {
                field: UniqueField::Address,
                value,
            } => Self::DuplicateAddress(value),
            other @ RecordStoreError::Backend(_) => Self::Storage(other),
        }
    }
}

impl WalletError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InvalidAlias(_) => ErrorKind::Validation,
            Self::DuplicateAlias(_) | Self::DuplicateAddress(_) => ErrorKind::Conflict,
            Self::NotFound(_) | Self::Storage(_) => ErrorKind::Storage,
            Self::Vault(_) => ErrorKind::Vault,
        }
    }

    /// Stable machine-readable code; one per user-facing message.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(KeyError::InvalidFormat { .. }) => "invalid_private_key",
            Self::Validation(KeyError::InvalidMnemonic { .. }) => "invalid_mnemonic",
            Self::Validation(KeyError::InvalidDerivationPath { .. }) => "invalid_derivation_path",
            Self::Validation(KeyError::Derivation(_)) => "derivation_failed",
            Self::InvalidAlias(_) => "invalid_alias",
            Self::DuplicateAlias(_) => "alias_exists",
            Self::DuplicateAddress(_) => "address_exists",
            Self::NotFound(_) => "wallet_not_found",
            Self::Storage(_) => "storage_error",
            Self::Vault(v) => vault_code(v),
        }
    }
}

const fn vault_code(e: &VaultError) -> &'static str {
    match e {
        VaultError::NotFound(_) => "key_not_found",
        VaultError::DecryptionFailed(_) => "decryption_failed",
        VaultError::IncorrectPassword => "incorrect_password",
        VaultError::EmptyPassword => "empty_password",
        VaultError::AlreadyExists(_) => "vault_exists",
        VaultError::NotInitialized => "vault_not_initialized",
        VaultError::Locked => "vault_locked",
        VaultError::Busy => "vault_busy",
        VaultError::Io { .. } => "vault_io_error",
        VaultError::Corrupt(_) | VaultError::UnsupportedVersion(_) => "vault_corrupt",
        VaultError::Crypto(_) | VaultError::Poisoned => "vault_error",
    }
}

/// A structured error suitable for printing to a caller as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct UserError {
    pub code: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl From<&WalletError> for UserError {
    fn from(e: &WalletError) -> Self {
        let data = match e {
            WalletError::Validation(KeyError::InvalidFormat { length, .. }) => {
                serde_json::json!({ "length": length })
            }
            WalletError::Validation(KeyError::InvalidMnemonic { word_count }) => {
                serde_json::json!({ "word_count": word_count })
            }
            WalletError::Validation(_)
            | WalletError::InvalidAlias(_)
            | WalletError::DuplicateAlias(_)
            | WalletError::DuplicateAddress(_)
            | WalletError::NotFound(_)
            | WalletError::Storage(_)
            | WalletError::Vault(_) => Value::Null,
        };
        Self {
            code: e.code(),
            kind: e.kind(),
            message: e.to_string(),
            data,
        }
    }
}

impl From<&VaultError> for UserError {
    fn from(e: &VaultError) -> Self {
        Self {
            code: vault_code(e),
            kind: ErrorKind::Vault,
            message: e.to_string(),
            data: Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_conflicts_map_to_conflict_kind() {
        let e: WalletError = RecordStoreError::Conflict {
            field: UniqueField::Alias,
            value: "w1".to_owned(),
        }
        .into();
        assert!(matches!(e, WalletError::DuplicateAlias(ref a) if a == "w1"));
        assert_eq!(e.kind(), ErrorKind::Conflict);
        assert_eq!(e.code(), "alias_exists");
    }

    #[test]
    fn user_error_carries_word_count() -> eyre::Result<()> {
        let e = WalletError::Validation(KeyError::InvalidMnemonic { word_count: 5 });
        let u = UserError::from(&e);
        assert_eq!(u.code, "invalid_mnemonic");
        let v = serde_json::to_value(&u)?;
        assert_eq!(
            v.pointer("/data/word_count").and_then(Value::as_u64),
            Some(5)
        );
        Ok(())
    }

    #[test]
    fn incorrect_password_has_its_own_code() {
        let u = UserError::from(&VaultError::IncorrectPassword);
        assert_eq!(u.code, "incorrect_password");
        assert_eq!(u.kind, ErrorKind::Vault);
    }
}
