//! Encrypted key vault and wallet lifecycle coordinator for Ethereum-style wallets.
//!
//! [`vault::SecretVault`] holds private keys and mnemonics encrypted at rest.
//! [`service::WalletService`] keeps it consistent with a [`records::WalletRecordStore`]
//! holding the non-secret wallet metadata.
#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

pub mod balance;
pub mod config;
pub mod errors;
pub mod fsutil;
pub mod keys;
pub mod paths;
pub mod records;
pub mod retry;
pub mod saga;
pub mod service;
pub mod vault;
