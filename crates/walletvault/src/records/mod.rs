//! Non-secret wallet metadata and the record-store contract.

use crate::errors::RecordStoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

pub mod json;
pub mod memory;
pub mod sql;

pub use json::JsonRecordStore;
pub use memory::MemoryRecordStore;
pub use sql::SqlRecordStore;

/// Stable wallet identifier assigned by the record store (always >= 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(pub u64);

impl std::fmt::Display for WalletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub id: WalletId,
    pub alias: String,
    pub address: String,
    pub from_mnemonic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes of a record about to be created; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWallet {
    pub alias: String,
    pub address: String,
    pub from_mnemonic: bool,
    pub derivation_path: Option<String>,
}

impl NewWallet {
    pub(crate) fn into_record(self, id: WalletId, now: DateTime<Utc>) -> WalletRecord {
        WalletRecord {
            id,
            alias: self.alias,
            address: self.address,
            from_mnemonic: self.from_mnemonic,
            derivation_path: self.derivation_path,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One page of records plus the total number of records in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletPage {
    pub items: Vec<WalletRecord>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}

/// Clamp 1-based paging input and return `(page, page_size, offset)`.
pub(crate) fn paging(page: u64, page_size: u64) -> (u64, u64, u64) {
    let page = page.max(1);
    let page_size = page_size.max(1);
    (page, page_size, (page - 1).saturating_mul(page_size))
}

/// Address comparison is case-insensitive; stored addresses are checksummed.
pub(crate) fn same_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Persistence for wallet metadata. Every call fails independently.
///
/// `update_wallet` replaces alias, address, origin flag and derivation path of
/// the record with `record.id` and bumps `updated_at`; `created_at` is kept.
pub trait WalletRecordStore {
    fn create_wallet(
        &self,
        new: NewWallet,
    ) -> impl Future<Output = Result<WalletRecord, RecordStoreError>>;

    fn get_wallet_by_id(
        &self,
        id: WalletId,
    ) -> impl Future<Output = Result<Option<WalletRecord>, RecordStoreError>>;

    fn get_wallet_by_alias(
        &self,
        alias: &str,
    ) -> impl Future<Output = Result<Option<WalletRecord>, RecordStoreError>>;

    fn get_wallet_by_address(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Option<WalletRecord>, RecordStoreError>>;

    fn update_wallet(
        &self,
        record: &WalletRecord,
    ) -> impl Future<Output = Result<WalletRecord, RecordStoreError>>;

    fn delete_wallet(&self, id: WalletId) -> impl Future<Output = Result<(), RecordStoreError>>;

    fn wallet_exists_by_alias(
        &self,
        alias: &str,
    ) -> impl Future<Output = Result<bool, RecordStoreError>>;

    fn wallet_exists_by_address(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<bool, RecordStoreError>>;

    fn list_wallets(
        &self,
        page: u64,
        page_size: u64,
    ) -> impl Future<Output = Result<WalletPage, RecordStoreError>>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behavior every backend shares, run against each implementation.

    use super::*;
    use eyre::ContextCompat as _;

    pub fn new_wallet(alias: &str, address: &str) -> NewWallet {
        NewWallet {
            alias: alias.to_owned(),
            address: address.to_owned(),
            from_mnemonic: false,
            derivation_path: None,
        }
    }

    pub async fn crud_round_trip<R: WalletRecordStore>(store: &R) -> eyre::Result<()> {
        let a = store
            .create_wallet(NewWallet {
                derivation_path: Some("m/44'/60'/0'/0/0".to_owned()),
                from_mnemonic: true,
                ..new_wallet("alpha", "0x00000000000000000000000000000000000000Aa")
            })
            .await?;
        let b = store
            .create_wallet(new_wallet("beta", "0x00000000000000000000000000000000000000bB"))
            .await?;
        assert!(a.id.0 >= 1, "ids start at 1");
        assert!(b.id > a.id, "ids increase");

        let got = store.get_wallet_by_id(a.id).await?.context("by id")?;
        assert_eq!(got, a);
        assert_eq!(got.derivation_path.as_deref(), Some("m/44'/60'/0'/0/0"));

        let by_alias = store.get_wallet_by_alias("beta").await?.context("by alias")?;
        assert_eq!(by_alias.id, b.id);
        let by_addr = store
            .get_wallet_by_address("0x00000000000000000000000000000000000000AA")
            .await?
            .context("by address, any case")?;
        assert_eq!(by_addr.id, a.id);
        assert!(store.wallet_exists_by_alias("alpha").await?);
        assert!(!store.wallet_exists_by_alias("gamma").await?);
        assert!(
            store
                .wallet_exists_by_address("0x00000000000000000000000000000000000000bb")
                .await?
        );

        let mut renamed = a.clone();
        renamed.alias = "alpha2".to_owned();
        renamed.from_mnemonic = false;
        renamed.derivation_path = None;
        let updated = store.update_wallet(&renamed).await?;
        assert_eq!(updated.alias, "alpha2");
        assert_eq!(updated.created_at, a.created_at);
        assert!(updated.updated_at >= a.updated_at, "updated_at moves forward");
        let reread = store.get_wallet_by_id(a.id).await?.context("reread")?;
        assert!(!reread.from_mnemonic);
        assert_eq!(reread.derivation_path, None);
        assert!(store.get_wallet_by_alias("alpha").await?.is_none());

        store.delete_wallet(b.id).await?;
        assert!(store.get_wallet_by_id(b.id).await?.is_none());
        Ok(())
    }

    pub async fn missing_records<R: WalletRecordStore>(store: &R) -> eyre::Result<()> {
        assert!(store.get_wallet_by_id(WalletId(42)).await?.is_none());
        let err = store
            .delete_wallet(WalletId(42))
            .await
            .err()
            .context("delete of missing id must fail")?;
        assert!(matches!(err, RecordStoreError::NotFound(_)));

        let ghost = new_wallet("ghost", "0x0000000000000000000000000000000000000001")
            .into_record(WalletId(42), Utc::now());
        let err = store
            .update_wallet(&ghost)
            .await
            .err()
            .context("update of missing id must fail")?;
        assert!(matches!(err, RecordStoreError::NotFound(_)));
        Ok(())
    }

    pub async fn paging_is_one_based<R: WalletRecordStore>(store: &R) -> eyre::Result<()> {
        for i in 1..=5_u8 {
            store
                .create_wallet(new_wallet(
                    &format!("w{i}"),
                    &format!("0x{:040x}", u64::from(i)),
                ))
                .await?;
        }
        let p1 = store.list_wallets(1, 2).await?;
        assert_eq!(p1.total, 5);
        let aliases: Vec<_> = p1.items.iter().map(|w| w.alias.as_str()).collect();
        assert_eq!(aliases, ["w1", "w2"]);

        let p3 = store.list_wallets(3, 2).await?;
        assert_eq!(p3.items.len(), 1);
        assert_eq!(p3.items.first().map(|w| w.alias.as_str()), Some("w5"));

        let p0 = store.list_wallets(0, 0).await?;
        assert_eq!((p0.page, p0.page_size, p0.items.len()), (1, 1, 1));

        assert!(store.list_wallets(9, 2).await?.items.is_empty());
        Ok(())
    }

    /// Backends that enforce uniqueness themselves.
    pub async fn rejects_duplicates<R: WalletRecordStore>(store: &R) -> eyre::Result<()> {
        let a = store
            .create_wallet(new_wallet("one", "0x00000000000000000000000000000000000000Aa"))
            .await?;
        store
            .create_wallet(new_wallet("two", "0x00000000000000000000000000000000000000Bb"))
            .await?;

        let err = store
            .create_wallet(new_wallet("one", "0x00000000000000000000000000000000000000Cc"))
            .await
            .err()
            .context("duplicate alias")?;
        assert!(matches!(
            err,
            RecordStoreError::Conflict {
                field: crate::errors::UniqueField::Alias,
                ..
            }
        ));

        let err = store
            .create_wallet(new_wallet("three", "0x00000000000000000000000000000000000000aa"))
            .await
            .err()
            .context("duplicate address")?;
        assert!(matches!(
            err,
            RecordStoreError::Conflict {
                field: crate::errors::UniqueField::Address,
                ..
            }
        ));

        let mut clash = a;
        clash.alias = "two".to_owned();
        let err = store
            .update_wallet(&clash)
            .await
            .err()
            .context("rename onto existing alias")?;
        assert!(matches!(err, RecordStoreError::Conflict { .. }));
        assert_eq!(store.list_wallets(1, 10).await?.total, 2);
        Ok(())
    }
}
