use super::{paging, same_address, NewWallet, WalletId, WalletPage, WalletRecord, WalletRecordStore};
use crate::{
    errors::{RecordStoreError, UniqueField},
    fsutil,
};
use chrono::Utc;
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WalletIndex {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    wallets: Vec<WalletRecord>,
}

impl WalletIndex {
    fn conflict(&self, alias: &str, address: &str, except: Option<WalletId>) -> Option<RecordStoreError> {
        let others = || self.wallets.iter().filter(move |w| Some(w.id) != except);
        if others().any(|w| w.alias == alias) {
            return Some(RecordStoreError::Conflict {
                field: UniqueField::Alias,
                value: alias.to_owned(),
            });
        }
        if others().any(|w| same_address(&w.address, address)) {
            return Some(RecordStoreError::Conflict {
                field: UniqueField::Address,
                value: address.to_owned(),
            });
        }
        None
    }
}

/// Record store backed by one owner-only JSON index file.
///
/// Every mutation rewrites the index atomically while the mutex is held.
#[derive(Debug)]
pub struct JsonRecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonRecordStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RecordStoreError> {
        let path = path.into();
        let this = Self {
            path,
            lock: Mutex::new(()),
        };
        if let Some(parent) = this.path.parent() {
            fsutil::ensure_private_dir(parent)
                .context("create record index directory")
                .map_err(|e| RecordStoreError::backend(&e))?;
        }
        // Fail early on an unreadable index rather than on first use.
        this.load().map_err(|e| RecordStoreError::backend(&e))?;
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> eyre::Result<WalletIndex> {
        if !self.path.exists() {
            return Ok(WalletIndex::default());
        }
        let s = fs::read_to_string(&self.path).context("read wallet index")?;
        let idx = serde_json::from_str(&s).context("parse wallet index")?;
        Ok(idx)
    }

    fn save(&self, idx: &WalletIndex) -> eyre::Result<()> {
        let s = serde_json::to_string_pretty(idx).context("serialize wallet index")?;
        fsutil::write_string_atomic_restrictive(&self.path, &s, fsutil::MODE_FILE_PRIVATE)
            .context("write wallet index")?;
        Ok(())
    }

    async fn read_index(&self) -> Result<WalletIndex, RecordStoreError> {
        let _guard = self.lock.lock().await;
        self.load().map_err(|e| RecordStoreError::backend(&e))
    }

    /// Load, apply `f`, and persist only if `f` succeeded.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut WalletIndex) -> Result<T, RecordStoreError>,
    ) -> Result<T, RecordStoreError> {
        let _guard = self.lock.lock().await;
        let mut idx = self.load().map_err(|e| RecordStoreError::backend(&e))?;
        let out = f(&mut idx)?;
        self.save(&idx).map_err(|e| RecordStoreError::backend(&e))?;
        Ok(out)
    }

    async fn find(
        &self,
        pred: impl Fn(&WalletRecord) -> bool,
    ) -> Result<Option<WalletRecord>, RecordStoreError> {
        let idx = self.read_index().await?;
        Ok(idx.wallets.into_iter().find(|w| pred(w)))
    }
}

impl WalletRecordStore for JsonRecordStore {
    async fn create_wallet(&self, new: NewWallet) -> Result<WalletRecord, RecordStoreError> {
        self.mutate(|idx| {
            if let Some(e) = idx.conflict(&new.alias, &new.address, None) {
                return Err(e);
            }
            // Ids are never reused, even after the highest wallet is deleted.
            let max_seen = idx.wallets.iter().map(|w| w.id.0).max().unwrap_or(0);
            idx.next_id = idx.next_id.max(max_seen).saturating_add(1);
            let record = new.into_record(WalletId(idx.next_id), Utc::now());
            idx.wallets.push(record.clone());
            Ok(record)
        })
        .await
    }

    async fn get_wallet_by_id(&self, id: WalletId) -> Result<Option<WalletRecord>, RecordStoreError> {
        self.find(|w| w.id == id).await
    }

    async fn get_wallet_by_alias(
        &self,
        alias: &str,
    ) -> Result<Option<WalletRecord>, RecordStoreError> {
        self.find(|w| w.alias == alias).await
    }

    async fn get_wallet_by_address(
        &self,
        address: &str,
    ) -> Result<Option<WalletRecord>, RecordStoreError> {
        self.find(|w| same_address(&w.address, address)).await
    }

    async fn update_wallet(&self, record: &WalletRecord) -> Result<WalletRecord, RecordStoreError> {
        self.mutate(|idx| {
            if let Some(e) = idx.conflict(&record.alias, &record.address, Some(record.id)) {
                return Err(e);
            }
            let Some(existing) = idx.wallets.iter_mut().find(|w| w.id == record.id) else {
                return Err(RecordStoreError::NotFound(format!("wallet id {}", record.id)));
            };
            existing.alias.clone_from(&record.alias);
            existing.address.clone_from(&record.address);
            existing.from_mnemonic = record.from_mnemonic;
            existing.derivation_path.clone_from(&record.derivation_path);
            existing.updated_at = Utc::now();
            Ok(existing.clone())
        })
        .await
    }

    async fn delete_wallet(&self, id: WalletId) -> Result<(), RecordStoreError> {
        self.mutate(|idx| {
            let before = idx.wallets.len();
            idx.wallets.retain(|w| w.id != id);
            if idx.wallets.len() == before {
                return Err(RecordStoreError::NotFound(format!("wallet id {id}")));
            }
            Ok(())
        })
        .await
    }

    async fn wallet_exists_by_alias(&self, alias: &str) -> Result<bool, RecordStoreError> {
        Ok(self.get_wallet_by_alias(alias).await?.is_some())
    }

    async fn wallet_exists_by_address(&self, address: &str) -> Result<bool, RecordStoreError> {
        Ok(self.get_wallet_by_address(address).await?.is_some())
    }

    async fn list_wallets(&self, page: u64, page_size: u64) -> Result<WalletPage, RecordStoreError> {
        let (page, page_size, offset) = paging(page, page_size);
        let mut wallets = self.read_index().await?.wallets;
        wallets.sort_by_key(|w| w.id);
        let total = wallets.len() as u64;
        let items = wallets
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(page_size).unwrap_or(usize::MAX))
            .collect();
        Ok(WalletPage {
            items,
            total,
            page,
            page_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::contract;
    use eyre::ContextCompat as _;

    fn store_in(td: &tempfile::TempDir) -> eyre::Result<JsonRecordStore> {
        Ok(JsonRecordStore::open(td.path().join("data").join("wallets.json"))?)
    }

    #[tokio::test]
    async fn crud_round_trip() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("tempdir")?;
        contract::crud_round_trip(&store_in(&td)?).await
    }

    #[tokio::test]
    async fn missing_records() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("tempdir")?;
        contract::missing_records(&store_in(&td)?).await
    }

    #[tokio::test]
    async fn paging_is_one_based() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("tempdir")?;
        contract::paging_is_one_based(&store_in(&td)?).await
    }

    #[tokio::test]
    async fn rejects_duplicates() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("tempdir")?;
        contract::rejects_duplicates(&store_in(&td)?).await
    }

    #[tokio::test]
    async fn index_survives_reopen_and_ids_are_not_reused() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("tempdir")?;
        let first = {
            let store = store_in(&td)?;
            let a = store
                .create_wallet(contract::new_wallet("a", "0x0000000000000000000000000000000000000001"))
                .await?;
            let b = store
                .create_wallet(contract::new_wallet("b", "0x0000000000000000000000000000000000000002"))
                .await?;
            store.delete_wallet(b.id).await?;
            a
        };

        let store = store_in(&td)?;
        let again = store.get_wallet_by_alias("a").await?.context("persisted")?;
        assert_eq!(again, first);
        let c = store
            .create_wallet(contract::new_wallet("c", "0x0000000000000000000000000000000000000003"))
            .await?;
        assert_eq!(c.id, WalletId(3));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_index_is_a_backend_error() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("tempdir")?;
        let p = td.path().join("wallets.json");
        fs::write(&p, "{not json")?;
        let err = JsonRecordStore::open(&p).err().context("must fail")?;
        assert!(matches!(err, RecordStoreError::Backend(_)));
        Ok(())
    }
}
