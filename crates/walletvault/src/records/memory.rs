use super::{paging, same_address, NewWallet, WalletId, WalletPage, WalletRecord, WalletRecordStore};
use crate::errors::RecordStoreError;
use chrono::Utc;
use std::{
    collections::BTreeMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    wallets: BTreeMap<WalletId, WalletRecord>,
}

/// Process-local record store.
///
/// Uniqueness is not enforced here; the coordinator's pre-checks and its
/// post-create address check are what keep alias and address unique.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: RwLock<Inner>,
}

fn poisoned() -> RecordStoreError {
    RecordStoreError::Backend("memory record store lock poisoned".to_owned())
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, RecordStoreError> {
        self.inner.read().map_err(|e| {
            tracing::warn!(error = %e, "memory record store lock poisoned");
            poisoned()
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, RecordStoreError> {
        self.inner.write().map_err(|e| {
            tracing::warn!(error = %e, "memory record store lock poisoned");
            poisoned()
        })
    }

    fn find(
        &self,
        pred: impl Fn(&WalletRecord) -> bool,
    ) -> Result<Option<WalletRecord>, RecordStoreError> {
        Ok(self.read()?.wallets.values().find(|w| pred(w)).cloned())
    }
}

impl WalletRecordStore for MemoryRecordStore {
    async fn create_wallet(&self, new: NewWallet) -> Result<WalletRecord, RecordStoreError> {
        let mut g = self.write()?;
        g.next_id = g.next_id.saturating_add(1);
        let id = WalletId(g.next_id);
        let record = new.into_record(id, Utc::now());
        g.wallets.insert(id, record.clone());
        Ok(record)
    }

    async fn get_wallet_by_id(&self, id: WalletId) -> Result<Option<WalletRecord>, RecordStoreError> {
        Ok(self.read()?.wallets.get(&id).cloned())
    }

    async fn get_wallet_by_alias(
        &self,
        alias: &str,
    ) -> Result<Option<WalletRecord>, RecordStoreError> {
        self.find(|w| w.alias == alias)
    }

    async fn get_wallet_by_address(
        &self,
        address: &str,
    ) -> Result<Option<WalletRecord>, RecordStoreError> {
        // Lowest id wins when duplicates slipped in.
        self.find(|w| same_address(&w.address, address))
    }

    async fn update_wallet(&self, record: &WalletRecord) -> Result<WalletRecord, RecordStoreError> {
        let mut g = self.write()?;
        let Some(existing) = g.wallets.get_mut(&record.id) else {
            return Err(RecordStoreError::NotFound(format!("wallet id {}", record.id)));
        };
        existing.alias.clone_from(&record.alias);
        existing.address.clone_from(&record.address);
        existing.from_mnemonic = record.from_mnemonic;
        existing.derivation_path.clone_from(&record.derivation_path);
        existing.updated_at = Utc::now();
        Ok(existing.clone())
    }

    async fn delete_wallet(&self, id: WalletId) -> Result<(), RecordStoreError> {
        self.write()?
            .wallets
            .remove(&id)
            .map(drop)
            .ok_or_else(|| RecordStoreError::NotFound(format!("wallet id {id}")))
    }

    async fn wallet_exists_by_alias(&self, alias: &str) -> Result<bool, RecordStoreError> {
        Ok(self.find(|w| w.alias == alias)?.is_some())
    }

    async fn wallet_exists_by_address(&self, address: &str) -> Result<bool, RecordStoreError> {
        Ok(self.find(|w| same_address(&w.address, address))?.is_some())
    }

    async fn list_wallets(&self, page: u64, page_size: u64) -> Result<WalletPage, RecordStoreError> {
        let (page, page_size, offset) = paging(page, page_size);
        let g = self.read()?;
        let items = g
            .wallets
            .values()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(page_size).unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(WalletPage {
            items,
            total: g.wallets.len() as u64,
            page,
            page_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::contract;

    #[tokio::test]
    async fn crud_round_trip() -> eyre::Result<()> {
        contract::crud_round_trip(&MemoryRecordStore::new()).await
    }

    #[tokio::test]
    async fn missing_records() -> eyre::Result<()> {
        contract::missing_records(&MemoryRecordStore::new()).await
    }

    #[tokio::test]
    async fn paging_is_one_based() -> eyre::Result<()> {
        contract::paging_is_one_based(&MemoryRecordStore::new()).await
    }

    #[tokio::test]
    async fn duplicates_are_accepted_and_lowest_id_wins_lookup() -> eyre::Result<()> {
        let store = MemoryRecordStore::new();
        let addr = "0x00000000000000000000000000000000000000Aa";
        let first = store.create_wallet(contract::new_wallet("a", addr)).await?;
        let second = store.create_wallet(contract::new_wallet("b", addr)).await?;
        assert_ne!(first.id, second.id);
        let found = store.get_wallet_by_address(addr).await?;
        assert_eq!(found.map(|w| w.id), Some(first.id));
        Ok(())
    }
}
