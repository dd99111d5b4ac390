//! Wallet lifecycle coordinator.
//!
//! Keeps the record store and the secret store consistent across operations that
//! have no shared transaction. Every multi-step write runs as a [`Saga`]; a
//! failure part-way through undoes the completed steps in reverse order.

use crate::{
    balance::{format_wei, BalanceLookup},
    errors::{VaultError, WalletError},
    keys::{self, DEFAULT_DERIVATION_PATH},
    records::{same_address, NewWallet, WalletId, WalletPage, WalletRecord, WalletRecordStore},
    saga::Saga,
    vault::SecretStore,
};
use alloy::primitives::U256;
use secrecy::{ExposeSecret as _, SecretString};
use serde::Serialize;
use std::time::Duration;

const MAX_ALIAS_LEN: usize = 64;

pub fn private_key_slot(id: WalletId) -> String {
    format!("privateKey:{id}")
}

pub fn mnemonic_slot(id: WalletId) -> String {
    format!("mnemonic:{id}")
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub default_derivation_path: String,
    /// Words in a generated mnemonic: 12 or 24.
    pub generated_words: usize,
    pub balance_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            default_derivation_path: DEFAULT_DERIVATION_PATH.to_owned(),
            generated_words: 12,
            balance_timeout: Duration::from_secs(5),
        }
    }
}

/// A freshly generated wallet. The secrets are shown once and not retained.
#[derive(Debug)]
pub struct GeneratedWallet {
    pub record: WalletRecord,
    pub mnemonic: SecretString,
    pub private_key: SecretString,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub wei: String,
    pub ether: String,
}

impl From<U256> for Balance {
    fn from(wei: U256) -> Self {
        Self {
            wei: wei.to_string(),
            ether: format_wei(wei),
        }
    }
}

/// A record enriched for display. A failed lookup leaves `balance` unset.
#[derive(Debug, Clone, Serialize)]
pub struct WalletView {
    #[serde(flatten)]
    pub record: WalletRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<Balance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletViewPage {
    pub items: Vec<WalletView>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}

fn check_alias(alias: &str) -> Result<(), WalletError> {
    let trimmed = alias.trim();
    if trimmed.is_empty() || trimmed != alias || alias.chars().count() > MAX_ALIAS_LEN {
        return Err(WalletError::InvalidAlias(alias.to_owned()));
    }
    Ok(())
}

#[derive(Debug)]
pub struct WalletService<'a, R, S> {
    records: &'a R,
    secrets: &'a S,
    options: ServiceOptions,
}

impl<'a, R, S> WalletService<'a, R, S>
where
    R: WalletRecordStore,
    S: SecretStore,
{
    pub fn new(records: &'a R, secrets: &'a S) -> Self {
        Self {
            records,
            secrets,
            options: ServiceOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    pub const fn options(&self) -> &ServiceOptions {
        &self.options
    }

    // ── reads ─────────────────────────────────────────────────────────

    pub async fn get_wallet(&self, id: WalletId) -> Result<WalletRecord, WalletError> {
        self.records
            .get_wallet_by_id(id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("id {id}")))
    }

    pub async fn get_wallet_by_alias(&self, alias: &str) -> Result<WalletRecord, WalletError> {
        self.records
            .get_wallet_by_alias(alias)
            .await?
            .ok_or_else(|| WalletError::NotFound(alias.to_owned()))
    }

    pub async fn list_wallets(&self, page: u64, page_size: u64) -> Result<WalletPage, WalletError> {
        Ok(self.records.list_wallets(page, page_size).await?)
    }

    pub async fn get_private_key(&self, id: WalletId) -> Result<SecretString, WalletError> {
        self.get_wallet(id).await?;
        Ok(self.secrets.get(&private_key_slot(id))?)
    }

    /// The phrase a wallet was imported or generated from.
    ///
    /// Wallets imported from a raw key have none and yield the vault's `NotFound`.
    pub async fn get_mnemonic(&self, id: WalletId) -> Result<SecretString, WalletError> {
        let record = self.get_wallet(id).await?;
        let slot = mnemonic_slot(id);
        if !record.from_mnemonic {
            return Err(VaultError::NotFound(slot).into());
        }
        Ok(self.secrets.get(&slot)?)
    }

    // ── create ────────────────────────────────────────────────────────

    pub async fn import_private_key(
        &self,
        alias: &str,
        private_key: &str,
    ) -> Result<WalletRecord, WalletError> {
        check_alias(alias)?;
        let key = keys::normalize_private_key(private_key)?;
        let address = keys::address_of(&key)?;
        let record = self
            .create_with_secrets(
                "import_private_key",
                NewWallet {
                    alias: alias.to_owned(),
                    address,
                    from_mnemonic: false,
                    derivation_path: None,
                },
                &key,
                None,
            )
            .await?;
        tracing::info!(id = %record.id, alias, address = %record.address, "imported private key");
        Ok(record)
    }

    /// Import a BIP-39 phrase, deriving at `path` or the configured default.
    pub async fn import_mnemonic(
        &self,
        alias: &str,
        phrase: &str,
        path: Option<&str>,
    ) -> Result<WalletRecord, WalletError> {
        check_alias(alias)?;
        keys::validate_mnemonic(phrase)?;
        let path = path
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.options.default_derivation_path);
        let derived = keys::derive_from_mnemonic(phrase, path)?;
        let normalized = keys::normalize_mnemonic(phrase);
        let record = self
            .create_with_secrets(
                "import_mnemonic",
                NewWallet {
                    alias: alias.to_owned(),
                    address: derived.address,
                    from_mnemonic: true,
                    derivation_path: Some(path.to_owned()),
                },
                &derived.private_key,
                Some(normalized.as_str()),
            )
            .await?;
        tracing::info!(id = %record.id, alias, address = %record.address, path, "imported mnemonic");
        Ok(record)
    }

    /// Generate a new mnemonic wallet at the default path.
    ///
    /// The private key is read back from the vault for one-time display; if that
    /// fails the wallet is removed again.
    pub async fn generate(&self, alias: &str) -> Result<GeneratedWallet, WalletError> {
        check_alias(alias)?;
        let phrase = keys::generate_mnemonic(self.options.generated_words)?;
        let record = self.import_mnemonic(alias, &phrase, None).await?;

        let private_key = match self.secrets.get(&private_key_slot(record.id)) {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(id = %record.id, error = %e, "read-back of generated key failed, removing wallet");
                if let Err(cleanup) = self.delete_wallet(record.id).await {
                    tracing::warn!(id = %record.id, error = %cleanup, "cleanup of generated wallet failed");
                }
                return Err(e.into());
            }
        };
        tracing::info!(id = %record.id, alias, "generated wallet");
        Ok(GeneratedWallet {
            record,
            mnemonic: SecretString::new(phrase.as_str().into()),
            private_key,
        })
    }

    async fn ensure_unused(&self, alias: &str, address: &str) -> Result<(), WalletError> {
        if self.records.wallet_exists_by_address(address).await? {
            return Err(WalletError::DuplicateAddress(address.to_owned()));
        }
        if self.records.wallet_exists_by_alias(alias).await? {
            return Err(WalletError::DuplicateAlias(alias.to_owned()));
        }
        Ok(())
    }

    /// Lowest id wins: if an earlier record already holds `record`'s address
    /// or alias, roll back. Every writer runs this after its own write, so two
    /// racing writers agree on which of them keeps the value.
    async fn confirm_unique(
        &self,
        saga: &mut Saga<'a>,
        record: &WalletRecord,
    ) -> Result<(), WalletError> {
        let by_address = saga
            .check(self.records.get_wallet_by_address(&record.address).await)
            .await?;
        if by_address.as_ref().map(|w| w.id) != Some(record.id) {
            tracing::warn!(
                id = %record.id,
                address = %record.address,
                winner = ?by_address.map(|w| w.id),
                "address claimed concurrently, rolling back"
            );
            saga.rollback().await;
            return Err(WalletError::DuplicateAddress(record.address.clone()));
        }

        let by_alias = saga
            .check(self.records.get_wallet_by_alias(&record.alias).await)
            .await?;
        if by_alias.as_ref().map(|w| w.id) != Some(record.id) {
            tracing::warn!(
                id = %record.id,
                alias = %record.alias,
                winner = ?by_alias.map(|w| w.id),
                "alias claimed concurrently, rolling back"
            );
            saga.rollback().await;
            return Err(WalletError::DuplicateAlias(record.alias.clone()));
        }
        Ok(())
    }

    async fn create_with_secrets(
        &self,
        op: &'static str,
        new: NewWallet,
        private_key: &str,
        mnemonic: Option<&str>,
    ) -> Result<WalletRecord, WalletError> {
        self.ensure_unused(&new.alias, &new.address).await?;

        let records = self.records;
        let secrets = self.secrets;
        let mut saga = Saga::new(op);

        let record = self.records.create_wallet(new).await?;
        let id = record.id;
        saga.push("create record", async move { records.delete_wallet(id).await });

        let pk_slot = private_key_slot(id);
        // Registered before the write: a failed set may still have changed the map.
        saga.push("write private key", {
            let slot = pk_slot.clone();
            async move { secrets.delete(&slot) }
        });
        saga.check(secrets.set(&pk_slot, private_key)).await?;

        if let Some(phrase) = mnemonic {
            let m_slot = mnemonic_slot(id);
            saga.push("write mnemonic", {
                let slot = m_slot.clone();
                async move { secrets.delete(&slot) }
            });
            saga.check(secrets.set(&m_slot, phrase)).await?;
        }

        self.confirm_unique(&mut saga, &record).await?;
        saga.commit();

        if mnemonic.is_none() {
            // A vault shared with a store that reissued this id may still hold
            // the previous owner's phrase.
            if let Err(e) = secrets.delete(&mnemonic_slot(id)) {
                tracing::warn!(id = %id, error = %e, "stale mnemonic cleanup failed");
            }
        }
        Ok(record)
    }

    // ── update ────────────────────────────────────────────────────────

    pub async fn update_alias(
        &self,
        id: WalletId,
        new_alias: &str,
    ) -> Result<WalletRecord, WalletError> {
        check_alias(new_alias)?;
        let record = self.get_wallet(id).await?;
        if record.alias == new_alias {
            return Ok(record);
        }
        if self.records.wallet_exists_by_alias(new_alias).await? {
            return Err(WalletError::DuplicateAlias(new_alias.to_owned()));
        }
        let old_alias = record.alias.clone();
        let records = self.records;
        let mut saga = Saga::new("update_alias");
        let updated = records
            .update_wallet(&WalletRecord {
                alias: new_alias.to_owned(),
                ..record.clone()
            })
            .await?;
        saga.push("rename record", async move {
            records.update_wallet(&record).await.map(drop)
        });
        self.confirm_unique(&mut saga, &updated).await?;
        saga.commit();
        tracing::info!(id = %id, from = %old_alias, to = new_alias, "renamed wallet");
        Ok(updated)
    }

    /// Replace a wallet's key. The wallet becomes key-imported: origin flag
    /// cleared, derivation path dropped, mnemonic secret deleted.
    pub async fn update_private_key(
        &self,
        id: WalletId,
        private_key: &str,
    ) -> Result<WalletRecord, WalletError> {
        let key = keys::normalize_private_key(private_key)?;
        let address = keys::address_of(&key)?;
        let previous = self.get_wallet(id).await?;

        if let Some(holder) = self.records.get_wallet_by_address(&address).await? {
            if holder.id != id {
                return Err(WalletError::DuplicateAddress(address));
            }
        }

        let records = self.records;
        let secrets = self.secrets;
        let pk_slot = private_key_slot(id);
        // Rollback must be able to put back exactly what is there now.
        let previous_key = match secrets.get(&pk_slot) {
            Ok(k) => Some(k),
            Err(VaultError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let mut saga = Saga::new("update_private_key");
        let updated = records
            .update_wallet(&WalletRecord {
                address,
                from_mnemonic: false,
                derivation_path: None,
                ..previous.clone()
            })
            .await?;
        saga.push("update record", {
            let previous = previous.clone();
            async move { records.update_wallet(&previous).await.map(drop) }
        });

        saga.push("overwrite private key", {
            let slot = pk_slot.clone();
            async move {
                match previous_key {
                    Some(k) => secrets.set(&slot, k.expose_secret()),
                    None => secrets.delete(&slot),
                }
            }
        });
        saga.check(secrets.set(&pk_slot, &key)).await?;

        self.confirm_unique(&mut saga, &updated).await?;
        saga.commit();

        if let Err(e) = secrets.delete(&mnemonic_slot(id)) {
            tracing::warn!(id = %id, error = %e, "mnemonic cleanup failed");
        }
        tracing::info!(id = %id, address = %updated.address, "replaced private key");
        Ok(updated)
    }

    // ── delete ────────────────────────────────────────────────────────

    /// Secrets are removed best-effort, even when no record exists for `id`;
    /// a record-store failure is surfaced.
    pub async fn delete_wallet(&self, id: WalletId) -> Result<(), WalletError> {
        let record = self.records.get_wallet_by_id(id).await?;
        for slot in [private_key_slot(id), mnemonic_slot(id)] {
            if let Err(e) = self.secrets.delete(&slot) {
                tracing::warn!(id = %id, slot = %slot, error = %e, "secret cleanup failed");
            }
        }
        let Some(record) = record else {
            return Err(WalletError::NotFound(format!("id {id}")));
        };
        self.records.delete_wallet(id).await?;
        tracing::info!(id = %id, alias = %record.alias, "deleted wallet");
        Ok(())
    }

    // ── balances ──────────────────────────────────────────────────────

    async fn view<B: BalanceLookup>(&self, record: WalletRecord, balances: &B) -> WalletView {
        match balances
            .get_balance(&record.address, self.options.balance_timeout)
            .await
        {
            Ok(wei) => WalletView {
                record,
                balance: Some(wei.into()),
                balance_error: None,
            },
            Err(e) => {
                tracing::debug!(id = %record.id, error = %e, "balance lookup failed");
                WalletView {
                    record,
                    balance: None,
                    balance_error: Some(e.to_string()),
                }
            }
        }
    }

    pub async fn get_wallet_with_balance<B: BalanceLookup>(
        &self,
        id: WalletId,
        balances: &B,
    ) -> Result<WalletView, WalletError> {
        let record = self.get_wallet(id).await?;
        Ok(self.view(record, balances).await)
    }

    pub async fn list_wallets_with_balances<B: BalanceLookup>(
        &self,
        page: u64,
        page_size: u64,
        balances: &B,
    ) -> Result<WalletViewPage, WalletError> {
        let listed = self.list_wallets(page, page_size).await?;
        let mut items = Vec::with_capacity(listed.items.len());
        for record in listed.items {
            items.push(self.view(record, balances).await);
        }
        Ok(WalletViewPage {
            items,
            total: listed.total,
            page: listed.page,
            page_size: listed.page_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::{BalanceError, KeyError, RecordStoreError},
        records::MemoryRecordStore,
        vault::SecretVault,
    };
    use eyre::ContextCompat as _;
    use std::{
        collections::BTreeSet,
        sync::atomic::{AtomicBool, Ordering},
    };

    const PHRASE: &str = "test test test test test test test test test test test junk";
    const KEY_0: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const ADDR_0: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
    const KEY_1: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
    const ADDR_1: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    /// Vault wrapper that fails selected operations on demand.
    #[derive(Debug)]
    struct FlakySecrets {
        inner: SecretVault,
        fail_private_key_set: AtomicBool,
        fail_mnemonic_set: AtomicBool,
        fail_get: AtomicBool,
    }

    impl FlakySecrets {
        fn new() -> eyre::Result<Self> {
            let inner = SecretVault::in_memory();
            inner.create(&SecretString::new("pw".into()))?;
            Ok(Self {
                inner,
                fail_private_key_set: AtomicBool::new(false),
                fail_mnemonic_set: AtomicBool::new(false),
                fail_get: AtomicBool::new(false),
            })
        }

        fn keys(&self) -> eyre::Result<BTreeSet<String>> {
            Ok(self.inner.list()?)
        }
    }

    fn injected(key: &str) -> VaultError {
        VaultError::io(key, std::io::Error::other("injected failure"))
    }

    impl SecretStore for FlakySecrets {
        fn get(&self, key: &str) -> Result<SecretString, VaultError> {
            if self.fail_get.load(Ordering::SeqCst) {
                return Err(injected(key));
            }
            self.inner.get(key)
        }

        fn set(&self, key: &str, secret: &str) -> Result<(), VaultError> {
            let fail = if key.starts_with("mnemonic:") {
                self.fail_mnemonic_set.load(Ordering::SeqCst)
            } else {
                self.fail_private_key_set.load(Ordering::SeqCst)
            };
            if fail {
                // Mirror the vault: the map changes, durability fails.
                self.inner.set(key, secret)?;
                return Err(injected(key));
            }
            self.inner.set(key, secret)
        }

        fn delete(&self, key: &str) -> Result<(), VaultError> {
            self.inner.delete(key)
        }

        fn list(&self) -> Result<BTreeSet<String>, VaultError> {
            self.inner.list()
        }
    }

    /// Record store whose existence checks always miss, so duplicates reach `create_wallet`.
    #[derive(Debug, Default)]
    struct RacyRecords(MemoryRecordStore);

    impl WalletRecordStore for RacyRecords {
        async fn create_wallet(&self, new: NewWallet) -> Result<WalletRecord, RecordStoreError> {
            self.0.create_wallet(new).await
        }
        async fn get_wallet_by_id(&self, id: WalletId) -> Result<Option<WalletRecord>, RecordStoreError> {
            self.0.get_wallet_by_id(id).await
        }
        async fn get_wallet_by_alias(&self, alias: &str) -> Result<Option<WalletRecord>, RecordStoreError> {
            self.0.get_wallet_by_alias(alias).await
        }
        async fn get_wallet_by_address(&self, address: &str) -> Result<Option<WalletRecord>, RecordStoreError> {
            self.0.get_wallet_by_address(address).await
        }
        async fn update_wallet(&self, record: &WalletRecord) -> Result<WalletRecord, RecordStoreError> {
            self.0.update_wallet(record).await
        }
        async fn delete_wallet(&self, id: WalletId) -> Result<(), RecordStoreError> {
            self.0.delete_wallet(id).await
        }
        async fn wallet_exists_by_alias(&self, _alias: &str) -> Result<bool, RecordStoreError> {
            Ok(false)
        }
        async fn wallet_exists_by_address(&self, _address: &str) -> Result<bool, RecordStoreError> {
            Ok(false)
        }
        async fn list_wallets(&self, page: u64, page_size: u64) -> Result<WalletPage, RecordStoreError> {
            self.0.list_wallets(page, page_size).await
        }
    }

    /// Fixed balances; addresses listed in `down` fail.
    struct StubBalances {
        down: Vec<String>,
    }

    impl BalanceLookup for StubBalances {
        async fn get_balance(&self, address: &str, _timeout: Duration) -> Result<U256, BalanceError> {
            if self.down.iter().any(|a| same_address(a, address)) {
                return Err(BalanceError::Transport("connection refused".to_owned()));
            }
            Ok(U256::from(42_u64))
        }
    }

    #[tokio::test]
    async fn import_private_key_stores_checksummed_address_and_normalized_key() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);

        let w = svc
            .import_private_key("w1", KEY_0.trim_start_matches("0x"))
            .await?;
        assert_eq!(w.address, ADDR_0);
        assert!(!w.from_mnemonic);
        assert_eq!(w.derivation_path, None);
        assert_eq!(svc.get_private_key(w.id).await?.expose_secret(), KEY_0);
        assert_eq!(secrets.keys()?, BTreeSet::from([private_key_slot(w.id)]));
        Ok(())
    }

    #[tokio::test]
    async fn conflicts_and_bad_input_have_no_side_effects() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);
        svc.import_private_key("w1", KEY_0).await?;

        let err = svc.import_private_key("w2", KEY_0).await.err().context("dup address")?;
        assert!(matches!(err, WalletError::DuplicateAddress(_)));
        assert_eq!(err.code(), "address_exists");

        let err = svc.import_private_key("w1", KEY_1).await.err().context("dup alias")?;
        assert!(matches!(err, WalletError::DuplicateAlias(_)));

        let err = svc.import_private_key("w3", "0x1234").await.err().context("bad key")?;
        assert!(matches!(
            err,
            WalletError::Validation(KeyError::InvalidFormat { length: 4, .. })
        ));

        let err = svc
            .import_mnemonic("w4", "test test test test junk", None)
            .await
            .err()
            .context("short phrase")?;
        assert!(matches!(
            err,
            WalletError::Validation(KeyError::InvalidMnemonic { word_count: 5 })
        ));

        let err = svc.import_private_key("  ", KEY_1).await.err().context("blank alias")?;
        assert!(matches!(err, WalletError::InvalidAlias(_)));

        assert_eq!(records.list_wallets(1, 10).await?.total, 1);
        assert_eq!(secrets.keys()?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_duplicate_address_is_rolled_back() -> eyre::Result<()> {
        let records = RacyRecords::default();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);

        let first = svc.import_private_key("w1", KEY_0).await?;
        let err = svc
            .import_private_key("w2", KEY_0)
            .await
            .err()
            .context("second import must lose the race")?;
        assert!(matches!(err, WalletError::DuplicateAddress(_)));
        assert_eq!(err.kind(), crate::errors::ErrorKind::Conflict);

        let page = records.list_wallets(1, 10).await?;
        assert_eq!(page.total, 1);
        assert_eq!(page.items.first().map(|w| w.id), Some(first.id));
        assert_eq!(secrets.keys()?, BTreeSet::from([private_key_slot(first.id)]));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_duplicate_alias_is_rolled_back() -> eyre::Result<()> {
        let records = RacyRecords::default();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);

        let first = svc.import_private_key("w1", KEY_0).await?;
        let err = svc
            .import_private_key("w1", KEY_1)
            .await
            .err()
            .context("second import must lose the race")?;
        assert!(matches!(err, WalletError::DuplicateAlias(ref a) if a == "w1"));

        let page = records.list_wallets(1, 10).await?;
        let aliases: Vec<_> = page.items.iter().map(|w| w.alias.as_str()).collect();
        assert_eq!(aliases, vec!["w1"]);
        assert_eq!(page.items.first().map(|w| w.id), Some(first.id));
        assert_eq!(secrets.keys()?, BTreeSet::from([private_key_slot(first.id)]));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_rename_onto_taken_alias_is_rolled_back() -> eyre::Result<()> {
        let records = RacyRecords::default();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);
        let a = svc.import_private_key("a", KEY_0).await?;
        let b = svc.import_private_key("b", KEY_1).await?;

        let err = svc.update_alias(b.id, "a").await.err().context("alias taken")?;
        assert!(matches!(err, WalletError::DuplicateAlias(_)));
        assert_eq!(svc.get_wallet(b.id).await?.alias, "b");
        assert_eq!(svc.get_wallet_by_alias("a").await?.id, a.id);
        Ok(())
    }

    #[tokio::test]
    async fn mnemonic_import_couples_origin_flag_and_mnemonic_secret() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);

        let m = svc.import_mnemonic("m", &format!(" {PHRASE}\n"), None).await?;
        assert_eq!(m.address, ADDR_0);
        assert!(m.from_mnemonic);
        assert_eq!(m.derivation_path.as_deref(), Some(DEFAULT_DERIVATION_PATH));
        assert_eq!(svc.get_mnemonic(m.id).await?.expose_secret(), PHRASE);
        assert_eq!(svc.get_private_key(m.id).await?.expose_secret(), KEY_0);

        let k = svc.import_private_key("k", KEY_1).await?;
        let err = svc.get_mnemonic(k.id).await.err().context("no mnemonic")?;
        assert!(matches!(err, WalletError::Vault(VaultError::NotFound(_))));

        assert_eq!(
            secrets.keys()?,
            BTreeSet::from([
                private_key_slot(m.id),
                mnemonic_slot(m.id),
                private_key_slot(k.id)
            ])
        );
        Ok(())
    }

    #[tokio::test]
    async fn custom_path_derives_another_account() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);
        let w = svc
            .import_mnemonic("second", PHRASE, Some("m/44'/60'/0'/0/1"))
            .await?;
        assert_eq!(w.address, ADDR_1);
        assert_eq!(w.derivation_path.as_deref(), Some("m/44'/60'/0'/0/1"));
        Ok(())
    }

    #[tokio::test]
    async fn failed_mnemonic_write_removes_key_and_record() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        secrets.fail_mnemonic_set.store(true, Ordering::SeqCst);
        let svc = WalletService::new(&records, &secrets);

        let err = svc.import_mnemonic("m", PHRASE, None).await.err().context("must fail")?;
        assert!(matches!(err, WalletError::Vault(VaultError::Io { .. })));
        assert_eq!(records.list_wallets(1, 10).await?.total, 0);
        assert!(secrets.keys()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_private_key_write_removes_record() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        secrets.fail_private_key_set.store(true, Ordering::SeqCst);
        let svc = WalletService::new(&records, &secrets);

        let err = svc.import_private_key("w1", KEY_0).await.err().context("must fail")?;
        assert_eq!(err.kind(), crate::errors::ErrorKind::Vault);
        assert_eq!(records.list_wallets(1, 10).await?.total, 0);
        assert!(secrets.keys()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn generate_returns_secrets_once_and_stores_both() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);

        let g = svc.generate("fresh").await?;
        assert_eq!(g.mnemonic.expose_secret().split(' ').count(), 12);
        assert!(g.record.from_mnemonic);
        let derived = keys::derive_from_mnemonic(g.mnemonic.expose_secret(), DEFAULT_DERIVATION_PATH)?;
        assert_eq!(derived.address, g.record.address);
        assert_eq!(g.private_key.expose_secret(), derived.private_key.as_str());
        assert_eq!(secrets.keys()?.len(), 2);

        let svc24 = WalletService::new(&records, &secrets).with_options(ServiceOptions {
            generated_words: 24,
            ..ServiceOptions::default()
        });
        let g24 = svc24.generate("long").await?;
        assert_eq!(g24.mnemonic.expose_secret().split(' ').count(), 24);
        Ok(())
    }

    #[tokio::test]
    async fn generate_removes_wallet_when_read_back_fails() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        secrets.fail_get.store(true, Ordering::SeqCst);
        let svc = WalletService::new(&records, &secrets);

        assert!(svc.generate("fresh").await.is_err(), "read-back failure surfaces");
        assert_eq!(records.list_wallets(1, 10).await?.total, 0);
        assert!(secrets.keys()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn update_alias_rules() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);
        let a = svc.import_private_key("a", KEY_0).await?;
        svc.import_private_key("b", KEY_1).await?;

        let same = svc.update_alias(a.id, "a").await?;
        assert_eq!(same, a);

        let err = svc.update_alias(a.id, "b").await.err().context("taken")?;
        assert!(matches!(err, WalletError::DuplicateAlias(_)));

        let renamed = svc.update_alias(a.id, "alpha").await?;
        assert_eq!(renamed.alias, "alpha");
        assert_eq!(svc.get_wallet_by_alias("alpha").await?.id, a.id);

        let err = svc.update_alias(WalletId(99), "x").await.err().context("missing")?;
        assert_eq!(err.code(), "wallet_not_found");
        Ok(())
    }

    #[tokio::test]
    async fn replacing_key_on_mnemonic_wallet_clears_origin() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);
        let m = svc.import_mnemonic("m", PHRASE, None).await?;

        let updated = svc.update_private_key(m.id, KEY_1).await?;
        assert_eq!(updated.address, ADDR_1);
        assert!(!updated.from_mnemonic);
        assert_eq!(updated.derivation_path, None);
        assert_eq!(svc.get_private_key(m.id).await?.expose_secret(), KEY_1);
        assert_eq!(secrets.keys()?, BTreeSet::from([private_key_slot(m.id)]));
        Ok(())
    }

    #[tokio::test]
    async fn replacing_key_with_another_wallets_key_conflicts() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);
        let a = svc.import_private_key("a", KEY_0).await?;
        svc.import_private_key("b", KEY_1).await?;

        let err = svc.update_private_key(a.id, KEY_1).await.err().context("taken")?;
        assert!(matches!(err, WalletError::DuplicateAddress(_)));
        // Same key again is fine.
        svc.update_private_key(a.id, KEY_0).await?;
        Ok(())
    }

    #[tokio::test]
    async fn failed_key_overwrite_restores_record_and_key() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);
        let m = svc.import_mnemonic("m", PHRASE, None).await?;

        secrets.fail_private_key_set.store(true, Ordering::SeqCst);
        assert!(svc.update_private_key(m.id, KEY_1).await.is_err(), "overwrite fails");
        secrets.fail_private_key_set.store(false, Ordering::SeqCst);

        let back = svc.get_wallet(m.id).await?;
        assert_eq!(back.address, ADDR_0);
        assert!(back.from_mnemonic);
        assert_eq!(back.derivation_path.as_deref(), Some(DEFAULT_DERIVATION_PATH));
        assert_eq!(svc.get_private_key(m.id).await?.expose_secret(), KEY_0);
        assert_eq!(svc.get_mnemonic(m.id).await?.expose_secret(), PHRASE);
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_record_and_secrets() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);
        let m = svc.import_mnemonic("m", PHRASE, None).await?;

        svc.delete_wallet(m.id).await?;
        assert!(records.get_wallet_by_id(m.id).await?.is_none());
        assert!(secrets.keys()?.is_empty());

        let err = svc.delete_wallet(m.id).await.err().context("already gone")?;
        assert!(matches!(err, WalletError::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn balance_failure_is_attached_not_propagated() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);
        let a = svc.import_private_key("a", KEY_0).await?;
        let b = svc.import_private_key("b", KEY_1).await?;
        let balances = StubBalances {
            down: vec![ADDR_1.to_owned()],
        };

        let page = svc.list_wallets_with_balances(1, 10, &balances).await?;
        assert_eq!(page.total, 2);
        let va = page.items.iter().find(|v| v.record.id == a.id).context("a listed")?;
        let vb = page.items.iter().find(|v| v.record.id == b.id).context("b listed")?;
        assert_eq!(va.balance.as_ref().map(|x| x.wei.as_str()), Some("42"));
        assert!(va.balance_error.is_none());
        assert!(vb.balance.is_none());
        assert!(vb.balance_error.as_deref().is_some_and(|e| e.contains("refused")));

        let single = svc.get_wallet_with_balance(b.id, &balances).await?;
        assert!(single.balance.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn key_import_over_reissued_id_drops_stale_mnemonic() -> eyre::Result<()> {
        let secrets = FlakySecrets::new()?;
        let earlier = MemoryRecordStore::new();
        let m = WalletService::new(&earlier, &secrets)
            .import_mnemonic("m", PHRASE, None)
            .await?;

        // A fresh store hands out the same id again against the same vault.
        let later = MemoryRecordStore::new();
        let k = WalletService::new(&later, &secrets)
            .import_private_key("k", KEY_1)
            .await?;
        assert_eq!(k.id, m.id);
        assert!(!k.from_mnemonic);
        assert_eq!(secrets.keys()?, BTreeSet::from([private_key_slot(k.id)]));
        Ok(())
    }

    #[tokio::test]
    async fn replacing_an_unreadable_key_changes_nothing() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);
        let w = svc.import_private_key("w1", KEY_0).await?;

        secrets.fail_get.store(true, Ordering::SeqCst);
        let err = svc
            .update_private_key(w.id, KEY_1)
            .await
            .err()
            .context("current key unreadable")?;
        assert!(matches!(err, WalletError::Vault(VaultError::Io { .. })));
        secrets.fail_get.store(false, Ordering::SeqCst);

        assert_eq!(svc.get_wallet(w.id).await?, w);
        assert_eq!(svc.get_private_key(w.id).await?.expose_secret(), KEY_0);
        Ok(())
    }

    #[tokio::test]
    async fn delete_clears_secrets_left_without_a_record() -> eyre::Result<()> {
        let records = MemoryRecordStore::new();
        let secrets = FlakySecrets::new()?;
        let svc = WalletService::new(&records, &secrets);
        let orphan = WalletId(9);
        secrets.set(&private_key_slot(orphan), KEY_0)?;
        secrets.set(&mnemonic_slot(orphan), PHRASE)?;

        let err = svc.delete_wallet(orphan).await.err().context("no record")?;
        assert!(matches!(err, WalletError::NotFound(_)));
        assert!(secrets.keys()?.is_empty());
        Ok(())
    }
}
