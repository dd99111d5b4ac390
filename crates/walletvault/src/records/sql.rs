use super::{paging, NewWallet, WalletId, WalletPage, WalletRecord, WalletRecordStore};
use crate::errors::{RecordStoreError, UniqueField};
use chrono::{DateTime, Utc};
use eyre::Context as _;
use std::path::Path;
use tokio::sync::Mutex;

// Embedded relational record store (Turso, pure Rust, SQLite-compatible).
//
// `address_key` is the lowercased address so uniqueness is case-insensitive while
// `address` keeps the checksummed form for display.

const COLUMNS: &str = "id, alias, address, from_mnemonic, derivation_path, created_at, updated_at";

pub struct SqlRecordStore {
    _db: turso::Database,
    conn: turso::Connection,
    // Serializes check-then-write sequences on the single connection.
    write: Mutex<()>,
}

impl std::fmt::Debug for SqlRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlRecordStore").finish_non_exhaustive()
    }
}

fn backend(e: &eyre::Report) -> RecordStoreError {
    RecordStoreError::backend(e)
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_ts(s: &str) -> eyre::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("parse timestamp {s:?}"))?
        .with_timezone(&Utc))
}

fn id_param(id: WalletId) -> Result<i64, RecordStoreError> {
    i64::try_from(id.0).map_err(|e| RecordStoreError::Backend(format!("wallet id {id}: {e}")))
}

/// Map a failed insert/update to `Conflict` when the database reports a unique violation.
fn map_write_error(e: &eyre::Report, alias: &str, address: &str) -> RecordStoreError {
    let msg = format!("{e:#}");
    if msg.contains("UNIQUE") {
        if msg.contains("address") {
            return RecordStoreError::Conflict {
                field: UniqueField::Address,
                value: address.to_owned(),
            };
        }
        return RecordStoreError::Conflict {
            field: UniqueField::Alias,
            value: alias.to_owned(),
        };
    }
    backend(e)
}

fn row_to_record(row: &turso::Row) -> eyre::Result<WalletRecord> {
    let id: i64 = row.get(0).context("row.id")?;
    let alias: String = row.get(1).context("row.alias")?;
    let address: String = row.get(2).context("row.address")?;
    let from_mnemonic: i64 = row.get(3).context("row.from_mnemonic")?;
    let derivation_path: String = row.get(4).context("row.derivation_path")?;
    let created_at: String = row.get(5).context("row.created_at")?;
    let updated_at: String = row.get(6).context("row.updated_at")?;
    Ok(WalletRecord {
        id: WalletId(u64::try_from(id).context("negative wallet id")?),
        alias,
        address,
        from_mnemonic: from_mnemonic != 0,
        derivation_path: (!derivation_path.is_empty()).then_some(derivation_path),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

async fn first_record(mut rows: turso::Rows) -> eyre::Result<Option<WalletRecord>> {
    let Some(row) = rows.next().await.context("next row")? else {
        return Ok(None);
    };
    row_to_record(&row).map(Some)
}

impl SqlRecordStore {
    pub async fn open(path: &Path) -> Result<Self, RecordStoreError> {
        Self::open_inner(path).await.map_err(|e| backend(&e))
    }

    async fn open_inner(path: &Path) -> eyre::Result<Self> {
        if let Some(parent) = path.parent() {
            crate::fsutil::ensure_private_dir(parent).context("create record db directory")?;
        }
        let p_s = path.to_string_lossy();
        let db = turso::Builder::new_local(p_s.as_ref())
            .build()
            .await
            .context("open turso local db")?;
        let conn = db.connect().context("connect turso db")?;
        let this = Self {
            _db: db,
            conn,
            write: Mutex::new(()),
        };
        this.init().await?;
        Ok(this)
    }

    async fn init(&self) -> eyre::Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS wallets (\
                  id INTEGER PRIMARY KEY AUTOINCREMENT,\
                  alias TEXT NOT NULL UNIQUE,\
                  address TEXT NOT NULL,\
                  address_key TEXT NOT NULL UNIQUE,\
                  from_mnemonic INTEGER NOT NULL,\
                  derivation_path TEXT NOT NULL,\
                  created_at TEXT NOT NULL,\
                  updated_at TEXT NOT NULL\
                )",
                (),
            )
            .await
            .context("create wallets")?;
        Ok(())
    }

    async fn one_by_text(&self, column: &str, value: &str) -> eyre::Result<Option<WalletRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM wallets WHERE {column} = ? ORDER BY id LIMIT 1");
        let rows = self
            .conn
            .query(&sql, (value,))
            .await
            .with_context(|| format!("query wallets by {column}"))?;
        first_record(rows).await
    }

    async fn by_id(&self, id: WalletId) -> Result<Option<WalletRecord>, RecordStoreError> {
        let rows = self
            .conn
            .query(
                &format!("SELECT {COLUMNS} FROM wallets WHERE id = ?"),
                (id_param(id)?,),
            )
            .await
            .context("query wallets by id")
            .map_err(|e| backend(&e))?;
        first_record(rows).await.map_err(|e| backend(&e))
    }

    async fn taken(
        &self,
        alias: &str,
        address: &str,
        except: Option<WalletId>,
    ) -> Result<Option<RecordStoreError>, RecordStoreError> {
        let except = except.map(|w| w.0);
        if let Some(w) = self
            .one_by_text("alias", alias)
            .await
            .map_err(|e| backend(&e))?
        {
            if Some(w.id.0) != except {
                return Ok(Some(RecordStoreError::Conflict {
                    field: UniqueField::Alias,
                    value: alias.to_owned(),
                }));
            }
        }
        if let Some(w) = self
            .one_by_text("address_key", &address.to_ascii_lowercase())
            .await
            .map_err(|e| backend(&e))?
        {
            if Some(w.id.0) != except {
                return Ok(Some(RecordStoreError::Conflict {
                    field: UniqueField::Address,
                    value: address.to_owned(),
                }));
            }
        }
        Ok(None)
    }

    async fn count(&self) -> eyre::Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM wallets", ())
            .await
            .context("count wallets")?;
        let Some(row) = rows.next().await.context("next row")? else {
            return Ok(0);
        };
        let n: i64 = row.get(0).context("row.count")?;
        u64::try_from(n).context("negative count")
    }

    async fn page(&self, limit: u64, offset: u64) -> eyre::Result<Vec<WalletRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {COLUMNS} FROM wallets ORDER BY id LIMIT ? OFFSET ?"),
                (limit, offset),
            )
            .await
            .context("list wallets")?;
        let mut out = vec![];
        while let Some(row) = rows.next().await.context("next row")? {
            out.push(row_to_record(&row)?);
        }
        Ok(out)
    }
}

impl WalletRecordStore for SqlRecordStore {
    async fn create_wallet(&self, new: NewWallet) -> Result<WalletRecord, RecordStoreError> {
        let _guard = self.write.lock().await;
        if let Some(e) = self.taken(&new.alias, &new.address, None).await? {
            return Err(e);
        }
        let now = ts(Utc::now());
        let mut rows = self
            .conn
            .query(
                "INSERT INTO wallets \
                   (alias, address, address_key, from_mnemonic, derivation_path, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
                (
                    new.alias.as_str(),
                    new.address.as_str(),
                    new.address.to_ascii_lowercase(),
                    i64::from(new.from_mnemonic),
                    new.derivation_path.as_deref().unwrap_or(""),
                    now.as_str(),
                    now.as_str(),
                ),
            )
            .await
            .context("insert wallets")
            .map_err(|e| map_write_error(&e, &new.alias, &new.address))?;
        let row = rows
            .next()
            .await
            .context("next row")
            .map_err(|e| backend(&e))?
            .ok_or_else(|| RecordStoreError::Backend("insert returned no id".to_owned()))?;
        let id: i64 = row
            .get(0)
            .context("row.id")
            .map_err(|e| backend(&e))?;
        drop(rows);
        let id = WalletId(
            u64::try_from(id)
                .context("negative wallet id")
                .map_err(|e| backend(&e))?,
        );
        self.by_id(id)
            .await?
            .ok_or_else(|| RecordStoreError::Backend(format!("wallet id {id} vanished after insert")))
    }

    async fn get_wallet_by_id(&self, id: WalletId) -> Result<Option<WalletRecord>, RecordStoreError> {
        self.by_id(id).await
    }

    async fn get_wallet_by_alias(
        &self,
        alias: &str,
    ) -> Result<Option<WalletRecord>, RecordStoreError> {
        self.one_by_text("alias", alias)
            .await
            .map_err(|e| backend(&e))
    }

    async fn get_wallet_by_address(
        &self,
        address: &str,
    ) -> Result<Option<WalletRecord>, RecordStoreError> {
        self.one_by_text("address_key", &address.to_ascii_lowercase())
            .await
            .map_err(|e| backend(&e))
    }

    async fn update_wallet(&self, record: &WalletRecord) -> Result<WalletRecord, RecordStoreError> {
        let _guard = self.write.lock().await;
        if self.by_id(record.id).await?.is_none() {
            return Err(RecordStoreError::NotFound(format!("wallet id {}", record.id)));
        }
        if let Some(e) = self.taken(&record.alias, &record.address, Some(record.id)).await? {
            return Err(e);
        }
        let id = id_param(record.id)?;
        self.conn
            .execute(
                "UPDATE wallets SET alias = ?, address = ?, address_key = ?, from_mnemonic = ?, \
                   derivation_path = ?, updated_at = ? WHERE id = ?",
                (
                    record.alias.as_str(),
                    record.address.as_str(),
                    record.address.to_ascii_lowercase(),
                    i64::from(record.from_mnemonic),
                    record.derivation_path.as_deref().unwrap_or(""),
                    ts(Utc::now()),
                    id,
                ),
            )
            .await
            .context("update wallets")
            .map_err(|e| map_write_error(&e, &record.alias, &record.address))?;
        self.by_id(record.id)
            .await?
            .ok_or_else(|| RecordStoreError::NotFound(format!("wallet id {}", record.id)))
    }

    async fn delete_wallet(&self, id: WalletId) -> Result<(), RecordStoreError> {
        let _guard = self.write.lock().await;
        if self.by_id(id).await?.is_none() {
            return Err(RecordStoreError::NotFound(format!("wallet id {id}")));
        }
        self.conn
            .execute("DELETE FROM wallets WHERE id = ?", (id_param(id)?,))
            .await
            .context("delete wallets")
            .map_err(|e| backend(&e))?;
        Ok(())
    }

    async fn wallet_exists_by_alias(&self, alias: &str) -> Result<bool, RecordStoreError> {
        Ok(self.get_wallet_by_alias(alias).await?.is_some())
    }

    async fn wallet_exists_by_address(&self, address: &str) -> Result<bool, RecordStoreError> {
        Ok(self.get_wallet_by_address(address).await?.is_some())
    }

    async fn list_wallets(&self, page: u64, page_size: u64) -> Result<WalletPage, RecordStoreError> {
        let (page, page_size, offset) = paging(page, page_size);
        let total = self.count().await.map_err(|e| backend(&e))?;
        let items = self
            .page(page_size, offset)
            .await
            .map_err(|e| backend(&e))?;
        Ok(WalletPage {
            items,
            total,
            page,
            page_size,
        })
    }
}
