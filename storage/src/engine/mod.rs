//! The database session: recovery on open and the mutation protocol.
//!
//! The metadata document is the durable source of truth for which rows
//! exist; each [`TableIndex`] is a cache rebuilt from it on open. Every
//! index-affecting mutation goes through the same three steps:
//!
//! 1. write the row page (insert/update only),
//! 2. append a [`WalRecord`] describing the logical change,
//! 3. apply the record to the index and the metadata document.
//!
//! A crash after step 1 leaves at worst an orphaned page nothing points
//! to. A crash after step 2 is repaired on the next open, which re-applies
//! every logged record (applying is idempotent) and then clears the log.

use crate::catalog::{Catalog, MetadataDocument};
use crate::config::DbConfig;
use crate::crypto::CryptoContext;
use crate::file::{PageFile, SessionLock};
use crate::index::TableIndex;
use crate::row::RowStore;
use crate::wal::{Wal, WalOp, WalRecord};
use crate::{Result, StorageError};
use log::{debug, info, warn};
use sealdb_core::{Row, RowId, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Locations of the files that make up one database.
///
/// For a database at `data/app.db`:
///
/// | file | path |
/// |---|---|
/// | row pages | `data/app.db` |
/// | metadata | `data/app.meta.json` |
/// | redo log | `data/app.db.wal` |
/// | salt | `data/app.salt` |
/// | lock | `data/app.db.lock` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabasePaths {
    pub data: PathBuf,
    pub metadata: PathBuf,
    pub wal: PathBuf,
    pub salt: PathBuf,
    pub lock: PathBuf,
}

impl DatabasePaths {
    pub fn new(path: &Path) -> Self {
        Self {
            data: path.to_path_buf(),
            metadata: path.with_extension("meta.json"),
            wal: Self::with_suffix(path, ".wal"),
            salt: path.with_extension("salt"),
            lock: Self::with_suffix(path, ".lock"),
        }
    }

    fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }
}

/// An open database. Owns every file handle for the session.
///
/// One session per database at a time: [`Database::open`] takes an
/// exclusive lock and fails with [`StorageError::Locked`] if another
/// session holds it. The type is not meant to be shared between threads.
pub struct Database {
    paths: DatabasePaths,
    config: DbConfig,
    store: RowStore,
    catalog: Catalog,
    wal: Wal,
    tables: BTreeMap<String, TableIndex>,
    /// Set when a log append or metadata rewrite fails; the index can no
    /// longer be trusted to match the document.
    poisoned: bool,
    // Declared last so it is released after the files above are closed.
    _lock: Option<SessionLock>,
}

impl Database {
    /// Opens (creating if needed) the database at `path`. Row payloads are
    /// encrypted iff a passphrase is given.
    pub fn open(path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<Self> {
        Self::open_with_config(path, passphrase, &DbConfig::default())
    }

    pub fn open_with_config(
        path: impl AsRef<Path>,
        passphrase: Option<&str>,
        config: &DbConfig,
    ) -> Result<Self> {
        config.validate()?;
        let paths = DatabasePaths::new(path.as_ref());

        let lock = if config.lock {
            Some(SessionLock::acquire(&paths.lock)?)
        } else {
            None
        };

        let crypto = passphrase
            .map(|p| CryptoContext::open(p, &paths.salt, config.kdf_iterations))
            .transpose()?;

        let pager = PageFile::open(&paths.data)?.with_sync(config.sync_writes);
        let store = RowStore::new(pager, crypto);
        let catalog = Catalog::open(&paths.metadata)?.with_sync(config.sync_writes);
        let wal = Wal::open(&paths.wal)?.with_sync(config.sync_writes);

        let mut db = Self {
            paths,
            config: config.clone(),
            store,
            catalog,
            wal,
            tables: BTreeMap::new(),
            poisoned: false,
            _lock: lock,
        };

        db.load_tables()?;
        let replayed = db.replay_wal()?;

        info!(
            "opened {} ({} tables, {} wal records replayed, encrypted: {})",
            db.paths.data.display(),
            db.tables.len(),
            replayed,
            db.store.is_encrypted()
        );
        Ok(db)
    }

    pub fn paths(&self) -> &DatabasePaths {
        &self.paths
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn is_encrypted(&self) -> bool {
        self.store.is_encrypted()
    }

    /// Creates an empty table. Returns false, leaving the table untouched,
    /// if it already exists.
    pub fn create_table(&mut self, name: &str) -> Result<bool> {
        self.ensure_usable()?;
        if self.tables.contains_key(name) {
            return Ok(false);
        }

        self.catalog
            .write_table(name, &Default::default())
            .map_err(|e| self.poison(e))?;
        self.tables.insert(name.to_string(), TableIndex::new());

        info!("created table {}", name);
        Ok(true)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Number of rows in `table`, or None if there is no such table.
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.tables.get(table).map(TableIndex::len)
    }

    pub fn index(&self, table: &str) -> Option<&TableIndex> {
        self.tables.get(table)
    }

    /// The metadata document as currently stored on disk.
    pub fn metadata(&self) -> Result<MetadataDocument> {
        self.catalog.load()
    }

    /// Inserts `row` and returns its new id. An unknown table is created.
    pub fn insert(&mut self, table: &str, row: &Row) -> Result<RowId> {
        self.ensure_usable()?;

        let mut id = RowId::generate();
        while self.tables.get(table).is_some_and(|t| t.contains(&id)) {
            id = RowId::generate();
        }

        let page = self.store.write_row(row)?;
        self.log_and_apply(WalRecord::insert(table, id, page))?;

        debug!("inserted {}/{} at page {}", table, id, page);
        Ok(id)
    }

    pub fn get(&mut self, table: &str, id: &RowId) -> Result<Option<Row>> {
        self.ensure_usable()?;

        let page = match self.tables.get(table).and_then(|t| t.get(id)) {
            Some(page) => page,
            None => return Ok(None),
        };
        self.store.read_row(page).map(Some)
    }

    /// Merges `partial` into the stored row, rewriting its page in place.
    /// Returns false if the table or row does not exist.
    pub fn update(&mut self, table: &str, id: &RowId, partial: Row) -> Result<bool> {
        self.ensure_usable()?;

        let page = match self.tables.get(table).and_then(|t| t.get(id)) {
            Some(page) => page,
            None => return Ok(false),
        };

        let mut row = self.store.read_row(page)?;
        row.merge(partial);
        self.store.update_page(page, &row)?;
        let applied = self.log_and_apply(WalRecord::update(table, *id, page))?;

        debug!("updated {}/{} on page {}", table, id, page);
        Ok(applied)
    }

    /// Removes the row from its table. The page stays allocated.
    /// Returns whether the row existed.
    pub fn delete(&mut self, table: &str, id: &RowId) -> Result<bool> {
        self.ensure_usable()?;

        // Logged before the existence check, like every other mutation.
        let existed = self.log_and_apply(WalRecord::delete(table, *id))?;

        debug!("delete {}/{}: existed {}", table, id, existed);
        Ok(existed)
    }

    /// Every row of `table` with its id, in ascending id order. Empty for an
    /// unknown table.
    pub fn scan(&mut self, table: &str) -> Result<Vec<(RowId, Row)>> {
        self.ensure_usable()?;

        let entries: Vec<_> = match self.tables.get(table) {
            Some(index) => index.iter().collect(),
            None => return Ok(Vec::new()),
        };

        let mut rows = Vec::with_capacity(entries.len());
        for (id, page) in entries {
            rows.push((id, self.store.read_row(page)?));
        }
        Ok(rows)
    }

    pub fn find_all(&mut self, table: &str) -> Result<Vec<Row>> {
        Ok(self.scan(table)?.into_iter().map(|(_, row)| row).collect())
    }

    /// Full scan for rows whose `field` equals `value`. Integers and floats
    /// compare numerically.
    pub fn find_by_filter(&mut self, table: &str, field: &str, value: &Value) -> Result<Vec<Row>> {
        Ok(self
            .scan(table)?
            .into_iter()
            .map(|(_, row)| row)
            .filter(|row| row.get(field).is_some_and(|v| v.loosely_equals(value)))
            .collect())
    }

    /// Discards the log. Every logged record has already been applied, so
    /// this only marks the current state as final.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.wal.clear().map_err(|e| self.poison(e))?;
        debug!("committed");
        Ok(())
    }

    /// Records in the log that a restart would replay.
    pub fn pending_wal_records(&self) -> Result<usize> {
        self.wal.len()
    }

    /// Clean shutdown: flushes if configured, empties the log and releases
    /// the session lock.
    pub fn close(mut self) -> Result<()> {
        self.ensure_usable()?;
        if self.config.sync_writes {
            self.store.sync()?;
        }
        self.wal.clear()?;
        info!("closed {}", self.paths.data.display());
        Ok(())
    }

    fn load_tables(&mut self) -> Result<()> {
        let doc = self.catalog.load()?;
        self.tables = doc
            .tables
            .iter()
            .map(|(name, meta)| (name.clone(), meta.to_index()))
            .collect();
        Ok(())
    }

    fn replay_wal(&mut self) -> Result<usize> {
        let records = self.wal.read_all()?;
        if !records.is_empty() {
            info!("replaying {} wal records", records.len());
        }

        for record in &records {
            self.apply(record)?;
        }
        self.wal.clear()?;
        Ok(records.len())
    }

    fn log_and_apply(&mut self, record: WalRecord) -> Result<bool> {
        if let Err(e) = self.wal.append(&record) {
            return Err(self.poison(e));
        }
        self.apply(&record).map_err(|e| self.poison(e))
    }

    /// Brings the index and metadata document in line with `record`.
    ///
    /// Idempotent: re-applying a record already reflected in the document
    /// changes nothing. Returns false for a delete of an absent row.
    fn apply(&mut self, record: &WalRecord) -> Result<bool> {
        let table = record.table.as_str();

        match record.op {
            WalOp::Insert => {
                let page = match record.page {
                    Some(page) => page,
                    None => {
                        warn!("skipping insert of {}/{} without a page", table, record.id);
                        return Ok(false);
                    }
                };

                self.tables
                    .entry(table.to_string())
                    .or_default()
                    .insert_or_overwrite(record.id, page);

                let mut meta = self.catalog.read_table(table)?;
                meta.rows.insert(record.id, page);
                self.catalog.write_table(table, &meta)?;
                Ok(true)
            }
            WalOp::Delete => {
                let removed = match self.tables.get_mut(table) {
                    Some(index) => index.delete(&record.id),
                    None => return Ok(false),
                };

                if removed {
                    let mut meta = self.catalog.read_table(table)?;
                    meta.rows.remove(&record.id);
                    self.catalog.write_table(table, &meta)?;
                }
                Ok(removed)
            }
            // The page number never changes on update
            WalOp::Update => Ok(true),
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(StorageError::Poisoned);
        }
        Ok(())
    }

    fn poison(&mut self, err: StorageError) -> StorageError {
        warn!("session for {} is now unusable: {}", self.paths.data.display(), err);
        self.poisoned = true;
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_paths_layout() {
        let paths = DatabasePaths::new(Path::new("data/app.db"));

        assert_eq!(paths.data, PathBuf::from("data/app.db"));
        assert_eq!(paths.metadata, PathBuf::from("data/app.meta.json"));
        assert_eq!(paths.wal, PathBuf::from("data/app.db.wal"));
        assert_eq!(paths.salt, PathBuf::from("data/app.salt"));
        assert_eq!(paths.lock, PathBuf::from("data/app.db.lock"));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("app.db"), None).unwrap();
        db.create_table("users").unwrap();

        let id = RowId::from_u128(42);
        let insert = WalRecord::insert("users", id, 0);
        assert!(db.apply(&insert).unwrap());
        let after_once = (db.index("users").cloned(), db.metadata().unwrap());
        assert!(db.apply(&insert).unwrap());
        assert_eq!((db.index("users").cloned(), db.metadata().unwrap()), after_once);

        let delete = WalRecord::delete("users", id);
        assert!(db.apply(&delete).unwrap());
        let after_delete = (db.index("users").cloned(), db.metadata().unwrap());
        assert!(!db.apply(&delete).unwrap());
        assert_eq!((db.index("users").cloned(), db.metadata().unwrap()), after_delete);
    }

    #[test]
    fn test_apply_delete_on_unknown_table() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("app.db"), None).unwrap();

        assert!(!db.apply(&WalRecord::delete("ghost", RowId::from_u128(1))).unwrap());
        assert!(!db.has_table("ghost"));
    }

    #[test]
    fn test_insert_without_page_is_skipped() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("app.db"), None).unwrap();

        let mut record = WalRecord::insert("users", RowId::from_u128(1), 0);
        record.page = None;
        assert!(!db.apply(&record).unwrap());
        assert_eq!(db.row_count("users"), None);
    }

    #[test]
    fn test_poisoned_session_refuses_work() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("app.db"), None).unwrap();
        db.create_table("users").unwrap();

        let err = db.poison(StorageError::InvalidConfig("simulated".into()));
        assert!(matches!(err, StorageError::InvalidConfig(_)));

        assert!(matches!(
            db.insert("users", &Row::new().with("a", 1)),
            Err(StorageError::Poisoned)
        ));
        assert!(matches!(db.find_all("users"), Err(StorageError::Poisoned)));
        assert!(matches!(db.commit(), Err(StorageError::Poisoned)));
    }

    #[test]
    fn test_create_table_twice_keeps_rows() {
        let dir = tempdir().unwrap();
        let mut db = Database::open(dir.path().join("app.db"), None).unwrap();

        assert!(db.create_table("users").unwrap());
        db.insert("users", &Row::new().with("a", 1)).unwrap();
        assert!(!db.create_table("users").unwrap());
        assert_eq!(db.row_count("users"), Some(1));
    }
}
