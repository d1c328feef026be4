//! The table metadata document: the durable copy of every table index.
//!
//! Layout on disk:
//!
//! ```json
//! {"tables": {"users": {"rows": {"<row id>": 3}}}}
//! ```
//!
//! Every write is a full read-modify-write of the document. That is fine
//! for small tables and the cost grows with total row count.

use crate::file::ensure_parent_dir;
use crate::index::TableIndex;
use crate::page::PageNumber;
use crate::{Result, StorageError};
use log::{debug, trace};
use sealdb_core::RowId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    #[serde(default)]
    pub rows: BTreeMap<RowId, PageNumber>,
}

impl TableMeta {
    pub fn to_index(&self) -> TableIndex {
        self.rows.iter().map(|(id, page)| (*id, *page)).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    #[serde(default)]
    pub tables: BTreeMap<String, TableMeta>,
}

pub struct Catalog {
    path: PathBuf,
    sync_on_write: bool,
}

impl Catalog {
    /// Opens the document at `path`, writing an empty one if absent.
    pub fn open(path: &Path) -> Result<Self> {
        let catalog = Self {
            path: path.to_path_buf(),
            sync_on_write: false,
        };

        if !path.exists() {
            ensure_parent_dir(path)?;
            catalog.store(&MetadataDocument::default())?;
            debug!("created metadata document {}", path.display());
        }

        Ok(catalog)
    }

    /// Makes every rewrite wait for `sync_all` before it is renamed into place.
    pub fn with_sync(mut self, sync_on_write: bool) -> Self {
        self.sync_on_write = sync_on_write;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<MetadataDocument> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(MetadataDocument::default())
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        serde_json::from_slice(&bytes).map_err(|source| StorageError::CorruptMetadata {
            path: self.path.clone(),
            source,
        })
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        Ok(self.load()?.tables.into_keys().collect())
    }

    /// The table's entry, empty if the table is not recorded.
    pub fn read_table(&self, name: &str) -> Result<TableMeta> {
        Ok(self.load()?.tables.remove(name).unwrap_or_default())
    }

    /// Replaces the table's entry and rewrites the whole document.
    pub fn write_table(&self, name: &str, meta: &TableMeta) -> Result<()> {
        let mut doc = self.load()?;
        doc.tables.insert(name.to_string(), meta.clone());
        self.store(&doc)?;
        trace!("metadata for {} rewritten ({} rows)", name, meta.rows.len());
        Ok(())
    }

    /// Writes to a sibling temp file and renames it over the document, so
    /// readers see either the old or the new document, never a prefix.
    fn store(&self, doc: &MetadataDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        if self.sync_on_write {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn id(raw: u128) -> RowId {
        RowId::from_u128(raw)
    }

    #[test]
    fn test_open_creates_empty_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.meta.json");

        let catalog = Catalog::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(catalog.load().unwrap(), MetadataDocument::default());

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"tables": {}}));
    }

    #[test]
    fn test_write_table_replaces_only_that_table() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("data.meta.json")).unwrap();

        let mut users = TableMeta::default();
        users.rows.insert(id(1), 0);
        catalog.write_table("users", &users).unwrap();

        let mut orders = TableMeta::default();
        orders.rows.insert(id(2), 1);
        catalog.write_table("orders", &orders).unwrap();

        users.rows.insert(id(3), 2);
        catalog.write_table("users", &users).unwrap();

        assert_eq!(catalog.read_table("users").unwrap(), users);
        assert_eq!(catalog.read_table("orders").unwrap(), orders);
        assert_eq!(catalog.read_table("missing").unwrap(), TableMeta::default());
        assert_eq!(catalog.table_names().unwrap(), vec!["orders", "users"]);
    }

    #[test]
    fn test_document_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.meta.json");
        let catalog = Catalog::open(&path).unwrap();

        let mut meta = TableMeta::default();
        meta.rows.insert(id(0xff), 7);
        catalog.write_table("users", &meta).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "tables": {"users": {"rows": {"000000000000000000000000000000ff": 7}}}
            })
        );
    }

    #[test]
    fn test_to_index_mirrors_rows() {
        let mut meta = TableMeta::default();
        meta.rows.insert(id(2), 5);
        meta.rows.insert(id(1), 6);

        let index = meta.to_index();
        assert_eq!(index.all_ids(), vec![id(1), id(2)]);
        assert_eq!(index.get(&id(2)), Some(5));
    }

    #[test]
    fn test_corrupt_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.meta.json");
        fs::write(&path, "{\"tables\": [").unwrap();

        let catalog = Catalog::open(&path).unwrap();
        assert!(matches!(
            catalog.load(),
            Err(StorageError::CorruptMetadata { .. })
        ));
    }
}
