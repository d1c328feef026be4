//! Redo log for index mutations.
//!
//! One JSON record per line, appended in operation order. The log stores
//! records only; what replaying them means is decided by the engine.

use crate::file::ensure_parent_dir;
use crate::page::PageNumber;
use crate::{Result, StorageError};
use log::{debug, warn};
use sealdb_core::RowId;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalOp {
    Insert,
    Update,
    Delete,
}

/// `{"op": .., "table": .., "id": .., "page": ..}`; `page` is omitted for
/// deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub op: WalOp,
    pub table: String,
    pub id: RowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PageNumber>,
}

impl WalRecord {
    pub fn insert(table: &str, id: RowId, page: PageNumber) -> Self {
        Self {
            op: WalOp::Insert,
            table: table.to_string(),
            id,
            page: Some(page),
        }
    }

    pub fn update(table: &str, id: RowId, page: PageNumber) -> Self {
        Self {
            op: WalOp::Update,
            table: table.to_string(),
            id,
            page: Some(page),
        }
    }

    pub fn delete(table: &str, id: RowId) -> Self {
        Self {
            op: WalOp::Delete,
            table: table.to_string(),
            id,
            page: None,
        }
    }
}

pub struct Wal {
    path: PathBuf,
    file: File,
    sync_on_append: bool,
}

impl Wal {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(StorageError::Io)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            sync_on_append: false,
        })
    }

    /// Makes every append wait for `sync_data`.
    pub fn with_sync(mut self, sync_on_append: bool) -> Self {
        self.sync_on_append = sync_on_append;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &WalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        self.file.write_all(&line)?;
        self.file.flush()?;
        if self.sync_on_append {
            self.file.sync_data()?;
        }

        debug!("wal append {:?} {}/{}", record.op, record.table, record.id);
        Ok(())
    }

    /// Every record in append order.
    ///
    /// An undecodable final line without a terminating newline is the
    /// remains of an interrupted append and is skipped.
    pub fn read_all(&self) -> Result<Vec<WalRecord>> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        // Bytes, not text: a torn append may end inside a UTF-8 sequence.
        let complete = content.ends_with(b"\n");
        let lines: Vec<&[u8]> = content.split(|b| *b == b'\n').collect();
        let mut records = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<WalRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) if !complete && i + 1 == lines.len() => {
                    warn!(
                        "dropping torn record at end of {}: {}",
                        self.path.display(),
                        e
                    );
                }
                Err(e) => {
                    return Err(StorageError::CorruptWal {
                        line: i + 1,
                        source: e,
                    })
                }
            }
        }

        Ok(records)
    }

    /// Number of records waiting in the log.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read_all()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drops every record. Not an error if the file has gone missing.
    pub fn clear(&mut self) -> Result<()> {
        match self.file.set_len(0) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }
        if self.sync_on_append {
            self.file.sync_data()?;
        }

        debug!("wal cleared");
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
    fn test_append_and_read_in_order() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(&dir.path().join("data.db.wal")).unwrap();

        let records = vec![
            WalRecord::insert("users", id(1), 0),
            WalRecord::update("users", id(1), 0),
            WalRecord::delete("users", id(1)),
        ];
        for record in &records {
            wal.append(record).unwrap();
        }

        assert_eq!(wal.read_all().unwrap(), records);
        assert_eq!(wal.len().unwrap(), 3);
    }

    #[test]
    fn test_record_line_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db.wal");
        let mut wal = Wal::open(&path).unwrap();

        wal.append(&WalRecord::insert("t", id(1), 4)).unwrap();
        wal.append(&WalRecord::delete("t", id(1))).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            concat!(
                r#"{"op":"insert","table":"t","id":"00000000000000000000000000000001","page":4}"#,
                "\n",
                r#"{"op":"delete","table":"t","id":"00000000000000000000000000000001"}"#,
                "\n",
            )
        );
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db.wal");
        let wal = Wal::open(&path).unwrap();

        fs::remove_file(&path).unwrap();
        assert!(wal.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_clear() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(&dir.path().join("data.db.wal")).unwrap();

        wal.append(&WalRecord::delete("t", id(9))).unwrap();
        wal.clear().unwrap();
        assert!(wal.is_empty().unwrap());

        // Clearing twice is fine, and the log stays usable
        wal.clear().unwrap();
        wal.append(&WalRecord::delete("t", id(10))).unwrap();
        assert_eq!(wal.read_all().unwrap(), vec![WalRecord::delete("t", id(10))]);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db.wal");
        let mut wal = Wal::open(&path).unwrap();

        wal.append(&WalRecord::insert("t", id(1), 0)).unwrap();
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(br#"{"op":"insert","tab"#).unwrap();

        assert_eq!(
            wal.read_all().unwrap(),
            vec![WalRecord::insert("t", id(1), 0)]
        );
    }

    #[test]
    fn test_torn_tail_inside_utf8_sequence_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db.wal");
        let mut wal = Wal::open(&path).unwrap();

        wal.append(&WalRecord::insert("utilisateurs", id(1), 0)).unwrap();
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"{\"op\":\"insert\",\"table\":\"caf\xC3").unwrap();

        assert_eq!(
            wal.read_all().unwrap(),
            vec![WalRecord::insert("utilisateurs", id(1), 0)]
        );
    }

    #[test]
    fn test_invalid_utf8_in_middle_record_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db.wal");
        let mut bytes = b"{\"op\":\"delete\",\"table\":\"caf\xC3\"}\n".to_vec();
        bytes.extend_from_slice(
            b"{\"op\":\"delete\",\"table\":\"t\",\"id\":\"00000000000000000000000000000001\"}\n",
        );
        fs::write(&path, bytes).unwrap();

        let wal = Wal::open(&path).unwrap();
        match wal.read_all() {
            Err(StorageError::CorruptWal { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected CorruptWal, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_middle_record_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db.wal");
        fs::write(
            &path,
            "garbage\n{\"op\":\"delete\",\"table\":\"t\",\"id\":\"00000000000000000000000000000001\"}\n",
        )
        .unwrap();

        let wal = Wal::open(&path).unwrap();
        match wal.read_all() {
            Err(StorageError::CorruptWal { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected CorruptWal, got {:?}", other),
        }
    }
}
