// storage/src/file/mod.rs

mod lock;

pub use lock::SessionLock;

use crate::page::{Page, PageNumber, PAGE_SIZE};
use crate::{Result, StorageError};
use log::trace;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Creates the parent directory of `path` if it has one and it is missing.
pub(crate) fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Raw fixed-size page I/O over a single file.
///
/// The file has no header: page `n` lives at byte offset `n * PAGE_SIZE`.
/// The page count is derived from the file length, so it survives restarts
/// without any bookkeeping.
pub struct PageFile {
    file: File,
    path: PathBuf,
    sync_on_write: bool,
}

impl PageFile {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(StorageError::Io)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            sync_on_write: false,
        })
    }

    /// Makes every page write wait for `sync_data`.
    pub fn with_sync(mut self, sync_on_write: bool) -> Self {
        self.sync_on_write = sync_on_write;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `data` at the start of page `page_no`, zero-padding the rest.
    pub fn write_page(&mut self, page_no: PageNumber, data: &[u8]) -> Result<()> {
        let page = Page::from_payload(data)?;

        self.file
            .seek(SeekFrom::Start(Self::page_offset(page_no)))
            .map_err(StorageError::Io)?;
        self.file
            .write_all(page.as_bytes())
            .map_err(StorageError::Io)?;

        if self.sync_on_write {
            self.file.sync_data().map_err(StorageError::Io)?;
        }

        trace!("wrote page {} ({} payload bytes)", page_no, data.len());
        Ok(())
    }

    pub fn read_page(&mut self, page_no: PageNumber) -> Result<Page> {
        if page_no >= self.page_count()? {
            return Err(StorageError::PageNotFound(page_no));
        }

        self.file
            .seek(SeekFrom::Start(Self::page_offset(page_no)))
            .map_err(StorageError::Io)?;

        // A torn final page reads short; the missing tail stays zero.
        let mut page = Page::empty();
        let buffer = page.as_bytes_mut();
        let mut filled = 0;
        while filled < PAGE_SIZE {
            match self.file.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StorageError::Io(e)),
            }
        }

        Ok(page)
    }

    /// Claims the next page number by writing an empty page there.
    ///
    /// Numbers are handed out in order and never reused: the claimed page
    /// extends the file, so the next call sees a larger page count.
    pub fn allocate_page(&mut self) -> Result<PageNumber> {
        let page_no = self.page_count()?;
        self.write_page(page_no, &[])?;
        Ok(page_no)
    }

    /// Number of pages in the file, counting a partial trailing page.
    pub fn page_count(&self) -> Result<u64> {
        let size = self.file.metadata().map_err(StorageError::Io)?.len();
        Ok(size.div_ceil(PAGE_SIZE as u64))
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(StorageError::Io)
    }

    fn page_offset(page_no: PageNumber) -> u64 {
        page_no * PAGE_SIZE as u64
    }
}
