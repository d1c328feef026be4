use crate::crypto::{CryptoContext, Envelope};
use crate::file::PageFile;
use crate::page::{PageNumber, PAGE_SIZE};
use crate::{Result, StorageError};
use log::trace;
use sealdb_core::Row;

/// Serializes rows into pages, one row per page.
///
/// Rows are stored as compact JSON. With a [`CryptoContext`] the JSON is
/// sealed and the page holds the JSON-encoded [`Envelope`] instead.
pub struct RowStore {
    pager: PageFile,
    crypto: Option<CryptoContext>,
}

impl RowStore {
    pub fn new(pager: PageFile, crypto: Option<CryptoContext>) -> Self {
        Self { pager, crypto }
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some()
    }

    /// Writes `row` to a freshly allocated page.
    ///
    /// The payload is encoded and size-checked first, so an oversized row
    /// never claims a page.
    pub fn write_row(&mut self, row: &Row) -> Result<PageNumber> {
        let payload = self.encode(row)?;
        let page_no = self.pager.allocate_page()?;
        self.pager.write_page(page_no, &payload)?;
        trace!("row written to page {}", page_no);
        Ok(page_no)
    }

    /// Overwrites page `page_no` in place. Re-encrypts under a new nonce.
    pub fn update_page(&mut self, page_no: PageNumber, row: &Row) -> Result<()> {
        let payload = self.encode(row)?;
        self.pager.write_page(page_no, &payload)?;
        trace!("row rewritten on page {}", page_no);
        Ok(())
    }

    pub fn read_row(&mut self, page_no: PageNumber) -> Result<Row> {
        let page = self.pager.read_page(page_no)?;
        let raw = page.payload();

        // Claimed by allocate_page but never written
        if raw.is_empty() {
            return Ok(Row::new());
        }

        let corrupt = |e: serde_json::Error| StorageError::CorruptRow {
            page: page_no,
            reason: e.to_string(),
        };

        match &self.crypto {
            Some(crypto) => {
                let envelope: Envelope = serde_json::from_slice(raw).map_err(corrupt)?;
                let plaintext = crypto.decrypt(&envelope)?;
                serde_json::from_slice(&plaintext).map_err(corrupt)
            }
            None => serde_json::from_slice(raw).map_err(corrupt),
        }
    }

    pub fn page_count(&self) -> Result<u64> {
        self.pager.page_count()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.pager.sync()
    }

    fn encode(&self, row: &Row) -> Result<Vec<u8>> {
        let data = serde_json::to_vec(row)?;

        let payload = match &self.crypto {
            Some(crypto) => serde_json::to_vec(&crypto.encrypt(&data)?)?,
            None => data,
        };

        if payload.len() > PAGE_SIZE {
            return Err(StorageError::OversizedPayload {
                size: payload.len(),
                max: PAGE_SIZE,
            });
        }

        Ok(payload)
    }
}
