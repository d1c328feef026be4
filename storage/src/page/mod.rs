use crate::{Result, StorageError};

pub const PAGE_SIZE: usize = 4096;

/// Zero-based page address within the row file.
pub type PageNumber = u64;

/// One fixed-size slot of the row file.
///
/// A page holds at most one payload, written from offset 0 and right-padded
/// with zero bytes. Payloads never end in a zero byte (JSON text always
/// ends in `}`), so stripping trailing zeros recovers the payload exactly.
#[repr(C, align(8))]
#[derive(Clone)]
pub struct Page {
    data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn empty() -> Self {
        Self {
            data: [0; PAGE_SIZE],
        }
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() > PAGE_SIZE {
            return Err(StorageError::OversizedPayload {
                size: payload.len(),
                max: PAGE_SIZE,
            });
        }

        let mut page = Self::empty();
        page.data[..payload.len()].copy_from_slice(payload);
        Ok(page)
    }

    pub fn from_bytes(bytes: &[u8; PAGE_SIZE]) -> Self {
        Self { data: *bytes }
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    /// Page content with the zero padding stripped.
    pub fn payload(&self) -> &[u8] {
        let end = self
            .data
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |last| last + 1);
        &self.data[..end]
    }

    pub fn is_blank(&self) -> bool {
        self.payload().is_empty()
    }

    pub fn fill_percentage(&self) -> f32 {
        (self.payload().len() as f32 / PAGE_SIZE as f32) * 100.0
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("payload_len", &self.payload().len())
            .finish()
    }
}
