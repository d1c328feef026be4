//! Storage engine for SealDB
//!
//! This crate provides the paged row file, the at-rest encryption layer,
//! the per-table indexes, the redo log and the [`Database`] session that
//! ties them together with a crash-recovery protocol.

pub mod catalog;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod file;
pub mod index;
pub mod page;
pub mod row;
pub mod wal;

pub use catalog::{Catalog, MetadataDocument, TableMeta};
pub use config::DbConfig;
pub use crypto::{CryptoContext, Envelope};
pub use engine::{Database, DatabasePaths};
pub use file::{PageFile, SessionLock};
pub use index::TableIndex;
pub use page::{Page, PageNumber, PAGE_SIZE};
pub use row::RowStore;
pub use sealdb_core::{Row, RowId, Value};
pub use wal::{Wal, WalOp, WalRecord};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Payload of {size} bytes exceeds page size {max}")]
    OversizedPayload { size: usize, max: usize },

    #[error("Row on page {page} is corrupt: {reason}")]
    CorruptRow { page: PageNumber, reason: String },

    #[error("Authentication failed: wrong passphrase or tampered data")]
    AuthenticationFailure,

    #[error("Page {0} not found")]
    PageNotFound(PageNumber),

    #[error("WAL record on line {line} is corrupt: {source}")]
    CorruptWal {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Metadata document {} is corrupt: {source}", .path.display())]
    CorruptMetadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Salt file {} is invalid: {reason}", .path.display())]
    InvalidSalt { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Database {} is already open in another session", .0.display())]
    Locked(PathBuf),

    #[error("Session is unusable after a failed log or metadata write; reopen the database")]
    Poisoned,

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
