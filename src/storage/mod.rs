use crate::errors::IndexError;
use crate::errors::StorageError;
use crate::{IndexResult, StorageResult};
use std::io;

pub mod index;
pub mod log;
pub mod segment;
pub mod store;

/// Limits and initial offset for the segments of a log.
#[derive(Debug, Clone, Copy)]
pub struct SegmentConfig {
    /// Store rollover threshold in bytes
    pub max_store_bytes: u64,
    /// Index rollover threshold in bytes (12 bytes per entry)
    pub max_index_bytes: u64,
    /// First offset assigned to a fresh log
    pub initial_offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub segment: SegmentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment: SegmentConfig {
                max_store_bytes: 1024 * 1024,
                max_index_bytes: 1024 * 1024,
                initial_offset: 0,
            },
        }
    }
}

pub trait StorageContext<T> {
    fn with_open_context(self, path: &str) -> StorageResult<T>;
    fn with_write_context(self, position: u64) -> StorageResult<T>;
    fn with_read_context(self, position: u64) -> StorageResult<T>;
    fn with_flush_context(self) -> StorageResult<T>;
    fn with_truncate_context(self, size: u64) -> StorageResult<T>;
}

impl<T> StorageContext<T> for Result<T, io::Error> {
    fn with_open_context(self, path: &str) -> StorageResult<T> {
        self.map_err(|source| StorageError::OpenFailed {
            path: path.to_string(),
            source,
        })
    }

    fn with_write_context(self, position: u64) -> StorageResult<T> {
        self.map_err(|source| StorageError::WriteFailed { position, source })
    }

    fn with_read_context(self, position: u64) -> StorageResult<T> {
        self.map_err(|source| StorageError::ReadFailed { position, source })
    }

    fn with_flush_context(self) -> StorageResult<T> {
        self.map_err(|source| StorageError::FlushFailed { source })
    }

    fn with_truncate_context(self, size: u64) -> StorageResult<T> {
        self.map_err(|source| StorageError::TruncateFailed { size, source })
    }
}

pub trait IndexContext<T> {
    fn with_open_context(self, path: &str) -> IndexResult<T>;
    fn with_mmap_context(self, size: u64) -> IndexResult<T>;
    fn with_close_context(self) -> IndexResult<T>;
}

impl<T> IndexContext<T> for Result<T, io::Error> {
    fn with_open_context(self, path: &str) -> IndexResult<T> {
        self.map_err(|source| IndexError::OpenFailed {
            path: path.to_string(),
            source,
        })
    }

    fn with_mmap_context(self, size: u64) -> IndexResult<T> {
        self.map_err(|source| IndexError::MmapFailed { size, source })
    }

    fn with_close_context(self) -> IndexResult<T> {
        self.map_err(|source| IndexError::CloseFailed { source })
    }
}
