//! The index file speeds up reads. It maps segment-relative record offsets
//! to the position of the record in the store file, so reading a record is
//! a two-step process: look up the entry for the offset, then read the
//! store at the position the entry points to.

use crate::IndexResult;
use crate::errors::IndexError;
use crate::storage::IndexContext;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::{debug, instrument, warn};

// Each index entry: 4-byte relative offset + 8-byte store position
const OFFSET_WIDTH: u64 = 4;
const POSITION_WIDTH: u64 = 8;
pub const ENTRY_WIDTH: u64 = OFFSET_WIDTH + POSITION_WIDTH;

/// Index provides fast lookups from segment-relative offsets to byte
/// positions in the Store. The file is memory-mapped at its maximum size
/// up front; the logical size (bytes of live entries) is tracked
/// separately and the file is shrunk back to it on close so the next open
/// recovers the entry count.
///
/// Format: [4-byte offset][8-byte position][4-byte offset][8-byte position]
pub struct Index {
    file: File,
    mmap: MmapMut,
    size: u64, // live bytes, always a multiple of ENTRY_WIDTH
}

impl Index {
    #[instrument(skip_all, fields(path = ?path.as_ref()))]
    /// Opens the index at the given file path, creating it if needed. The
    /// file is grown to `max_index_bytes` for the mapping.
    pub fn open(path: impl AsRef<Path>, max_index_bytes: u64) -> IndexResult<Self> {
        let path_str = path.as_ref().to_string_lossy().into_owned();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())
            .with_open_context(&path_str)?;

        let mut file_len = file.metadata().with_open_context(&path_str)?.len();

        debug!(existing_size = file_len, "Index file opened");

        // A crashed close can leave a torn trailing entry
        if file_len % ENTRY_WIDTH != 0 {
            warn!(
                file_size = file_len,
                entry_width = ENTRY_WIDTH,
                "Index file size is not a multiple of entry size - truncating"
            );

            let valid_size = (file_len / ENTRY_WIDTH) * ENTRY_WIDTH;
            file.set_len(valid_size)
                .map_err(|e| IndexError::CorruptedFile {
                    reason: format!("failed to truncate torn index file: {e}"),
                })?;

            file_len = valid_size;
        }

        let map_size = std::cmp::max(file_len, max_index_bytes);
        file.set_len(map_size).with_open_context(&path_str)?;

        let mmap = unsafe {
            MmapOptions::new()
                .len(map_size as usize)
                .map_mut(&file)
                .with_mmap_context(map_size)?
        };

        debug!(
            live_bytes = file_len,
            map_size,
            entries = file_len / ENTRY_WIDTH,
            "Index mapped"
        );

        Ok(Index {
            file,
            mmap,
            size: file_len,
        })
    }

    /// Reads entry `n`, or the last entry when `n` is -1. Fails with
    /// [`IndexError::Eof`] when the index is empty or `n` is out of range.
    pub fn read(&self, n: i64) -> IndexResult<(u32, u64)> {
        if self.size == 0 {
            return Err(IndexError::Eof);
        }

        let entries = self.size / ENTRY_WIDTH;
        let entry = if n == -1 { entries - 1 } else { n as u64 };
        if n < -1 || entry >= entries {
            return Err(IndexError::Eof);
        }

        let pos = (entry * ENTRY_WIDTH) as usize;
        let off = u32::from_be_bytes(
            self.mmap[pos..pos + OFFSET_WIDTH as usize]
                .try_into()
                .expect("entry slice is OFFSET_WIDTH bytes"),
        );
        let position = u64::from_be_bytes(
            self.mmap[pos + OFFSET_WIDTH as usize..pos + ENTRY_WIDTH as usize]
                .try_into()
                .expect("entry slice is POSITION_WIDTH bytes"),
        );

        Ok((off, position))
    }

    /// Appends an entry. Fails with [`IndexError::Eof`] when the mapped
    /// region is exhausted, which signals segment rollover to the caller.
    pub fn write(&mut self, off: u32, position: u64) -> IndexResult<()> {
        if self.size + ENTRY_WIDTH > self.mmap.len() as u64 {
            return Err(IndexError::Eof);
        }

        let pos = self.size as usize;
        self.mmap[pos..pos + OFFSET_WIDTH as usize].copy_from_slice(&off.to_be_bytes());
        self.mmap[pos + OFFSET_WIDTH as usize..pos + ENTRY_WIDTH as usize]
            .copy_from_slice(&position.to_be_bytes());
        self.size += ENTRY_WIDTH;

        Ok(())
    }

    /// Drops every entry at and after `entries`. Used by consensus to
    /// discard conflicting entries.
    pub fn truncate(&mut self, entries: u64) {
        let new_size = entries * ENTRY_WIDTH;
        if new_size < self.size {
            self.size = new_size;
        }
    }

    /// Return the number of entries in the index
    pub fn len(&self) -> u64 {
        self.size / ENTRY_WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Return live size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Flushes the mapped region and truncates the file to its logical
    /// size so the next open sizes the map correctly.
    pub fn close(self) -> IndexResult<()> {
        self.mmap.flush().with_close_context()?;
        drop(self.mmap);
        self.file.set_len(self.size).with_close_context()?;
        self.file.sync_all().with_close_context()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAX_INDEX_BYTES: u64 = 1024;

    #[test]
    fn test_index_write_read() -> IndexResult<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rw.index");

        let mut index = Index::open(&path, MAX_INDEX_BYTES)?;

        assert!(matches!(index.read(-1), Err(IndexError::Eof)));

        let entries = [(0u32, 0u64), (1, 19), (2, 38)];
        for (off, pos) in entries {
            index.write(off, pos)?;
        }

        for (i, (off, pos)) in entries.iter().enumerate() {
            let (got_off, got_pos) = index.read(i as i64)?;
            assert_eq!(got_off, *off);
            assert_eq!(got_pos, *pos);
        }

        // -1 reads the last entry
        assert_eq!(index.read(-1)?, (2, 38));
        // out of range
        assert!(matches!(index.read(3), Err(IndexError::Eof)));

        Ok(())
    }

    #[test]
    fn test_index_full() -> IndexResult<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("full.index");

        // room for exactly three entries
        let mut index = Index::open(&path, 3 * ENTRY_WIDTH)?;
        for i in 0..3 {
            index.write(i, u64::from(i) * 19)?;
        }

        assert!(matches!(index.write(3, 57), Err(IndexError::Eof)));

        Ok(())
    }

    #[test]
    fn test_index_recovers_entry_count_after_close() -> IndexResult<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("reopen.index");

        {
            let mut index = Index::open(&path, MAX_INDEX_BYTES)?;
            index.write(0, 0)?;
            index.write(1, 27)?;
            index.close()?;
        }

        // close shrank the file, so reopening recovers the count
        let index = Index::open(&path, MAX_INDEX_BYTES)?;
        assert_eq!(index.len(), 2);
        assert_eq!(index.read(-1)?, (1, 27));

        Ok(())
    }

    #[test]
    fn test_index_truncate() -> IndexResult<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("trunc.index");

        let mut index = Index::open(&path, MAX_INDEX_BYTES)?;
        for i in 0..5u32 {
            index.write(i, u64::from(i))?;
        }

        index.truncate(2);
        assert_eq!(index.len(), 2);
        assert_eq!(index.read(-1)?, (1, 1));
        assert!(matches!(index.read(2), Err(IndexError::Eof)));

        Ok(())
    }
}
