use crate::StorageResult;
use crate::errors::StorageError;
use crate::storage::StorageContext;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, instrument};

/// The length of each record is stored as a big-endian u64 before the record.
pub const LEN_WIDTH: u64 = 8;

/// Store is the append-only file that holds the actual log records.
///
/// Format: [8-byte length][record data][8-byte length][record data]
///
/// Appends go through a buffered writer; reads flush the buffer first so
/// they observe everything appended so far. The writer sits behind a mutex
/// so reads can flush through a shared reference; appends are serialized
/// by the owning log's write lock.
pub struct Store {
    file: File,
    writer: Mutex<BufWriter<File>>,
    size: u64,
}

impl Store {
    #[instrument(skip_all, fields(path = ?path.as_ref()))]
    /// Opens the store at the given file path, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path_str = path.as_ref().to_string_lossy().into_owned();

        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(path.as_ref())
            .with_open_context(&path_str)?;

        let size = file.metadata().with_open_context(&path_str)?.len();
        let writer = Mutex::new(BufWriter::new(
            file.try_clone().with_open_context(&path_str)?,
        ));

        debug!(existing_size = size, "Store file opened");

        Ok(Store { file, writer, size })
    }

    /// Appends a record and returns the number of bytes written and the
    /// position where the record starts.
    #[instrument(skip(self, data), fields(data_len = data.len()))]
    pub fn append(&mut self, data: &[u8]) -> StorageResult<(u64, u64)> {
        let pos = self.size;

        let mut writer = self.writer.lock();
        writer
            .write_all(&(data.len() as u64).to_be_bytes())
            .with_write_context(pos)?;
        writer.write_all(data).with_write_context(pos)?;
        drop(writer);

        let written = LEN_WIDTH + data.len() as u64;
        self.size += written;

        debug!(position = pos, bytes_written = written, "Record appended");

        Ok((written, pos))
    }

    /// Reads the record stored at the given position.
    #[instrument(skip(self))]
    pub fn read(&self, position: u64) -> StorageResult<Vec<u8>> {
        self.flush()?;

        if position + LEN_WIDTH > self.size {
            return Err(StorageError::ReadBeyondEnd {
                position,
                size: self.size,
            });
        }

        let mut len_buf = [0u8; LEN_WIDTH as usize];
        self.file
            .read_exact_at(&mut len_buf, position)
            .with_read_context(position)?;
        let len = u64::from_be_bytes(len_buf);

        let mut data = vec![0u8; len as usize];
        self.file
            .read_exact_at(&mut data, position + LEN_WIDTH)
            .with_read_context(position)?;

        Ok(data)
    }

    /// Positional read into `buf` starting at `offset` in the file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<usize> {
        self.flush()?;
        self.file
            .read_exact_at(buf, offset)
            .with_read_context(offset)?;
        Ok(buf.len())
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.writer.lock().flush().with_flush_context()
    }

    /// Drops everything at and after `size`. The next append continues from
    /// there. Used by consensus to discard conflicting entries.
    pub fn truncate(&mut self, size: u64) -> StorageResult<()> {
        self.flush()?;
        self.file.set_len(size).with_truncate_context(size)?;
        self.size = size;
        Ok(())
    }

    /// Returns the current size of the store in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Flushes outstanding writes and closes the file.
    pub fn close(self) -> StorageResult<()> {
        self.flush()?;
        self.file.sync_all().with_flush_context()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_append_read() -> StorageResult<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("append_read.store");

        let mut store = Store::open(&path)?;

        let data = b"hello world";
        let (written, pos) = store.append(data)?;
        assert_eq!(pos, 0);
        assert_eq!(written, LEN_WIDTH + data.len() as u64);

        let read = store.read(pos)?;
        assert_eq!(read, data);

        // size is the sum of length prefixes and payloads
        assert_eq!(store.size(), written);

        Ok(())
    }

    #[test]
    fn test_store_reads_observe_buffered_writes() -> StorageResult<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("buffered.store");

        let mut store = Store::open(&path)?;

        let mut positions = Vec::new();
        for record in [&b"first"[..], b"second", b"third"] {
            let (_, pos) = store.append(record)?;
            positions.push(pos);
        }

        // none of these were explicitly flushed
        assert_eq!(store.read(positions[0])?, b"first");
        assert_eq!(store.read(positions[1])?, b"second");
        assert_eq!(store.read(positions[2])?, b"third");

        Ok(())
    }

    #[test]
    fn test_store_persists_across_reopen() -> StorageResult<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("reopen.store");

        let pos = {
            let mut store = Store::open(&path)?;
            let (_, pos) = store.append(b"durable")?;
            store.close()?;
            pos
        };

        let store = Store::open(&path)?;
        assert_eq!(store.read(pos)?, b"durable");

        Ok(())
    }

    #[test]
    fn test_store_read_beyond_end() -> StorageResult<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("beyond.store");

        let mut store = Store::open(&path)?;
        store.append(b"x")?;

        assert!(matches!(
            store.read(1024),
            Err(StorageError::ReadBeyondEnd { position: 1024, .. })
        ));

        Ok(())
    }

    #[test]
    fn test_store_truncate() -> StorageResult<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("truncate.store");

        let mut store = Store::open(&path)?;
        let (_, first) = store.append(b"keep")?;
        let (_, second) = store.append(b"drop")?;

        store.truncate(second)?;
        assert_eq!(store.size(), second);
        assert_eq!(store.read(first)?, b"keep");
        assert!(store.read(second).is_err());

        // appends continue from the truncation point
        let (_, pos) = store.append(b"new")?;
        assert_eq!(pos, second);
        assert_eq!(store.read(pos)?, b"new");

        Ok(())
    }
}
