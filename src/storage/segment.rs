//! Segment combines the Store and Index to provide a logical log segment.
//! Each segment owns a contiguous range of offsets and coordinates storing
//! record data and indexing it.

use crate::SegmentResult;
use crate::api::v1::Record;
use crate::errors::{IndexError, SegmentError};
use crate::storage::SegmentConfig;
use crate::storage::index::Index;
use crate::storage::store::Store;
use prost::Message;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

pub struct Segment {
    store: Store,
    index: Index,
    store_path: PathBuf,
    index_path: PathBuf,
    base_offset: u64, // First offset in this segment
    next_offset: u64,
    config: SegmentConfig,
}

impl Segment {
    #[instrument(skip_all, fields(base_offset))]
    pub fn new(dir: impl AsRef<Path>, base_offset: u64, config: SegmentConfig) -> SegmentResult<Self> {
        let store_path = dir.as_ref().join(format!("{base_offset:020}.store"));
        let index_path = dir.as_ref().join(format!("{base_offset:020}.index"));

        let store = Store::open(&store_path)?;
        let index = Index::open(&index_path, config.max_index_bytes)?;

        // recover next_offset from the last index entry
        let next_offset = match index.read(-1) {
            Ok((rel, _)) => base_offset + u64::from(rel) + 1,
            Err(IndexError::Eof) => base_offset,
            Err(e) => return Err(e.into()),
        };

        debug!(
            base_offset,
            next_offset,
            store_size = store.size(),
            index_entries = index.len(),
            "Segment opened"
        );

        Ok(Segment {
            store,
            index,
            store_path,
            index_path,
            base_offset,
            next_offset,
            config,
        })
    }

    /// Appends the record, assigns its offset, and returns it. Fails with
    /// [`SegmentError::Maxed`] when the segment is full; the caller rolls
    /// to a new segment.
    #[instrument(skip(self, record), fields(data_len = record.value.len()))]
    pub fn append(&mut self, record: &mut Record) -> SegmentResult<u64> {
        if self.is_maxed() {
            return Err(SegmentError::Maxed {
                base_offset: self.base_offset,
            });
        }

        let offset = self.next_offset;
        record.offset = offset;

        let data = record.encode_to_vec();
        let (_, position) = self.store.append(&data)?;
        self.index
            .write((offset - self.base_offset) as u32, position)?;

        self.next_offset += 1;

        debug!(offset, position, "Record appended to segment");

        Ok(offset)
    }

    /// Reads the record for the given absolute offset.
    pub fn read(&self, offset: u64) -> SegmentResult<Record> {
        if !self.contains_offset(offset) {
            return Err(SegmentError::OffsetOutOfRange {
                offset,
                base_offset: self.base_offset,
                next_offset: self.next_offset,
            });
        }

        let (_, position) = self.index.read((offset - self.base_offset) as i64)?;
        let data = self.store.read(position)?;

        Record::decode(&data[..]).map_err(|source| SegmentError::Decode { offset, source })
    }

    /// Returns true if the offset is within the segment's range
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.base_offset && offset < self.next_offset
    }

    /// Returns true when the store or the index has reached its
    /// configured limit and the segment should be rolled.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() >= self.config.max_index_bytes
    }

    /// Drops every record at and after `offset`.
    pub(crate) fn truncate_from(&mut self, offset: u64) -> SegmentResult<()> {
        if !self.contains_offset(offset) {
            return Err(SegmentError::OffsetOutOfRange {
                offset,
                base_offset: self.base_offset,
                next_offset: self.next_offset,
            });
        }

        let rel = offset - self.base_offset;
        let (_, position) = self.index.read(rel as i64)?;
        self.store.truncate(position)?;
        self.index.truncate(rel);
        self.next_offset = offset;
        Ok(())
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Returns the next offset that would be assigned
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn store_size(&self) -> u64 {
        self.store.size()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Flushes buffered store writes to the OS.
    pub fn flush(&self) -> SegmentResult<()> {
        self.store.flush()?;
        Ok(())
    }

    /// Closes both files.
    pub fn close(self) -> SegmentResult<()> {
        self.store.close()?;
        self.index.close()?;
        Ok(())
    }

    /// Closes the segment and deletes both files.
    pub fn remove(self) -> SegmentResult<()> {
        let store_path = self.store_path.clone();
        let index_path = self.index_path.clone();
        self.close()?;

        for path in [store_path, index_path] {
            fs::remove_file(&path).map_err(|source| SegmentError::RemoveFailed {
                path: path.to_string_lossy().into_owned(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::index::ENTRY_WIDTH;
    use std::sync::Once;
    use tempfile::TempDir;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT_TRACING: Once = Once::new();

    fn init_tracing() {
        INIT_TRACING.call_once(|| {
            let _ = fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
                )
                .with_test_writer()
                .try_init();
        });
    }

    fn record(value: &[u8]) -> Record {
        Record {
            value: value.to_vec(),
            ..Default::default()
        }
    }

    fn config(max_store_bytes: u64, max_index_bytes: u64) -> SegmentConfig {
        SegmentConfig {
            max_store_bytes,
            max_index_bytes,
            initial_offset: 0,
        }
    }

    #[test]
    fn test_segment_append_and_read() -> SegmentResult<()> {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();

        let mut segment = Segment::new(temp_dir.path(), 16, config(1024, 1024))?;
        assert_eq!(segment.next_offset(), 16);

        let mut rec = record(b"hello world");
        let offset = segment.append(&mut rec)?;
        assert_eq!(offset, 16);
        assert_eq!(rec.offset, 16);

        let read = segment.read(offset)?;
        assert_eq!(read.value, b"hello world");
        assert_eq!(read.offset, 16);

        Ok(())
    }

    #[test]
    fn test_segment_offset_bounds_checking() -> SegmentResult<()> {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();

        let mut segment = Segment::new(temp_dir.path(), 50, config(1024, 1024))?;
        segment.append(&mut record(b"only"))?;

        assert!(segment.contains_offset(50));
        assert!(!segment.contains_offset(49));
        assert!(!segment.contains_offset(51));

        assert!(matches!(
            segment.read(49),
            Err(SegmentError::OffsetOutOfRange { offset: 49, .. })
        ));
        assert!(matches!(
            segment.read(51),
            Err(SegmentError::OffsetOutOfRange { offset: 51, .. })
        ));

        Ok(())
    }

    #[test]
    fn test_segment_maxed_by_index() -> SegmentResult<()> {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();

        // room for exactly three index entries
        let mut segment = Segment::new(temp_dir.path(), 0, config(1024, 3 * ENTRY_WIDTH))?;

        for i in 0..3 {
            assert!(!segment.is_maxed());
            segment.append(&mut record(format!("record-{i}").as_bytes()))?;
        }

        assert!(segment.is_maxed());
        assert!(matches!(
            segment.append(&mut record(b"overflow")),
            Err(SegmentError::Maxed { base_offset: 0 })
        ));

        Ok(())
    }

    #[test]
    fn test_segment_maxed_by_store() -> SegmentResult<()> {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();

        let mut segment = Segment::new(temp_dir.path(), 0, config(32, 1024))?;
        segment.append(&mut record(b"a record big enough to max"))?;

        assert!(segment.is_maxed());

        Ok(())
    }

    #[test]
    fn test_segment_persistence() -> SegmentResult<()> {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let values: [&[u8]; 3] = [b"persistent", b"data", b"test"];

        {
            let mut segment = Segment::new(temp_dir.path(), 200, config(1024, 1024))?;
            for value in values {
                segment.append(&mut record(value))?;
            }
            segment.close()?;
        }

        let mut segment = Segment::new(temp_dir.path(), 200, config(1024, 1024))?;
        assert_eq!(segment.next_offset(), 203);
        for (i, value) in values.iter().enumerate() {
            assert_eq!(segment.read(200 + i as u64)?.value, *value);
        }

        Ok(())
    }

    #[test]
    fn test_segment_remove() -> SegmentResult<()> {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();

        let mut segment = Segment::new(temp_dir.path(), 0, config(1024, 1024))?;
        segment.append(&mut record(b"gone"))?;

        let store_path = segment.store_path().to_path_buf();
        segment.remove()?;
        assert!(!store_path.exists());

        Ok(())
    }
}
