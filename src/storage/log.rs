//! The log is an ordered collection of segments that presents a single
//! continuous sequence of offsets. It routes reads to the right segment,
//! rolls the active segment when it maxes out, and truncates whole
//! segments from the front.

use crate::LogResult;
use crate::api::v1::Record;
use crate::errors::{LogError, SegmentError};
use crate::storage::Config;
use crate::storage::segment::Segment;
use crate::storage::store::LEN_WIDTH;
use parking_lot::RwLock;
use prost::Message;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, info, instrument};

/// Log manages multiple segments behind a single read-write lock.
/// The active segment is always the last one.
pub struct Log {
    dir: PathBuf,
    config: Config,
    inner: RwLock<Inner>,
    notify: Notify,
}

struct Inner {
    segments: Vec<Segment>,
    closed: bool,
}

impl Inner {
    fn active(&mut self) -> &mut Segment {
        self.segments
            .last_mut()
            .expect("an open log always has an active segment")
    }
}

impl Log {
    #[instrument(skip_all, fields(dir = ?dir.as_ref()))]
    pub fn new(dir: impl AsRef<Path>, config: Config) -> LogResult<Self> {
        let dir = dir.as_ref().to_path_buf();

        fs::create_dir_all(&dir).map_err(|source| LogError::DirectoryError {
            path: dir.to_string_lossy().into_owned(),
            source,
        })?;

        let mut base_offsets = Self::scan_base_offsets(&dir)?;
        base_offsets.sort_unstable();
        base_offsets.dedup();

        let mut segments = Vec::with_capacity(base_offsets.len().max(1));
        for base_offset in base_offsets {
            segments.push(Segment::new(&dir, base_offset, config.segment)?);
        }

        if segments.is_empty() {
            segments.push(Segment::new(
                &dir,
                config.segment.initial_offset,
                config.segment,
            )?);
        }

        info!(
            segments_count = segments.len(),
            next_offset = segments.last().map(|s| s.next_offset()),
            "Log opened"
        );

        Ok(Log {
            dir,
            config,
            inner: RwLock::new(Inner {
                segments,
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Base offsets recovered from the segment file names in `dir`.
    fn scan_base_offsets(dir: &Path) -> LogResult<Vec<u64>> {
        let entries = fs::read_dir(dir).map_err(|source| LogError::DirectoryError {
            path: dir.to_string_lossy().into_owned(),
            source,
        })?;

        let mut base_offsets = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| LogError::DirectoryError {
                path: dir.to_string_lossy().into_owned(),
                source,
            })?;
            let path = entry.path();
            // store and index files share the base offset, count each once
            if path.extension().is_some_and(|ext| ext == "store")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && let Ok(base_offset) = stem.parse::<u64>()
            {
                base_offsets.push(base_offset);
            }
        }
        Ok(base_offsets)
    }

    /// Appends the record and returns its assigned offset.
    #[instrument(skip(self, record), fields(data_len = record.value.len()))]
    pub fn append(&self, record: &mut Record) -> LogResult<u64> {
        let offset = {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(LogError::Closed);
            }

            // a reopened log can come back with a maxed active segment
            if inner.active().is_maxed() {
                self.roll(&mut inner)?;
            }

            let offset = inner.active().append(record)?;

            if inner.active().is_maxed() {
                self.roll(&mut inner)?;
            }
            offset
        };

        // wake tailing consumers once the lock is released
        self.notify.notify_waiters();

        Ok(offset)
    }

    /// Reads the record stored at the given offset.
    #[instrument(skip(self))]
    pub fn read(&self, offset: u64) -> LogResult<Record> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(LogError::Closed);
        }

        // first segment whose range could contain the offset
        let idx = inner
            .segments
            .partition_point(|s| s.base_offset() <= offset);
        let segment = idx
            .checked_sub(1)
            .map(|i| &inner.segments[i])
            .filter(|s| s.contains_offset(offset))
            .ok_or(LogError::OffsetOutOfRange { offset })?;

        match segment.read(offset) {
            Ok(record) => Ok(record),
            Err(SegmentError::OffsetOutOfRange { offset, .. }) => {
                Err(LogError::OffsetOutOfRange { offset })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the first offset present in the log.
    pub fn lowest_offset(&self) -> LogResult<u64> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(LogError::Closed);
        }
        Ok(inner.segments[0].base_offset())
    }

    /// Returns the last assigned offset, or `None` when nothing has been
    /// appended yet.
    pub fn highest_offset(&self) -> LogResult<Option<u64>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(LogError::Closed);
        }

        let first_base = inner.segments[0].base_offset();
        let next = inner
            .segments
            .last()
            .expect("an open log always has an active segment")
            .next_offset();

        // segments are contiguous, so an all-empty chain collapses
        Ok(if next == first_base {
            None
        } else {
            Some(next - 1)
        })
    }

    /// Removes every segment whose records all fall at or below `lowest`.
    /// Surviving segments are kept whole; the active segment always
    /// survives.
    #[instrument(skip(self))]
    pub fn truncate(&self, lowest: u64) -> LogResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(LogError::Closed);
        }

        let segments = std::mem::take(&mut inner.segments);
        let count = segments.len();
        for (i, segment) in segments.into_iter().enumerate() {
            let active = i == count - 1;
            if !active && segment.next_offset() <= lowest.saturating_add(1) {
                debug!(
                    base_offset = segment.base_offset(),
                    "Removing truncated segment"
                );
                segment.remove()?;
            } else {
                inner.segments.push(segment);
            }
        }

        info!(lowest, remaining = inner.segments.len(), "Log truncated");
        Ok(())
    }

    /// Drops every record at and after `offset`. Whole trailing segments
    /// are deleted, the segment containing `offset` is cut down, and an
    /// empty log is left when everything goes. Used by consensus to
    /// discard entries that conflict with the leader.
    pub fn truncate_from(&self, offset: u64) -> LogResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(LogError::Closed);
        }

        while inner.segments.len() > 1
            && inner
                .segments
                .last()
                .is_some_and(|s| s.base_offset() >= offset)
        {
            let segment = inner.segments.pop().expect("len checked above");
            segment.remove()?;
        }

        let active = inner.active();
        if active.contains_offset(offset) {
            active.truncate_from(offset)?;
        }

        Ok(())
    }

    /// Returns a reader over the raw length-prefixed record stream of
    /// every segment in order. Used for snapshotting.
    pub fn reader(&self) -> LogResult<LogReader> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(LogError::Closed);
        }

        let mut files = VecDeque::with_capacity(inner.segments.len());
        for segment in &inner.segments {
            segment.flush()?;
            files.push_back(
                File::open(segment.store_path())
                    .map_err(|source| LogError::ReaderFailed { source })?,
            );
        }
        Ok(LogReader { files })
    }

    /// Closes and deletes every segment, then reinitializes the log as if
    /// it had been opened on an empty directory.
    pub fn reset(&self) -> LogResult<()> {
        self.reset_to(self.config.segment.initial_offset)
    }

    /// Like [`Log::reset`] but the fresh log starts at `initial_offset`.
    pub fn reset_to(&self, initial_offset: u64) -> LogResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(LogError::Closed);
        }
        self.reset_locked(&mut inner, initial_offset)?;
        Ok(())
    }

    /// Atomically replaces the whole log with the length-prefixed record
    /// stream read from `reader`. No read observes a partially restored
    /// log: the write lock is held across the reset and every append.
    pub fn restore_from(&self, reader: &mut impl Read) -> LogResult<u64> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(LogError::Closed);
        }

        self.reset_locked(&mut inner, self.config.segment.initial_offset)?;

        let mut count = 0u64;
        loop {
            let mut len_buf = [0u8; LEN_WIDTH as usize];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(source) => return Err(LogError::ReaderFailed { source }),
            }

            let len = u64::from_be_bytes(len_buf);
            let mut data = vec![0u8; len as usize];
            reader
                .read_exact(&mut data)
                .map_err(|source| LogError::ReaderFailed { source })?;

            let next = inner.active().next_offset();
            let mut record = Record::decode(&data[..])
                .map_err(|source| SegmentError::Decode {
                    offset: next,
                    source,
                })
                .map_err(LogError::from)?;

            if inner.active().is_maxed() {
                self.roll(&mut inner)?;
            }
            inner.active().append(&mut record)?;
            count += 1;
        }

        info!(records = count, "Log restored from snapshot stream");
        Ok(count)
    }

    /// Closes every segment. Further operations fail with
    /// [`LogError::Closed`].
    pub fn close(&self) -> LogResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        for segment in inner.segments.drain(..) {
            segment.close()?;
        }
        Ok(())
    }

    /// Closes the log and deletes its directory.
    pub fn remove(&self) -> LogResult<()> {
        self.close()?;
        fs::remove_dir_all(&self.dir).map_err(|source| LogError::DirectoryError {
            path: self.dir.to_string_lossy().into_owned(),
            source,
        })
    }

    /// A future that resolves after the next successful append. Grab it
    /// before re-checking the offset you are waiting for.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> Config {
        self.config
    }

    fn roll(&self, inner: &mut Inner) -> LogResult<()> {
        let base_offset = inner.active().next_offset();
        debug!(base_offset, "Rolling to a new segment");
        let segment = Segment::new(&self.dir, base_offset, self.config.segment)?;
        inner.segments.push(segment);
        Ok(())
    }

    fn reset_locked(&self, inner: &mut Inner, initial_offset: u64) -> LogResult<()> {
        for segment in inner.segments.drain(..) {
            segment.remove()?;
        }
        inner
            .segments
            .push(Segment::new(&self.dir, initial_offset, self.config.segment)?);
        Ok(())
    }
}

/// Concatenates the store files of every segment into one byte stream.
pub struct LogReader {
    files: VecDeque<File>,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some(file) = self.files.front_mut() {
            let n = file.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.files.pop_front();
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(value: &[u8]) -> Record {
        Record {
            value: value.to_vec(),
            ..Default::default()
        }
    }

    fn small_segment_config() -> Config {
        let mut config = Config::default();
        config.segment.max_store_bytes = 32;
        config
    }

    #[test]
    fn test_append_read_one() -> LogResult<()> {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), Config::default())?;

        let mut rec = record(b"hello world");
        let offset = log.append(&mut rec)?;
        assert_eq!(offset, 0);

        let read = log.read(0)?;
        assert_eq!(read.value, b"hello world");

        Ok(())
    }

    #[test]
    fn test_offset_out_of_range() -> LogResult<()> {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), Config::default())?;

        assert!(matches!(
            log.read(1),
            Err(LogError::OffsetOutOfRange { offset: 1 })
        ));

        Ok(())
    }

    #[test]
    fn test_segment_rollover_preserves_reads() -> LogResult<()> {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config())?;

        for i in 0..3u64 {
            let offset = log.append(&mut record(b"hello world"))?;
            assert_eq!(offset, i);
        }

        let stores = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "store"))
            .count();
        assert!(stores >= 2, "expected rollover, got {stores} store file(s)");

        for i in 0..3u64 {
            assert_eq!(log.read(i)?.value, b"hello world");
        }

        Ok(())
    }

    #[test]
    fn test_init_existing() -> LogResult<()> {
        let dir = TempDir::new().unwrap();

        {
            let log = Log::new(dir.path(), small_segment_config())?;
            for _ in 0..3 {
                log.append(&mut record(b"hello world"))?;
            }
            assert_eq!(log.lowest_offset()?, 0);
            assert_eq!(log.highest_offset()?, Some(2));
            log.close()?;
        }

        let log = Log::new(dir.path(), small_segment_config())?;
        assert_eq!(log.lowest_offset()?, 0);
        assert_eq!(log.highest_offset()?, Some(2));
        for i in 0..3u64 {
            assert_eq!(log.read(i)?.value, b"hello world");
        }

        Ok(())
    }

    #[test]
    fn test_highest_offset_empty() -> LogResult<()> {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), Config::default())?;
        assert_eq!(log.highest_offset()?, None);
        Ok(())
    }

    #[test]
    fn test_initial_offset() -> LogResult<()> {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.segment.initial_offset = 10;

        let log = Log::new(dir.path(), config)?;
        assert_eq!(log.append(&mut record(b"first"))?, 10);
        assert_eq!(log.lowest_offset()?, 10);

        Ok(())
    }

    #[test]
    fn test_truncate() -> LogResult<()> {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config())?;

        for _ in 0..3 {
            log.append(&mut record(b"hello world"))?;
        }

        log.truncate(1)?;

        assert!(matches!(
            log.read(0),
            Err(LogError::OffsetOutOfRange { offset: 0 })
        ));
        assert_eq!(log.read(2)?.value, b"hello world");

        Ok(())
    }

    #[test]
    fn test_truncate_from() -> LogResult<()> {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config())?;

        for i in 0..5u64 {
            log.append(&mut record(format!("rec-{i}").as_bytes()))?;
        }

        log.truncate_from(2)?;
        assert_eq!(log.highest_offset()?, Some(1));
        assert!(log.read(2).is_err());
        assert_eq!(log.read(1)?.value, b"rec-1");

        // appends continue from the cut
        assert_eq!(log.append(&mut record(b"replacement"))?, 2);
        assert_eq!(log.read(2)?.value, b"replacement");

        Ok(())
    }

    #[test]
    fn test_reader_reproduces_appended_stream() -> LogResult<()> {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config())?;

        let values: [&[u8]; 3] = [b"hello world", b"second rec", b"third entry"];
        for value in values {
            log.append(&mut record(value))?;
        }

        let mut bytes = Vec::new();
        log.reader()?.read_to_end(&mut bytes).unwrap();

        // parse back the raw length-prefixed stream
        let mut parsed = Vec::new();
        let mut at = 0usize;
        while at < bytes.len() {
            let len = u64::from_be_bytes(bytes[at..at + 8].try_into().unwrap()) as usize;
            at += 8;
            let rec = Record::decode(&bytes[at..at + len]).unwrap();
            parsed.push(rec.value);
            at += len;
        }

        assert_eq!(parsed, values.map(|v| v.to_vec()).to_vec());

        Ok(())
    }

    #[test]
    fn test_restore_from_reader() -> LogResult<()> {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), small_segment_config())?;
        for i in 0..3u64 {
            log.append(&mut record(format!("snap-{i}").as_bytes()))?;
        }

        let mut stream = Vec::new();
        log.reader()?.read_to_end(&mut stream).unwrap();

        let restore_dir = TempDir::new().unwrap();
        let restored = Log::new(restore_dir.path(), small_segment_config())?;
        restored.append(&mut record(b"will be discarded"))?;

        let count = restored.restore_from(&mut &stream[..])?;
        assert_eq!(count, 3);
        assert_eq!(restored.highest_offset()?, Some(2));
        for i in 0..3u64 {
            assert_eq!(restored.read(i)?.value, format!("snap-{i}").as_bytes());
        }

        Ok(())
    }

    #[test]
    fn test_closed_log_rejects_operations() -> LogResult<()> {
        let dir = TempDir::new().unwrap();
        let log = Log::new(dir.path(), Config::default())?;
        log.append(&mut record(b"x"))?;
        log.close()?;

        assert!(matches!(log.read(0), Err(LogError::Closed)));
        assert!(matches!(
            log.append(&mut record(b"y")),
            Err(LogError::Closed)
        ));

        Ok(())
    }
}
