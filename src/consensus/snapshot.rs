//! File-based snapshot store under `DataDir/raft/snapshots`. Snapshots are
//! written to a temp file and renamed into place so a crash never leaves a
//! half-written snapshot behind.

use crate::ConsensusResult;
use crate::errors::ConsensusError;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub term: u64,
    pub index: u64,
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> ConsensusResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| ConsensusError::Snapshot { source })?;
        Ok(Self { dir })
    }

    /// Writes a snapshot covering everything up to `meta.index`.
    #[instrument(skip(self, reader))]
    pub fn create(&self, meta: SnapshotMeta, reader: &mut impl Read) -> ConsensusResult<()> {
        let tmp_path = self.dir.join(".snapshot.tmp");
        let final_path = self.path_for(meta);

        let result: io::Result<()> = (|| {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            io::copy(reader, &mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            fs::rename(&tmp_path, &final_path)
        })();

        result.map_err(|source| ConsensusError::Snapshot { source })?;

        debug!(term = meta.term, index = meta.index, "Snapshot written");
        Ok(())
    }

    /// Opens the snapshot covering the most entries, if any exists.
    pub fn latest(&self) -> ConsensusResult<Option<(SnapshotMeta, File)>> {
        let entries = fs::read_dir(&self.dir).map_err(|source| ConsensusError::Snapshot { source })?;

        let mut newest: Option<SnapshotMeta> = None;
        for entry in entries {
            let entry = entry.map_err(|source| ConsensusError::Snapshot { source })?;
            let Some(meta) = Self::parse_name(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            if newest.is_none_or(|n| (meta.index, meta.term) > (n.index, n.term)) {
                newest = Some(meta);
            }
        }

        match newest {
            None => Ok(None),
            Some(meta) => {
                let file = File::open(self.path_for(meta))
                    .map_err(|source| ConsensusError::Snapshot { source })?;
                Ok(Some((meta, file)))
            }
        }
    }

    fn path_for(&self, meta: SnapshotMeta) -> PathBuf {
        self.dir
            .join(format!("{:020}-{:020}.snap", meta.term, meta.index))
    }

    fn parse_name(name: &str) -> Option<SnapshotMeta> {
        let stem = name.strip_suffix(".snap")?;
        let (term, index) = stem.split_once('-')?;
        Some(SnapshotMeta {
            term: term.parse().ok()?,
            index: index.parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_store_has_no_latest() -> ConsensusResult<()> {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path())?;
        assert!(store.latest()?.is_none());
        Ok(())
    }

    #[test]
    fn test_create_and_open_latest() -> ConsensusResult<()> {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path())?;

        store.create(SnapshotMeta { term: 1, index: 3 }, &mut &b"old"[..])?;
        store.create(SnapshotMeta { term: 2, index: 9 }, &mut &b"newer state"[..])?;

        let (meta, mut file) = store.latest()?.expect("a snapshot was written");
        assert_eq!(meta, SnapshotMeta { term: 2, index: 9 });

        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"newer state");

        Ok(())
    }
}
