use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::raft::entry::LogEntry;
use crate::raft::segment::Segment;

const HARD_STATE_FILE: &str = "hardstate";
const LOG_SEGMENT_FILE: &str = "segment_1.log";

/// Raft state that must survive a restart alongside the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<u64>,
}

/// Durable home of a node's term, vote and log.
pub trait LogStorage: Send + Sync {
    fn load(&mut self) -> Result<(HardState, Vec<LogEntry>)>;

    fn save_hard_state(&mut self, hs: HardState) -> Result<()>;

    /// Appends entries that follow the last stored one.
    fn append(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Drops the entry at `index` (1-based) and every later one.
    fn truncate_from(&mut self, index: u64) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemStorage {
    hard_state: HardState,
    entries: Vec<LogEntry>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStorage for MemStorage {
    fn load(&mut self) -> Result<(HardState, Vec<LogEntry>)> {
        Ok((self.hard_state, self.entries.clone()))
    }

    fn save_hard_state(&mut self, hs: HardState) -> Result<()> {
        self.hard_state = hs;
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> Result<()> {
        self.entries.truncate(index.saturating_sub(1) as usize);
        Ok(())
    }
}

/// Hard state in a small bincode file replaced atomically, log in one segment file.
pub struct FileStorage {
    base_path: PathBuf,
    segment: Segment,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        let segment = Segment::new(base_path.join(LOG_SEGMENT_FILE), 1)?;
        Ok(FileStorage { base_path, segment })
    }
}

impl LogStorage for FileStorage {
    fn load(&mut self) -> Result<(HardState, Vec<LogEntry>)> {
        let hs_path = self.base_path.join(HARD_STATE_FILE);
        let hard_state = if hs_path.exists() {
            bincode::deserialize(&fs::read(&hs_path)?)?
        } else {
            HardState::default()
        };

        let mut entries = Vec::new();
        if !self.segment.is_empty() {
            for index in self.segment.get_start_index()..=self.segment.get_end_index() {
                let data = self.segment.read_entry(index)?;
                entries.push(bincode::deserialize(&data)?);
            }
        }
        log::info!(
            "loaded raft state from {}: term {}, {} entries",
            self.base_path.display(),
            hard_state.term,
            entries.len()
        );
        Ok((hard_state, entries))
    }

    fn save_hard_state(&mut self, hs: HardState) -> Result<()> {
        let data = bincode::serialize(&hs)?;
        let temp_path = self.base_path.join(format!("{}.tmp", HARD_STATE_FILE));
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.base_path.join(HARD_STATE_FILE))?;
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        let records = entries
            .iter()
            .map(|entry| bincode::serialize(entry))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.segment.append(&records)?;
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> Result<()> {
        self.segment.truncate_from(index)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FileMetadata;
    use tempfile::tempdir;

    fn entry(term: u64, name: &str, version: u64) -> LogEntry {
        LogEntry::new(term, FileMetadata::new(name, version, vec![format!("{name}-{version}")]))
    }

    #[test]
    fn mem_storage_truncates() {
        let mut storage = MemStorage::new();
        storage
            .append(&[entry(1, "a", 1), entry(1, "a", 2), entry(2, "b", 1)])
            .unwrap();
        storage.truncate_from(2).unwrap();
        let (_, log) = storage.load().unwrap();
        assert_eq!(log, vec![entry(1, "a", 1)]);
    }

    #[test]
    fn file_storage_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage
                .save_hard_state(HardState {
                    term: 3,
                    voted_for: Some(1),
                })
                .unwrap();
            storage
                .append(&[entry(1, "a", 1), entry(2, "a", 2), entry(3, "b", 1)])
                .unwrap();
            storage.truncate_from(3).unwrap();
            storage.append(&[entry(3, "c", 1)]).unwrap();
        }

        let mut storage = FileStorage::new(dir.path()).unwrap();
        let (hs, log) = storage.load().unwrap();
        assert_eq!(hs.term, 3);
        assert_eq!(hs.voted_for, Some(1));
        assert_eq!(log, vec![entry(1, "a", 1), entry(2, "a", 2), entry(3, "c", 1)]);
    }

    #[test]
    fn fresh_file_storage_is_empty() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let (hs, log) = storage.load().unwrap();
        assert_eq!(hs, HardState::default());
        assert!(log.is_empty());
    }
}
