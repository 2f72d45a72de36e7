use crate::message::LogEntry;
use borsh::{BorshDeserialize, BorshSerialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const WAL_DIR: &str = "wal";
const SNAP_DIR: &str = "snap";
const STATE_FILE: &str = "state";
const LOG_FILE: &str = "log";
const SNAPSHOT_FILE: &str = "snapshot";

/// Term and vote, persisted before any message that could contradict them.
#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct HardState {
    pub term: u64,
    pub voted_for: u64,
}

/// Log compaction point. The snapshot does not carry state itself: the ledger
/// height references blocks that any peer can serve, so a lagging node
/// restores by fetching and replaying those blocks.
#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub last_index: u64,
    pub last_term: u64,
    pub ledger_height: u64,
}

/// Raft persistence: `wal/state` (hard state), `wal/log` (entries after the
/// snapshot point) and `snap/snapshot`. Rewrites go through a temp file and
/// rename; the log is append-only between truncations.
pub(crate) struct RaftStorage {
    wal_dir: PathBuf,
    snap_dir: PathBuf,
    log_writer: File,
    log_size: u64,
}

impl RaftStorage {
    pub(crate) fn open(
        raft_dir: &Path,
    ) -> std::io::Result<(Self, HardState, Snapshot, Vec<LogEntry>)> {
        let wal_dir = raft_dir.join(WAL_DIR);
        let snap_dir = raft_dir.join(SNAP_DIR);
        std::fs::create_dir_all(&wal_dir)?;
        std::fs::create_dir_all(&snap_dir)?;

        let hard_state = read_record(&wal_dir.join(STATE_FILE))?.unwrap_or_default();
        let snapshot = read_record(&snap_dir.join(SNAPSHOT_FILE))?.unwrap_or_default();
        let entries = read_log(&wal_dir.join(LOG_FILE), snapshot.last_index)?;

        let log_writer =
            OpenOptions::new().append(true).create(true).open(wal_dir.join(LOG_FILE))?;
        let log_size = log_writer.metadata()?.len();
        Ok((RaftStorage { wal_dir, snap_dir, log_writer, log_size }, hard_state, snapshot, entries))
    }

    pub(crate) fn persist_hard_state(&self, hard_state: &HardState) -> std::io::Result<()> {
        write_record(&self.wal_dir.join(STATE_FILE), hard_state)
    }

    pub(crate) fn append_entry(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        let data = borsh::to_vec(entry).expect("borsh serialization should not fail");
        let mut buf = Vec::with_capacity(4 + data.len());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&data);
        self.log_writer.write_all(&buf)?;
        self.log_writer.sync_data()?;
        self.log_size += buf.len() as u64;
        Ok(())
    }

    /// Replaces the on-disk log wholesale. Used when entries conflict with a
    /// new leader's log and on compaction.
    pub(crate) fn rewrite_log(&mut self, entries: &[LogEntry]) -> std::io::Result<()> {
        let path = self.wal_dir.join(LOG_FILE);
        let tmp = self.wal_dir.join(format!("{LOG_FILE}.tmp"));
        let mut file = File::create(&tmp)?;
        let mut size = 0u64;
        for entry in entries {
            let data = borsh::to_vec(entry).expect("borsh serialization should not fail");
            file.write_all(&(data.len() as u32).to_le_bytes())?;
            file.write_all(&data)?;
            size += 4 + data.len() as u64;
        }
        file.sync_data()?;
        std::fs::rename(&tmp, &path)?;
        self.log_writer = OpenOptions::new().append(true).open(&path)?;
        self.log_size = size;
        Ok(())
    }

    pub(crate) fn persist_snapshot(&self, snapshot: &Snapshot) -> std::io::Result<()> {
        write_record(&self.snap_dir.join(SNAPSHOT_FILE), snapshot)
    }

    pub(crate) fn log_size(&self) -> u64 {
        self.log_size
    }
}

fn write_record<T: BorshSerialize>(path: &Path, record: &T) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&borsh::to_vec(record).expect("borsh serialization should not fail"))?;
    file.sync_data()?;
    std::fs::rename(&tmp, path)
}

fn read_record<T: BorshDeserialize>(path: &Path) -> std::io::Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => match borsh::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(target: "replication", path = %path.display(), %err,
                      "discarding unreadable raft record");
                Ok(None)
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Reads the log, dropping a torn tail record and any entries already covered
/// by the snapshot.
fn read_log(path: &Path, snapshot_index: u64) -> std::io::Result<Vec<LogEntry>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err),
    };
    let mut data = vec![];
    file.read_to_end(&mut data)?;

    let mut entries = vec![];
    let mut pos = 0usize;
    while pos + 4 <= data.len() {
        let len = u32::from_le_bytes(data[pos..pos + 4].try_into().expect("fixed slice")) as usize;
        if pos + 4 + len > data.len() {
            warn!(target: "replication", "truncated tail record in raft log");
            break;
        }
        match borsh::from_slice::<LogEntry>(&data[pos + 4..pos + 4 + len]) {
            Ok(entry) => {
                if entry.index > snapshot_index {
                    entries.push(entry);
                }
            }
            Err(err) => {
                warn!(target: "replication", %err, "undecodable raft log entry, truncating");
                break;
            }
        }
        pos += 4 + len;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_primitives::block::{Block, BlockHeader, BlockPayload};

    fn entry(index: u64, term: u64) -> LogEntry {
        let mut header = BlockHeader::default();
        header.base_header.number = index;
        LogEntry { index, term, block: Block { header, payload: BlockPayload::DataTxs(vec![]) } }
    }

    #[test]
    fn state_log_and_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut storage, hard_state, snapshot, entries) =
                RaftStorage::open(dir.path()).unwrap();
            assert_eq!(hard_state, HardState::default());
            assert_eq!(snapshot, Snapshot::default());
            assert!(entries.is_empty());

            storage.persist_hard_state(&HardState { term: 3, voted_for: 2 }).unwrap();
            storage.append_entry(&entry(1, 1)).unwrap();
            storage.append_entry(&entry(2, 3)).unwrap();
        }
        let (_, hard_state, _, entries) = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(hard_state, HardState { term: 3, voted_for: 2 });
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].term, 3);
    }

    #[test]
    fn snapshot_filters_compacted_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut storage, _, _, _) = RaftStorage::open(dir.path()).unwrap();
            for index in 1..=4 {
                storage.append_entry(&entry(index, 1)).unwrap();
            }
            storage
                .persist_snapshot(&Snapshot { last_index: 2, last_term: 1, ledger_height: 2 })
                .unwrap();
        }
        let (_, _, snapshot, entries) = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(snapshot.last_index, 2);
        let indexes: Vec<u64> = entries.iter().map(|entry| entry.index).collect();
        assert_eq!(indexes, vec![3, 4]);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut storage, _, _, _) = RaftStorage::open(dir.path()).unwrap();
            storage.append_entry(&entry(1, 1)).unwrap();
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(WAL_DIR).join(LOG_FILE))
            .unwrap();
        file.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let (_, _, _, entries) = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn rewrite_replaces_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut storage, _, _, _) = RaftStorage::open(dir.path()).unwrap();
            for index in 1..=3 {
                storage.append_entry(&entry(index, 1)).unwrap();
            }
            storage.rewrite_log(&[entry(1, 1), entry(2, 2)]).unwrap();
            storage.append_entry(&entry(3, 2)).unwrap();
        }
        let (_, _, _, entries) = RaftStorage::open(dir.path()).unwrap();
        let terms: Vec<u64> = entries.iter().map(|entry| entry.term).collect();
        assert_eq!(terms, vec![1, 2, 2]);
    }
}
