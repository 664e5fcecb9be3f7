use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cell::{CellTimestamp, StoredCell, WriteBatch};
use crate::error::{StoreError, StoreResult};

/// One durable log record.
///
/// On-disk format:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized WalRecord)]
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    /// A batch as it was applied, with the timestamp it was given.
    Batch {
        timestamp: CellTimestamp,
        batch: WriteBatch,
    },
    /// Full store contents written by compaction.
    Snapshot { cells: Vec<StoredCell> },
}

/// Flush/sync strategy for the log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every record.
    EveryWrite,
    /// Flush to the OS and rely on page-cache buffering.
    #[default]
    OsDefault,
}

/// Configuration for the write-ahead log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Log size in bytes above which the durable store compacts (default: 64 MiB).
    pub compact_threshold: u64,
    pub sync_mode: SyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            compact_threshold: 64 * 1024 * 1024,
            sync_mode: SyncMode::default(),
        }
    }
}

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

struct WalWriter {
    writer: BufWriter<File>,
    /// Current write offset in the log file.
    offset: u64,
}

/// Crash-recoverable write-ahead log of applied batches.
///
/// Records are framed with a length prefix and a CRC32 checksum. Recovery
/// reads front-to-back: a record failing its CRC is skipped, a torn tail
/// stops recovery.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    config: WalConfig,
}

impl WriteAheadLog {
    /// Open (or create) the log file at the given path.
    pub fn open(path: &Path, config: WalConfig) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let offset = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                writer: BufWriter::new(file),
                offset,
            }),
            config,
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, WalWriter>> {
        self.writer
            .lock()
            .map_err(|e| StoreError::LockPoisoned(format!("wal: {e}")))
    }

    fn encode(record: &WalRecord) -> StoreResult<Vec<u8>> {
        bincode::serialize(record).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn write_frame(&self, w: &mut WalWriter, payload: &[u8]) -> StoreResult<u64> {
        let entry_offset = w.offset;
        let length = payload.len() as u32;
        let crc = crc32fast::hash(payload);

        w.writer.write_all(&length.to_le_bytes())?;
        w.writer.write_all(&crc.to_le_bytes())?;
        w.writer.write_all(payload)?;
        w.writer.flush()?;
        if self.config.sync_mode == SyncMode::EveryWrite {
            w.writer.get_ref().sync_all()?;
        }

        w.offset += HEADER_SIZE as u64 + payload.len() as u64;
        Ok(entry_offset)
    }

    /// Append a record. Returns the byte offset it was written at.
    pub fn append(&self, record: &WalRecord) -> StoreResult<u64> {
        let payload = Self::encode(record)?;
        let mut w = self.lock()?;
        let offset = self.write_frame(&mut w, &payload)?;
        debug!(offset, len = payload.len(), "wal append");
        Ok(offset)
    }

    /// Recover every valid record, in write order.
    pub fn recover(&self) -> StoreResult<Vec<WalRecord>> {
        let mut file = BufReader::new(File::open(&self.path)?);
        let file_len = file.get_ref().metadata()?.len();
        let mut records = Vec::new();
        let mut offset: u64 = 0;

        while offset + HEADER_SIZE as u64 <= file_len {
            file.seek(SeekFrom::Start(offset))?;

            let mut header = [0u8; HEADER_SIZE];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            if length == 0 || (offset + HEADER_SIZE as u64 + length as u64) > file_len {
                warn!(offset, length, file_len, "invalid wal record length; stopping recovery");
                break;
            }

            let mut payload = vec![0u8; length as usize];
            match file.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!(offset, "truncated wal record; stopping recovery");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let actual_crc = crc32fast::hash(&payload);
            if actual_crc != expected_crc {
                warn!(offset, expected = expected_crc, actual = actual_crc, "crc mismatch; skipping record");
                offset += HEADER_SIZE as u64 + length as u64;
                continue;
            }

            match bincode::deserialize::<WalRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(e) => warn!(offset, error = %e, "undecodable wal record; skipping"),
            }

            offset += HEADER_SIZE as u64 + length as u64;
        }

        debug!(recovered = records.len(), "wal recovery complete");
        Ok(records)
    }

    /// Replace the whole log with a single record.
    ///
    /// The new content is written to a sibling file and renamed over the log,
    /// so a crash leaves either the old or the new log in place.
    pub fn rewrite(&self, record: &WalRecord) -> StoreResult<()> {
        let payload = Self::encode(record)?;
        let mut w = self.lock()?;

        let tmp_path = self.path.with_extension("compact");
        {
            let tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut tmp_writer = WalWriter {
                writer: BufWriter::new(tmp),
                offset: 0,
            };
            self.write_frame(&mut tmp_writer, &payload)?;
            tmp_writer.writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        let offset = file.metadata()?.len();
        w.writer = BufWriter::new(file);
        w.offset = offset;

        debug!(offset, "wal rewritten");
        Ok(())
    }

    /// Current write offset (log size in bytes).
    pub fn offset(&self) -> StoreResult<u64> {
        Ok(self.lock()?.offset)
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish()
    }
}
