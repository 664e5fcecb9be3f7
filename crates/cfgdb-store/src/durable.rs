use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::cell::{Cell, CellTimestamp, ColumnRange, WriteBatch};
use crate::error::{StoreError, StoreResult};
use crate::memory::InMemoryCellStore;
use crate::traits::CellStore;
use crate::wal::{WalConfig, WalRecord, WriteAheadLog};

/// File name of the log inside a durable store directory.
pub const WAL_FILE: &str = "cells.wal";

/// Cell store persisted through a write-ahead log.
///
/// Reads are served from an in-memory copy. Each batch is appended to the log
/// before it becomes visible; a batch whose log append fails is not applied.
/// Opening the store replays the log. When the log grows past
/// [`WalConfig::compact_threshold`] it is rewritten as a single snapshot.
pub struct DurableCellStore {
    dir: PathBuf,
    cells: InMemoryCellStore,
    wal: WriteAheadLog,
    commit: Mutex<()>,
}

impl DurableCellStore {
    /// Open (or create) a store in `dir`, replaying any existing log.
    pub fn open(dir: &Path, config: WalConfig) -> StoreResult<Self> {
        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config)?;
        let cells = InMemoryCellStore::new();

        let records = wal.recover()?;
        let replayed = records.len();
        for record in records {
            match record {
                WalRecord::Batch { timestamp, batch } => cells.apply_at(&batch, timestamp)?,
                WalRecord::Snapshot { cells: snapshot } => {
                    cells.clear()?;
                    cells.restore(snapshot)?;
                }
            }
        }

        info!(dir = %dir.display(), records = replayed, "durable store opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            cells,
            wal,
            commit: Mutex::new(()),
        })
    }

    fn lock_commit(&self) -> StoreResult<MutexGuard<'_, ()>> {
        self.commit
            .lock()
            .map_err(|e| StoreError::LockPoisoned(format!("durable commit: {e}")))
    }

    /// Rewrite the log as one snapshot of the current contents.
    pub fn compact(&self) -> StoreResult<()> {
        let _guard = self.lock_commit()?;
        self.compact_locked()
    }

    fn compact_locked(&self) -> StoreResult<()> {
        let cells = self.cells.snapshot()?;
        let count = cells.len();
        self.wal.rewrite(&WalRecord::Snapshot { cells })?;
        debug!(cells = count, "wal compacted");
        Ok(())
    }

    /// Directory holding the log.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The materialized in-memory view.
    pub fn cells(&self) -> &InMemoryCellStore {
        &self.cells
    }
}

impl CellStore for DurableCellStore {
    fn get(&self, table: &str, row: &str, column: &str) -> StoreResult<Option<Cell>> {
        self.cells.get(table, row, column)
    }

    fn read_row(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnRange,
    ) -> StoreResult<Vec<(String, Cell)>> {
        self.cells.read_row(table, row, columns)
    }

    fn first_cell(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnRange,
    ) -> StoreResult<Option<(String, Cell)>> {
        self.cells.first_cell(table, row, columns)
    }

    fn last_cell(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnRange,
    ) -> StoreResult<Option<(String, Cell)>> {
        self.cells.last_cell(table, row, columns)
    }

    fn row_exists(&self, table: &str, row: &str) -> StoreResult<bool> {
        self.cells.row_exists(table, row)
    }

    fn list_rows(&self, table: &str, after: Option<&str>, limit: usize) -> StoreResult<Vec<String>> {
        self.cells.list_rows(table, after, limit)
    }

    fn list_tables(&self) -> StoreResult<Vec<String>> {
        self.cells.list_tables()
    }

    fn apply(&self, batch: WriteBatch) -> StoreResult<CellTimestamp> {
        let _guard = self.lock_commit()?;
        let timestamp = self.cells.apply_with(&batch, |timestamp| {
            self.wal
                .append(&WalRecord::Batch { timestamp, batch: batch.clone() })
                .map(|_| ())
        })?;

        if self.wal.offset()? > self.wal.config().compact_threshold {
            self.compact_locked()?;
        }
        Ok(timestamp)
    }
}

impl std::fmt::Debug for DurableCellStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableCellStore")
            .field("dir", &self.dir)
            .field("cells", &self.cells)
            .finish()
    }
}
