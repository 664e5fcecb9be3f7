//! Whole-store JSON export and import.
//!
//! Dumps nest cells as `tables -> rows -> columns` and keep write
//! timestamps, so staleness markers survive a round trip through a file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cell::{CellTimestamp, ColumnRange, StoredCell};
use crate::error::{StoreError, StoreResult};
use crate::memory::InMemoryCellStore;
use crate::traits::CellStore;

pub const DUMP_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpCell {
    pub value: String,
    pub timestamp: CellTimestamp,
}

type DumpTables = BTreeMap<String, BTreeMap<String, BTreeMap<String, DumpCell>>>;

/// Serializable image of a cell store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDump {
    pub version: u32,
    pub tables: DumpTables,
}

impl StoreDump {
    pub fn from_cells(cells: Vec<StoredCell>) -> Self {
        let mut tables: DumpTables = BTreeMap::new();
        for c in cells {
            tables
                .entry(c.table)
                .or_default()
                .entry(c.row)
                .or_default()
                .insert(c.column, DumpCell { value: c.value, timestamp: c.timestamp });
        }
        Self { version: DUMP_VERSION, tables }
    }

    pub fn into_cells(self) -> Vec<StoredCell> {
        let mut cells = Vec::new();
        for (table, rows) in self.tables {
            for (row, columns) in rows {
                for (column, cell) in columns {
                    cells.push(StoredCell {
                        table: table.clone(),
                        row: row.clone(),
                        column,
                        value: cell.value,
                        timestamp: cell.timestamp,
                    });
                }
            }
        }
        cells
    }

    /// Capture the current contents of any store by walking every table.
    pub fn capture(store: &dyn CellStore) -> StoreResult<Self> {
        const PAGE: usize = 1024;
        let mut cells = Vec::new();
        for table in store.list_tables()? {
            let mut after: Option<String> = None;
            loop {
                let rows = store.list_rows(&table, after.as_deref(), PAGE)?;
                for row in &rows {
                    for (column, cell) in store.read_row(&table, row, &ColumnRange::All)? {
                        cells.push(StoredCell {
                            table: table.clone(),
                            row: row.clone(),
                            column,
                            value: cell.value,
                            timestamp: cell.timestamp,
                        });
                    }
                }
                if rows.len() < PAGE {
                    break;
                }
                after = rows.last().cloned();
            }
        }
        Ok(Self::from_cells(cells))
    }

    /// Build an in-memory store holding the dumped cells.
    pub fn into_store(self) -> StoreResult<InMemoryCellStore> {
        let store = InMemoryCellStore::new();
        store.restore(self.into_cells())?;
        Ok(store)
    }

    pub fn cell_count(&self) -> usize {
        self.tables
            .values()
            .flat_map(|rows| rows.values())
            .map(|cols| cols.len())
            .sum()
    }

    pub fn read_from(path: &Path) -> StoreResult<Self> {
        let text = fs::read_to_string(path)?;
        let dump: Self =
            serde_json::from_str(&text).map_err(|e| StoreError::Serialization(e.to_string()))?;
        if dump.version != DUMP_VERSION {
            return Err(StoreError::Serialization(format!(
                "unsupported dump version {} (expected {DUMP_VERSION})",
                dump.version
            )));
        }
        info!(path = %path.display(), cells = dump.cell_count(), "loaded store dump");
        Ok(dump)
    }

    pub fn write_to(&self, path: &Path) -> StoreResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(path, text)?;
        info!(path = %path.display(), cells = self.cell_count(), "wrote store dump");
        Ok(())
    }
}
