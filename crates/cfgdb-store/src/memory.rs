use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::cell::{BatchOp, Cell, CellTimestamp, ColumnRange, StoredCell, WriteBatch};
use crate::clock::CellClock;
use crate::error::{StoreError, StoreResult};
use crate::traits::CellStore;

type Row = BTreeMap<String, Cell>;
type Table = BTreeMap<String, Row>;
type Tables = BTreeMap<String, Table>;

/// In-memory, BTreeMap-based cell store.
///
/// Intended for tests, embedding, and as the materialized view behind the
/// durable store. Tables, rows and columns are all kept ordered so range and
/// prefix scans are direct map ranges.
pub struct InMemoryCellStore {
    tables: RwLock<Tables>,
    clock: CellClock,
}

impl InMemoryCellStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
            clock: CellClock::new(),
        }
    }

    fn read_tables(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    fn write_tables(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    /// Total number of cells across all tables.
    pub fn cell_count(&self) -> StoreResult<usize> {
        Ok(self
            .read_tables()?
            .values()
            .flat_map(|t| t.values())
            .map(|r| r.len())
            .sum())
    }

    /// Returns `true` if the store holds no cells.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.read_tables()?.is_empty())
    }

    /// Remove every cell.
    pub fn clear(&self) -> StoreResult<()> {
        self.write_tables()?.clear();
        Ok(())
    }

    /// Export every cell with its timestamp, ordered by table, row, column.
    pub fn snapshot(&self) -> StoreResult<Vec<StoredCell>> {
        let tables = self.read_tables()?;
        let mut cells = Vec::new();
        for (table, rows) in tables.iter() {
            for (row, columns) in rows {
                for (column, cell) in columns {
                    cells.push(StoredCell {
                        table: table.clone(),
                        row: row.clone(),
                        column: column.clone(),
                        value: cell.value.clone(),
                        timestamp: cell.timestamp,
                    });
                }
            }
        }
        Ok(cells)
    }

    /// Insert cells with their recorded timestamps, overwriting existing ones.
    ///
    /// The clock is advanced past every restored timestamp.
    pub fn restore(&self, cells: Vec<StoredCell>) -> StoreResult<()> {
        let mut tables = self.write_tables()?;
        let count = cells.len();
        for c in cells {
            self.clock.observe(c.timestamp)?;
            tables
                .entry(c.table)
                .or_default()
                .entry(c.row)
                .or_default()
                .insert(c.column, Cell { value: c.value, timestamp: c.timestamp });
        }
        debug!(cells = count, "restored cells");
        Ok(())
    }

    /// Seek the first or last cell of a row selection.
    fn edge_cell(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnRange,
        last: bool,
    ) -> StoreResult<Option<(String, Cell)>> {
        let tables = self.read_tables()?;
        let Some(cells) = tables.get(table).and_then(|rows| rows.get(row)) else {
            return Ok(None);
        };
        let Some((lower, upper)) = columns.bounds() else {
            return Ok(None);
        };
        let mut range = cells.range::<str, _>((lower, upper.as_ref().map(String::as_str)));
        let found = if last { range.next_back() } else { range.next() };
        Ok(found.map(|(k, c)| (k.clone(), c.clone())))
    }

    /// Apply a batch with an already-assigned timestamp (log replay).
    pub(crate) fn apply_at(&self, batch: &WriteBatch, timestamp: CellTimestamp) -> StoreResult<()> {
        self.clock.observe(timestamp)?;
        let mut tables = self.write_tables()?;
        apply_ops(&mut tables, batch, timestamp);
        Ok(())
    }

    /// Apply a batch, calling `before_commit` with its timestamp while the
    /// write lock is held. A failed condition or a failing hook leaves the
    /// store unchanged.
    pub(crate) fn apply_with<F>(&self, batch: &WriteBatch, before_commit: F) -> StoreResult<CellTimestamp>
    where
        F: FnOnce(CellTimestamp) -> StoreResult<()>,
    {
        let mut tables = self.write_tables()?;
        check_conditions(&tables, batch)?;
        let timestamp = self.clock.now()?;
        before_commit(timestamp)?;
        apply_ops(&mut tables, batch, timestamp);
        debug!(ops = batch.len(), ?timestamp, "batch applied");
        Ok(timestamp)
    }
}

fn check_conditions(tables: &Tables, batch: &WriteBatch) -> StoreResult<()> {
    for cond in batch.conditions() {
        let current = tables
            .get(&cond.table)
            .and_then(|rows| rows.get(&cond.row))
            .and_then(|columns| columns.get(&cond.column))
            .map(|cell| cell.timestamp);
        if current != cond.timestamp {
            debug!(table = %cond.table, row = %cond.row, column = %cond.column, "batch condition failed");
            return Err(StoreError::Conflict {
                table: cond.table.clone(),
                row: cond.row.clone(),
                column: cond.column.clone(),
            });
        }
    }
    Ok(())
}

fn apply_ops(tables: &mut Tables, batch: &WriteBatch, timestamp: CellTimestamp) {
    for op in batch.ops() {
        match op {
            BatchOp::Put { table, row, column, value } => {
                tables
                    .entry(table.clone())
                    .or_default()
                    .entry(row.clone())
                    .or_default()
                    .insert(column.clone(), Cell { value: value.clone(), timestamp });
            }
            BatchOp::DeleteCell { table, row, column } => {
                if let Some(rows) = tables.get_mut(table) {
                    if let Some(columns) = rows.get_mut(row) {
                        columns.remove(column);
                        if columns.is_empty() {
                            rows.remove(row);
                        }
                    }
                    if rows.is_empty() {
                        tables.remove(table);
                    }
                }
            }
            BatchOp::DeleteRow { table, row } => {
                if let Some(rows) = tables.get_mut(table) {
                    rows.remove(row);
                    if rows.is_empty() {
                        tables.remove(table);
                    }
                }
            }
        }
    }
}

impl Default for InMemoryCellStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CellStore for InMemoryCellStore {
    fn get(&self, table: &str, row: &str, column: &str) -> StoreResult<Option<Cell>> {
        let tables = self.read_tables()?;
        Ok(tables
            .get(table)
            .and_then(|rows| rows.get(row))
            .and_then(|columns| columns.get(column))
            .cloned())
    }

    fn read_row(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnRange,
    ) -> StoreResult<Vec<(String, Cell)>> {
        let tables = self.read_tables()?;
        let Some(cells) = tables.get(table).and_then(|rows| rows.get(row)) else {
            return Ok(Vec::new());
        };
        Ok(columns
            .select(cells)
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect())
    }

    fn first_cell(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnRange,
    ) -> StoreResult<Option<(String, Cell)>> {
        self.edge_cell(table, row, columns, false)
    }

    fn last_cell(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnRange,
    ) -> StoreResult<Option<(String, Cell)>> {
        self.edge_cell(table, row, columns, true)
    }

    fn row_exists(&self, table: &str, row: &str) -> StoreResult<bool> {
        let tables = self.read_tables()?;
        Ok(tables.get(table).is_some_and(|rows| rows.contains_key(row)))
    }

    fn list_rows(&self, table: &str, after: Option<&str>, limit: usize) -> StoreResult<Vec<String>> {
        let tables = self.read_tables()?;
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        Ok(rows
            .range::<str, _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn list_tables(&self) -> StoreResult<Vec<String>> {
        Ok(self.read_tables()?.keys().cloned().collect())
    }

    fn apply(&self, batch: WriteBatch) -> StoreResult<CellTimestamp> {
        self.apply_with(&batch, |_| Ok(()))
    }
}

impl std::fmt::Debug for InMemoryCellStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.cell_count().unwrap_or_default();
        f.debug_struct("InMemoryCellStore")
            .field("cell_count", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(store: &InMemoryCellStore, table: &str, row: &str, column: &str, value: &str) -> CellTimestamp {
        let mut batch = WriteBatch::new();
        batch.put(table, row, column, value);
        store.apply(batch).unwrap()
    }

    // ----- Core reads and writes -----

    #[test]
    fn put_then_get() {
        let store = InMemoryCellStore::new();
        let ts = put(&store, "t", "r1", "c1", "\"v\"");
        let cell = store.get("t", "r1", "c1").unwrap().unwrap();
        assert_eq!(cell.value, "\"v\"");
        assert_eq!(cell.timestamp, ts);
        assert_eq!(store.get_value("t", "r1", "c1").unwrap().as_deref(), Some("\"v\""));
    }

    #[test]
    fn get_missing_returns_none() {
        let store = InMemoryCellStore::new();
        assert!(store.get("t", "r", "c").unwrap().is_none());
        assert!(store.read_row("t", "r", &ColumnRange::All).unwrap().is_empty());
        assert!(!store.row_exists("t", "r").unwrap());
    }

    #[test]
    fn overwrite_refreshes_timestamp() {
        let store = InMemoryCellStore::new();
        let ts1 = put(&store, "t", "r", "c", "1");
        let ts2 = put(&store, "t", "r", "c", "2");
        assert!(ts2 > ts1);
        let cell = store.get("t", "r", "c").unwrap().unwrap();
        assert_eq!(cell.value, "2");
        assert_eq!(cell.timestamp, ts2);
    }

    #[test]
    fn batch_cells_share_timestamp() {
        let store = InMemoryCellStore::new();
        let mut batch = WriteBatch::new();
        batch.put("t", "r", "a", "1").put("t", "r", "b", "2").put("u", "x", "c", "3");
        let ts = store.apply(batch).unwrap();
        for (table, row, col) in [("t", "r", "a"), ("t", "r", "b"), ("u", "x", "c")] {
            assert_eq!(store.get(table, row, col).unwrap().unwrap().timestamp, ts);
        }
    }

    // ----- Deletes -----

    #[test]
    fn deleting_last_cell_removes_row() {
        let store = InMemoryCellStore::new();
        put(&store, "t", "r", "c", "1");
        let mut batch = WriteBatch::new();
        batch.delete_cell("t", "r", "c");
        store.apply(batch).unwrap();
        assert!(!store.row_exists("t", "r").unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn delete_row_removes_all_cells() {
        let store = InMemoryCellStore::new();
        put(&store, "t", "r", "a", "1");
        put(&store, "t", "r", "b", "2");
        put(&store, "t", "other", "a", "3");
        let mut batch = WriteBatch::new();
        batch.delete_row("t", "r");
        store.apply(batch).unwrap();
        assert!(!store.row_exists("t", "r").unwrap());
        assert!(store.row_exists("t", "other").unwrap());
        assert_eq!(store.cell_count().unwrap(), 1);
    }

    #[test]
    fn deletes_of_missing_cells_are_noops() {
        let store = InMemoryCellStore::new();
        let mut batch = WriteBatch::new();
        batch.delete_cell("t", "r", "c").delete_row("t", "r");
        store.apply(batch).unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn ops_apply_in_order() {
        let store = InMemoryCellStore::new();
        put(&store, "t", "r", "c", "old");
        let mut batch = WriteBatch::new();
        batch.delete_cell("t", "r", "c").put("t", "r", "c", "new");
        store.apply(batch).unwrap();
        assert_eq!(store.get_value("t", "r", "c").unwrap().as_deref(), Some("new"));
    }

    // ----- Scans -----

    #[test]
    fn read_row_respects_range() {
        let store = InMemoryCellStore::new();
        let mut batch = WriteBatch::new();
        batch
            .put("t", "r", "prop:a", "1")
            .put("t", "r", "prop:b", "2")
            .put("t", "r", "ref:x:1", "3");
        store.apply(batch).unwrap();
        let cols: Vec<String> = store
            .read_row("t", "r", &ColumnRange::prefix("prop:"))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(cols, vec!["prop:a", "prop:b"]);
    }

    #[test]
    fn list_rows_pages_in_order() {
        let store = InMemoryCellStore::new();
        for r in ["r3", "r1", "r5", "r2", "r4"] {
            put(&store, "t", r, "c", "1");
        }
        let page1 = store.list_rows("t", None, 2).unwrap();
        assert_eq!(page1, vec!["r1", "r2"]);
        let page2 = store.list_rows("t", Some("r2"), 2).unwrap();
        assert_eq!(page2, vec!["r3", "r4"]);
        let page3 = store.list_rows("t", Some("r4"), 2).unwrap();
        assert_eq!(page3, vec!["r5"]);
        assert!(store.list_rows("t", Some("r5"), 2).unwrap().is_empty());
        assert!(store.list_rows("missing", None, 2).unwrap().is_empty());
    }

    #[test]
    fn read_rows_batches() {
        let store = InMemoryCellStore::new();
        put(&store, "t", "a", "c", "1");
        put(&store, "t", "b", "c", "2");
        let rows = store
            .read_rows("t", &["a".to_string(), "zz".to_string(), "b".to_string()], &ColumnRange::All)
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0].1.value, "1");
        assert!(rows[1].is_empty());
        assert_eq!(rows[2][0].1.value, "2");
    }

    #[test]
    fn edge_cells_seek_within_selection() {
        let store = InMemoryCellStore::new();
        let mut batch = WriteBatch::new();
        batch
            .put("t", "r", "free:01", "a")
            .put("t", "r", "free:05", "b")
            .put("t", "r", "used:03", "c")
            .put("t", "r", "version", "1");
        store.apply(batch).unwrap();
        let free = ColumnRange::prefix("free:");
        assert_eq!(store.first_cell("t", "r", &free).unwrap().unwrap().0, "free:01");
        assert_eq!(store.last_cell("t", "r", &free).unwrap().unwrap().0, "free:05");
        let below = ColumnRange::Between { start: "free:".into(), end: "free:04".into() };
        assert_eq!(store.last_cell("t", "r", &below).unwrap().unwrap().0, "free:01");
        assert!(store.first_cell("t", "r", &ColumnRange::prefix("gone:")).unwrap().is_none());
        assert!(store.last_cell("t", "missing", &ColumnRange::All).unwrap().is_none());
    }

    // ----- Conditional batches -----

    #[test]
    fn condition_on_current_timestamp_commits() {
        let store = InMemoryCellStore::new();
        let ts = put(&store, "t", "r", "version", "1");
        let mut batch = WriteBatch::new();
        batch.expect("t", "r", "version", Some(ts)).put("t", "r", "version", "2");
        store.apply(batch).unwrap();
        assert_eq!(store.get_value("t", "r", "version").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn stale_condition_rejects_whole_batch() {
        let store = InMemoryCellStore::new();
        let stale = put(&store, "t", "r", "version", "1");
        put(&store, "t", "r", "version", "2");
        let mut batch = WriteBatch::new();
        batch.expect("t", "r", "version", Some(stale)).put("t", "r", "other", "x");
        let err = store.apply(batch).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { ref column, .. } if column == "version"));
        assert!(!err.is_transient());
        assert!(store.get("t", "r", "other").unwrap().is_none());
    }

    #[test]
    fn absent_condition_requires_missing_cell() {
        let store = InMemoryCellStore::new();
        let mut first = WriteBatch::new();
        first.expect("t", "r", "c", None).put("t", "r", "c", "1");
        store.apply(first.clone()).unwrap();
        assert!(matches!(store.apply(first), Err(StoreError::Conflict { .. })));
    }

    // ----- Snapshot / restore -----

    #[test]
    fn snapshot_restore_preserves_timestamps() {
        let store = InMemoryCellStore::new();
        put(&store, "t", "r", "a", "1");
        put(&store, "u", "r", "b", "2");
        let cells = store.snapshot().unwrap();
        assert_eq!(cells.len(), 2);

        let other = InMemoryCellStore::new();
        other.restore(cells.clone()).unwrap();
        assert_eq!(other.snapshot().unwrap(), cells);

        let newest = cells.iter().map(|c| c.timestamp).max().unwrap();
        assert!(put(&other, "t", "r", "c", "3") > newest);
    }

    #[test]
    fn concurrent_writers_do_not_lose_cells() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryCellStore::new());
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let mut batch = WriteBatch::new();
                        batch.put("t", &format!("r{n}"), format!("c{i}"), "1");
                        store.apply(batch).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.cell_count().unwrap(), 200);
    }

    #[test]
    fn debug_shows_cell_count() {
        let store = InMemoryCellStore::new();
        put(&store, "t", "r", "c", "1");
        assert!(format!("{store:?}").contains("cell_count: 1"));
    }
}
