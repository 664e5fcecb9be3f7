use crate::cell::{Cell, CellTimestamp, ColumnRange, WriteBatch};
use crate::error::StoreResult;

/// A wide-row cell store: tables of rows, each row an ordered map of named
/// cells carrying a value and a write timestamp.
///
/// All implementations must satisfy these invariants:
/// - A row exists exactly while it holds at least one cell.
/// - [`CellStore::apply`] is atomic: readers see all of a batch or none of it.
/// - Every cell written by one batch gets the same timestamp, strictly greater
///   than the timestamp of any earlier batch applied to the same store.
/// - A batch whose conditions do not hold is rejected with
///   [`StoreError::Conflict`](crate::StoreError::Conflict) and leaves the
///   store unchanged.
/// - The store never interprets cell values.
/// - Backend failures are propagated, never silently ignored.
pub trait CellStore: Send + Sync {
    /// Read a single cell. Returns `Ok(None)` if the cell does not exist.
    fn get(&self, table: &str, row: &str, column: &str) -> StoreResult<Option<Cell>>;

    /// Read the selected columns of a row, ordered by column name.
    ///
    /// A missing row reads as an empty vector.
    fn read_row(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnRange,
    ) -> StoreResult<Vec<(String, Cell)>>;

    /// Check whether a row holds any cell.
    fn row_exists(&self, table: &str, row: &str) -> StoreResult<bool>;

    /// List up to `limit` row keys of a table in key order, strictly after
    /// `after` when given. Used to page through full-table scans.
    fn list_rows(&self, table: &str, after: Option<&str>, limit: usize) -> StoreResult<Vec<String>>;

    /// Names of all tables holding at least one row.
    fn list_tables(&self) -> StoreResult<Vec<String>>;

    /// Apply a batch atomically and return the timestamp its cells were given.
    fn apply(&self, batch: WriteBatch) -> StoreResult<CellTimestamp>;

    /// Read the same column selection from several rows.
    ///
    /// Default implementation calls `read_row()` for each row. Backends may
    /// override for fewer round-trips.
    fn read_rows(
        &self,
        table: &str,
        rows: &[String],
        columns: &ColumnRange,
    ) -> StoreResult<Vec<Vec<(String, Cell)>>> {
        rows.iter().map(|r| self.read_row(table, r, columns)).collect()
    }

    /// First selected cell of a row in column order.
    ///
    /// Default implementation reads the whole selection. Ordered backends
    /// should override with a direct seek.
    fn first_cell(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnRange,
    ) -> StoreResult<Option<(String, Cell)>> {
        Ok(self.read_row(table, row, columns)?.into_iter().next())
    }

    /// Last selected cell of a row in column order.
    fn last_cell(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnRange,
    ) -> StoreResult<Option<(String, Cell)>> {
        Ok(self.read_row(table, row, columns)?.pop())
    }

    /// Read a cell's value only.
    fn get_value(&self, table: &str, row: &str, column: &str) -> StoreResult<Option<String>> {
        Ok(self.get(table, row, column)?.map(|c| c.value))
    }
}
