use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

/// Store-assigned write timestamp of a cell.
///
/// Ordering: `physical_ms` then `logical`. Every cell written by one batch
/// carries the same timestamp, and successive batches get strictly greater
/// timestamps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CellTimestamp {
    /// Wall-clock milliseconds since UNIX epoch.
    pub physical_ms: u64,
    /// Logical counter for writes within the same millisecond.
    pub logical: u32,
}

impl CellTimestamp {
    pub fn new(physical_ms: u64, logical: u32) -> Self {
        Self { physical_ms, logical }
    }
}

impl fmt::Debug for CellTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts({}.{})", self.physical_ms, self.logical)
    }
}

/// A stored cell: an opaque value plus its write timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub value: String,
    pub timestamp: CellTimestamp,
}

/// Column selection within one row. Columns are ordered lexicographically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnRange {
    /// Every column in the row.
    All,
    /// Columns starting with the given prefix.
    Prefix(String),
    /// Columns `>= start`.
    From(String),
    /// Columns in `[start, end)`.
    Between { start: String, end: String },
}

impl ColumnRange {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn starting_at(start: impl Into<String>) -> Self {
        Self::From(start.into())
    }

    /// Returns `true` if `column` is selected by this range.
    pub fn contains(&self, column: &str) -> bool {
        match self {
            Self::All => true,
            Self::Prefix(p) => column.starts_with(p.as_str()),
            Self::From(start) => column >= start.as_str(),
            Self::Between { start, end } => column >= start.as_str() && column < end.as_str(),
        }
    }

    /// Map-range bounds of the selection, or `None` when it selects nothing.
    pub fn bounds(&self) -> Option<(Bound<&str>, Bound<String>)> {
        match self {
            Self::All => Some((Bound::Unbounded, Bound::Unbounded)),
            Self::Prefix(p) => {
                let upper = prefix_successor(p).map_or(Bound::Unbounded, Bound::Excluded);
                Some((Bound::Included(p.as_str()), upper))
            }
            Self::From(start) => Some((Bound::Included(start.as_str()), Bound::Unbounded)),
            Self::Between { start, end } if start < end => {
                Some((Bound::Included(start.as_str()), Bound::Excluded(end.clone())))
            }
            Self::Between { .. } => None,
        }
    }

    /// Select the matching columns of an ordered row.
    pub fn select<'a>(
        &'a self,
        row: &'a BTreeMap<String, Cell>,
    ) -> Box<dyn Iterator<Item = (&'a String, &'a Cell)> + 'a> {
        match self {
            Self::All => Box::new(row.iter()),
            Self::Prefix(p) => Box::new(
                row.range::<str, _>((Bound::Included(p.as_str()), Bound::Unbounded))
                    .take_while(move |(k, _)| k.starts_with(p.as_str())),
            ),
            Self::From(start) => {
                Box::new(row.range::<str, _>((Bound::Included(start.as_str()), Bound::Unbounded)))
            }
            Self::Between { start, end } => {
                if start >= end {
                    return Box::new(std::iter::empty());
                }
                Box::new(row.range::<str, _>((
                    Bound::Included(start.as_str()),
                    Bound::Excluded(end.as_str()),
                )))
            }
        }
    }
}

/// Smallest string greater than every string starting with `prefix`.
fn prefix_successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = (last as u32 + 1..=char::MAX as u32).find_map(char::from_u32) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

/// A fully addressed cell, as exported to dumps and log snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCell {
    pub table: String,
    pub row: String,
    pub column: String,
    pub value: String,
    pub timestamp: CellTimestamp,
}

/// One mutation inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Put {
        table: String,
        row: String,
        column: String,
        value: String,
    },
    DeleteCell {
        table: String,
        row: String,
        column: String,
    },
    DeleteRow {
        table: String,
        row: String,
    },
}

/// A cell state a batch requires at commit time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellCondition {
    pub table: String,
    pub row: String,
    pub column: String,
    /// Timestamp the cell must carry; `None` requires the cell to be absent.
    pub timestamp: Option<CellTimestamp>,
}

/// An ordered set of mutations applied atomically.
///
/// Operations apply in insertion order, so a delete followed by a put of the
/// same cell leaves the put in place. Conditions are checked against the
/// committed state before any operation applies; a failed condition rejects
/// the whole batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    #[serde(default)]
    conditions: Vec<CellCondition>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &mut self,
        table: &str,
        row: &str,
        column: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(BatchOp::Put {
            table: table.to_string(),
            row: row.to_string(),
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete_cell(&mut self, table: &str, row: &str, column: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::DeleteCell {
            table: table.to_string(),
            row: row.to_string(),
            column: column.into(),
        });
        self
    }

    pub fn delete_row(&mut self, table: &str, row: &str) -> &mut Self {
        self.ops.push(BatchOp::DeleteRow {
            table: table.to_string(),
            row: row.to_string(),
        });
        self
    }

    /// Require the cell to still carry `timestamp` (or to be absent, for
    /// `None`) when the batch commits.
    pub fn expect(
        &mut self,
        table: &str,
        row: &str,
        column: impl Into<String>,
        timestamp: Option<CellTimestamp>,
    ) -> &mut Self {
        self.conditions.push(CellCondition {
            table: table.to_string(),
            row: row.to_string(),
            column: column.into(),
            timestamp,
        });
        self
    }

    /// Append every operation and condition of `other`.
    pub fn extend(&mut self, other: WriteBatch) -> &mut Self {
        self.ops.extend(other.ops);
        self.conditions.extend(other.conditions);
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn conditions(&self) -> &[CellCondition] {
        &self.conditions
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
