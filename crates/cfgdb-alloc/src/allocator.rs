//! Interval free-list allocator persisted in a cell store.
//!
//! Each pool is one row of [`POOL_TABLE`] keyed by the pool path. Free
//! intervals live under `free:<start>` with their end in the value; allocated
//! ids live under `used:<id>` with their optional payload. Starts are
//! zero-padded so column order is numeric order, which lets alloc, reserve
//! and release seek a single cell instead of reading the row.
//!
//! A `version` cell is rewritten by every mutation. Each mutation reads it,
//! builds its batch, and commits only if the version is unchanged, so handles
//! sharing a store never hand out the same id.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use cfgdb_store::{Cell, CellStore, ColumnRange, StoreError, WriteBatch};

use crate::error::{AllocError, AllocResult};
use crate::range::{validate_ranges, AllocPolicy, IdRange};

/// Table holding every id pool.
pub const POOL_TABLE: &str = "id_pool";

const FREE_PREFIX: &str = "free:";
const USED_PREFIX: &str = "used:";
const VERSION_COLUMN: &str = "version";

/// Commit attempts before a mutation gives up on a contended pool.
const MAX_ATTEMPTS: u32 = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct FreeCell {
    end: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct UsedCell {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Interval {
    range: IdRange,
    used: bool,
    value: Option<String>,
}

fn free_column(start: u64) -> String {
    format!("{FREE_PREFIX}{start:020}")
}

fn used_column(id: u64) -> String {
    format!("{USED_PREFIX}{id:020}")
}

/// Hands out ids from one or more disjoint ranges under a pool path.
pub struct RangeIdAllocator {
    store: Arc<dyn CellStore>,
    path: String,
    ranges: Vec<IdRange>,
    policy: AllocPolicy,
    lock: Mutex<()>,
}

impl RangeIdAllocator {
    /// Open the pool at `path`, creating free intervals for every part of a
    /// configured range not already covered by persisted state.
    ///
    /// Overlapping or inverted ranges are rejected before touching the store.
    pub fn new(
        store: Arc<dyn CellStore>,
        path: impl Into<String>,
        ranges: Vec<IdRange>,
        policy: AllocPolicy,
    ) -> AllocResult<Self> {
        let alloc = Self::attach(store, path, ranges, policy)?;
        alloc.init_ranges()?;
        Ok(alloc)
    }

    /// Open the pool at `path` without writing anything. Ranges with no
    /// persisted intervals stay uninitialized, so reads see only stored state.
    pub fn attach(
        store: Arc<dyn CellStore>,
        path: impl Into<String>,
        ranges: Vec<IdRange>,
        policy: AllocPolicy,
    ) -> AllocResult<Self> {
        let path = path.into();
        let ranges = validate_ranges(&path, ranges)?;
        Ok(Self {
            store,
            path,
            ranges,
            policy,
            lock: Mutex::new(()),
        })
    }

    /// Paths of every persisted pool starting with `prefix`, in order.
    pub fn list_pools(store: &dyn CellStore, prefix: &str) -> AllocResult<Vec<String>> {
        const PAGE: usize = 1024;
        let mut pools = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = store.list_rows(POOL_TABLE, after.as_deref(), PAGE)?;
            let done = page.len() < PAGE;
            after = page.last().cloned();
            pools.extend(page.into_iter().filter(|p| p.starts_with(prefix)));
            if done {
                return Ok(pools);
            }
        }
    }

    fn init_ranges(&self) -> AllocResult<()> {
        self.transact(|batch| {
            let existing = self.load()?;
            let mut added = 0usize;
            for range in &self.ranges {
                for gap in uncovered(*range, &existing) {
                    self.put_free(batch, gap)?;
                    added += 1;
                }
            }
            if added > 0 {
                debug!(path = %self.path, intervals = added, "initialized id pool ranges");
            }
            Ok(())
        })
    }

    fn guard(&self) -> AllocResult<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|e| AllocError::LockPoisoned(format!("{}: {e}", self.path)))
    }

    /// Build a batch with `attempt` and commit it only if the pool version is
    /// unchanged since the attempt started, retrying on conflict.
    ///
    /// An attempt that leaves the batch empty commits nothing.
    fn transact<T>(&self, mut attempt: impl FnMut(&mut WriteBatch) -> AllocResult<T>) -> AllocResult<T> {
        let _guard = self.guard()?;
        for tries in 1..=MAX_ATTEMPTS {
            let version = self.store.get(POOL_TABLE, &self.path, VERSION_COLUMN)?;
            let mut batch = WriteBatch::new();
            let out = attempt(&mut batch)?;
            if batch.is_empty() {
                return Ok(out);
            }
            let generation = version
                .as_ref()
                .and_then(|c| c.value.parse::<u64>().ok())
                .unwrap_or(0);
            batch
                .expect(POOL_TABLE, &self.path, VERSION_COLUMN, version.map(|c| c.timestamp))
                .put(POOL_TABLE, &self.path, VERSION_COLUMN, (generation + 1).to_string());
            match self.store.apply(batch) {
                Ok(_) => return Ok(out),
                Err(StoreError::Conflict { .. }) => {
                    debug!(path = %self.path, tries, "id pool changed concurrently, retrying");
                    std::thread::yield_now();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AllocError::Contended {
            path: self.path.clone(),
            attempts: MAX_ATTEMPTS,
        })
    }

    fn corrupt(&self, column: &str, reason: impl Into<String>) -> AllocError {
        AllocError::Corrupt {
            path: self.path.clone(),
            column: column.to_string(),
            reason: reason.into(),
        }
    }

    fn parse_start(&self, column: &str, digits: &str) -> AllocResult<u64> {
        digits
            .parse()
            .map_err(|e| self.corrupt(column, format!("start: {e}")))
    }

    fn parse_free(&self, column: &str, cell: &Cell) -> AllocResult<IdRange> {
        let digits = column
            .strip_prefix(FREE_PREFIX)
            .ok_or_else(|| self.corrupt(column, "not a free interval"))?;
        let start = self.parse_start(column, digits)?;
        let stored: FreeCell =
            serde_json::from_str(&cell.value).map_err(|e| self.corrupt(column, e.to_string()))?;
        if stored.end < start {
            return Err(self.corrupt(column, format!("end {} before start", stored.end)));
        }
        Ok(IdRange::new(start, stored.end))
    }

    fn parse_used(&self, column: &str, cell: &Cell) -> AllocResult<(u64, Option<String>)> {
        let digits = column
            .strip_prefix(USED_PREFIX)
            .ok_or_else(|| self.corrupt(column, "not an allocated id"))?;
        let id = self.parse_start(column, digits)?;
        let stored: UsedCell =
            serde_json::from_str(&cell.value).map_err(|e| self.corrupt(column, e.to_string()))?;
        Ok((id, stored.value))
    }

    /// Every persisted interval, free and used, in start order.
    fn load(&self) -> AllocResult<Vec<Interval>> {
        let mut intervals = Vec::new();
        for (column, cell) in self.store.read_row(POOL_TABLE, &self.path, &ColumnRange::All)? {
            if column == VERSION_COLUMN {
                continue;
            }
            if column.starts_with(FREE_PREFIX) {
                let range = self.parse_free(&column, &cell)?;
                intervals.push(Interval { range, used: false, value: None });
            } else {
                let (id, value) = self.parse_used(&column, &cell)?;
                intervals.push(Interval { range: IdRange::unit(id), used: true, value });
            }
        }
        intervals.sort_by_key(|iv| iv.range.start);
        Ok(intervals)
    }

    fn put_free(&self, batch: &mut WriteBatch, range: IdRange) -> AllocResult<()> {
        let column = free_column(range.start);
        let json = serde_json::to_string(&FreeCell { end: range.end })
            .map_err(|e| self.corrupt(&column, e.to_string()))?;
        batch.put(POOL_TABLE, &self.path, column, json);
        Ok(())
    }

    fn put_used(&self, batch: &mut WriteBatch, id: u64, value: Option<&str>) -> AllocResult<()> {
        let column = used_column(id);
        let cell = UsedCell { value: value.map(str::to_string) };
        let json = serde_json::to_string(&cell).map_err(|e| self.corrupt(&column, e.to_string()))?;
        batch.put(POOL_TABLE, &self.path, column, json);
        Ok(())
    }

    /// Take `id` out of the free interval `range`, keeping what remains on
    /// either side free.
    fn carve(&self, batch: &mut WriteBatch, range: IdRange, id: u64, value: Option<&str>) -> AllocResult<()> {
        batch.delete_cell(POOL_TABLE, &self.path, free_column(range.start));
        if range.start < id {
            self.put_free(batch, IdRange::new(range.start, id - 1))?;
        }
        if id < range.end {
            self.put_free(batch, IdRange::new(id + 1, range.end))?;
        }
        self.put_used(batch, id, value)
    }

    /// Allocate the first free id according to the pool policy.
    pub fn alloc(&self, value: Option<&str>) -> AllocResult<u64> {
        let id = self.transact(|batch| {
            let free = ColumnRange::prefix(FREE_PREFIX);
            let picked = match self.policy {
                AllocPolicy::Ascending => self.store.first_cell(POOL_TABLE, &self.path, &free)?,
                AllocPolicy::Descending => self.store.last_cell(POOL_TABLE, &self.path, &free)?,
            };
            let Some((column, cell)) = picked else {
                return Err(AllocError::Exhausted { path: self.path.clone() });
            };
            let range = self.parse_free(&column, &cell)?;
            let id = match self.policy {
                AllocPolicy::Ascending => range.start,
                AllocPolicy::Descending => range.end,
            };
            self.carve(batch, range, id, value)?;
            Ok(id)
        })?;
        debug!(path = %self.path, id, "allocated id");
        Ok(id)
    }

    /// Claim a specific id.
    ///
    /// Reserving an id already held with the same payload succeeds without
    /// change; a different payload is a [`AllocError::Conflict`].
    pub fn reserve(&self, id: u64, value: Option<&str>) -> AllocResult<u64> {
        let out_of_range = || AllocError::OutOfRange { path: self.path.clone(), id };
        if !self.contains(id) {
            return Err(out_of_range());
        }
        self.transact(|batch| {
            let used = used_column(id);
            if let Some(cell) = self.store.get(POOL_TABLE, &self.path, &used)? {
                let (_, existing) = self.parse_used(&used, &cell)?;
                if existing.as_deref() == value {
                    return Ok(());
                }
                return Err(AllocError::Conflict {
                    path: self.path.clone(),
                    id,
                    existing,
                });
            }
            let at_or_below = ColumnRange::Between {
                start: FREE_PREFIX.to_string(),
                end: format!("{}\0", free_column(id)),
            };
            let Some((column, cell)) = self.store.last_cell(POOL_TABLE, &self.path, &at_or_below)? else {
                return Err(out_of_range());
            };
            let range = self.parse_free(&column, &cell)?;
            if !range.contains(id) {
                return Err(out_of_range());
            }
            self.carve(batch, range, id, value)?;
            debug!(path = %self.path, id, "reserved id");
            Ok(())
        })?;
        Ok(id)
    }

    /// Return an id to the free pool. Releasing an id that is not allocated
    /// is a no-op.
    pub fn release(&self, id: u64) -> AllocResult<()> {
        self.transact(|batch| {
            let used = used_column(id);
            if self.store.get(POOL_TABLE, &self.path, &used)?.is_none() {
                return Ok(());
            }
            batch.delete_cell(POOL_TABLE, &self.path, used);
            self.put_free(batch, IdRange::unit(id))?;
            debug!(path = %self.path, id, "released id");
            Ok(())
        })
    }

    /// Payload stored with an allocated id.
    pub fn read(&self, id: u64) -> AllocResult<Option<String>> {
        let used = used_column(id);
        match self.store.get(POOL_TABLE, &self.path, &used)? {
            Some(cell) => Ok(self.parse_used(&used, &cell)?.1),
            None => Ok(None),
        }
    }

    pub fn is_allocated(&self, id: u64) -> AllocResult<bool> {
        Ok(self.store.get(POOL_TABLE, &self.path, &used_column(id))?.is_some())
    }

    /// Number of allocated ids.
    pub fn count(&self) -> AllocResult<u64> {
        Ok(self.allocations()?.len() as u64)
    }

    pub fn empty(&self) -> AllocResult<bool> {
        let used = ColumnRange::prefix(USED_PREFIX);
        Ok(self.store.first_cell(POOL_TABLE, &self.path, &used)?.is_none())
    }

    /// Every allocated id with its payload, in id order.
    pub fn allocations(&self) -> AllocResult<Vec<(u64, Option<String>)>> {
        self.store
            .read_row(POOL_TABLE, &self.path, &ColumnRange::prefix(USED_PREFIX))?
            .iter()
            .map(|(column, cell)| self.parse_used(column, cell))
            .collect()
    }

    /// Persisted intervals as `(range, used)`, in start order.
    pub fn intervals(&self) -> AllocResult<Vec<(IdRange, bool)>> {
        Ok(self.load()?.into_iter().map(|iv| (iv.range, iv.used)).collect())
    }

    /// Whether `id` lies inside a configured range.
    pub fn contains(&self, id: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(id))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn ranges(&self) -> &[IdRange] {
        &self.ranges
    }

    pub fn policy(&self) -> AllocPolicy {
        self.policy
    }

    /// Remove all persisted state of the pool at `path`.
    pub fn delete_all(store: &dyn CellStore, path: &str) -> AllocResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete_row(POOL_TABLE, path);
        store.apply(batch)?;
        debug!(path, "deleted id pool");
        Ok(())
    }
}

/// Parts of `range` not covered by any of the start-ordered `intervals`.
fn uncovered(range: IdRange, intervals: &[Interval]) -> Vec<IdRange> {
    let mut gaps = Vec::new();
    let mut cursor = range.start;
    for iv in intervals.iter().filter(|iv| iv.range.overlaps(&range)) {
        if iv.range.start > cursor {
            gaps.push(IdRange::new(cursor, iv.range.start - 1));
        }
        match iv.range.end.checked_add(1) {
            Some(after) => cursor = cursor.max(after),
            None => return gaps,
        }
    }
    if cursor <= range.end {
        gaps.push(IdRange::new(cursor, range.end));
    }
    gaps
}

impl std::fmt::Debug for RangeIdAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeIdAllocator")
            .field("path", &self.path)
            .field("ranges", &self.ranges)
            .field("policy", &self.policy)
            .finish()
    }
}
