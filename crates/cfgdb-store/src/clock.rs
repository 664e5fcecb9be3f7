use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cell::CellTimestamp;
use crate::error::{StoreError, StoreResult};

/// Hybrid logical clock that stamps cell writes.
///
/// - **Local write**: `physical = max(wall_clock, state.physical)`. If physical
///   advanced, `logical = 0`; otherwise `logical += 1`.
/// - **Observe**: when cells are loaded from a log or dump, the clock moves
///   past every timestamp it sees so later writes still sort after them.
///
/// Timestamps handed out by one clock are strictly increasing.
pub struct CellClock {
    state: Mutex<CellTimestamp>,
}

impl CellClock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CellTimestamp::default()),
        }
    }

    /// Next timestamp for a local write.
    pub fn now(&self) -> StoreResult<CellTimestamp> {
        let wall = Self::wall_clock_ms();
        let mut state = self
            .state
            .lock()
            .map_err(|e| StoreError::LockPoisoned(format!("cell clock: {e}")))?;

        let physical_ms = wall.max(state.physical_ms);
        let logical = if physical_ms > state.physical_ms {
            0
        } else {
            state.logical + 1
        };

        *state = CellTimestamp { physical_ms, logical };
        Ok(*state)
    }

    /// Advance the clock so the next `now()` is greater than `seen`.
    pub fn observe(&self, seen: CellTimestamp) -> StoreResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| StoreError::LockPoisoned(format!("cell clock: {e}")))?;
        if seen > *state {
            *state = seen;
        }
        Ok(())
    }

    fn wall_clock_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

impl Default for CellClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CellClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellClock").finish_non_exhaustive()
    }
}
