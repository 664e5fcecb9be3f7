//! Cell-oriented backing store for the config object graph.
//!
//! Data is organized as tables of rows, each row an ordered map of named
//! cells. Every cell carries a store-assigned write timestamp; the object
//! graph layer relies on those timestamps as staleness markers.
//!
//! # Storage Backends
//!
//! All backends implement the [`CellStore`] trait:
//!
//! - [`InMemoryCellStore`] -- `BTreeMap`-based store for tests and embedding
//! - [`DurableCellStore`] -- in-memory view fronted by a [`WriteAheadLog`]
//! - [`RetryingStore`] -- decorator adding bounded retry to any backend
//!
//! [`StoreDump`] exports and imports whole stores as JSON.
//!
//! # Design Rules
//!
//! 1. A batch is applied atomically; its cells share one timestamp.
//! 2. Timestamps from one store are strictly increasing across batches.
//! 3. A row exists exactly while it holds a cell.
//! 4. The store never interprets cell values.
//! 5. Unavailability surfaces as [`StoreError::Unavailable`] after bounded retry.

pub mod cell;
pub mod clock;
pub mod config;
pub mod dump;
pub mod durable;
pub mod error;
pub mod memory;
pub mod retry;
pub mod traits;
pub mod wal;

pub use cell::{BatchOp, Cell, CellCondition, CellTimestamp, ColumnRange, StoredCell, WriteBatch};
pub use clock::CellClock;
pub use config::{Credentials, StoreBackend, StoreConfig};
pub use dump::StoreDump;
pub use durable::DurableCellStore;
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryCellStore;
pub use retry::{RetryPolicy, RetryingStore};
pub use traits::CellStore;
pub use wal::{SyncMode, WalConfig, WalRecord, WriteAheadLog};
