//! Range-based identifier allocation.
//!
//! A [`RangeIdAllocator`] hands out small dense integers (network ids,
//! security-group ids, IPv4 addresses as `u32`) from one or more disjoint
//! ranges, persisting its free list in a [`cfgdb_store::CellStore`].
//!
//! # Design Rules
//!
//! 1. Ranges of one pool never overlap; overlap is rejected at construction.
//! 2. An allocated interval always holds exactly one id.
//! 3. Release is idempotent: releasing a free id changes nothing.
//! 4. Exhaustion is reported immediately, never retried.
//! 5. Free intervals are not coalesced on release.
//! 6. Every mutation commits against an unchanged pool version, so handles
//!    sharing a store never hand out the same id.

pub mod allocator;
pub mod error;
pub mod range;

pub use allocator::{RangeIdAllocator, POOL_TABLE};
pub use error::{AllocError, AllocResult};
pub use range::{validate_ranges, AllocPolicy, IdRange};
