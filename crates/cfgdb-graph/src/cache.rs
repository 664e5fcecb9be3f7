use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use cfgdb_store::CellTimestamp;
use cfgdb_types::{FqName, ObjectId};
use lru::LruCache;

use crate::error::{GraphError, GraphResult};
use crate::object::ObjectRecord;

/// A cached object plus the marker timestamps it was read at.
#[derive(Clone, Debug)]
pub struct CachedObject {
    /// Property region plus, when `complete`, the derived regions.
    pub record: ObjectRecord,
    pub id_perms_ts: Option<CellTimestamp>,
    pub latest_ts: Option<CellTimestamp>,
    /// Whether children and back-references were read.
    pub complete: bool,
}

impl CachedObject {
    /// Whether the entry can serve a read given the current markers.
    ///
    /// Property reads compare the `id_perms` timestamp; reads of derived
    /// regions need a complete entry and also compare the activity marker.
    pub fn is_fresh(
        &self,
        needs_derived: bool,
        id_perms_ts: Option<CellTimestamp>,
        latest_ts: Option<CellTimestamp>,
    ) -> bool {
        if self.id_perms_ts != id_perms_ts {
            return false;
        }
        !needs_derived || (self.complete && self.latest_ts == latest_ts)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bounded LRU of decoded objects and of id-to-name lookups.
pub struct ObjectCache {
    objects: Mutex<LruCache<ObjectId, CachedObject>>,
    names: Mutex<LruCache<ObjectId, (FqName, String)>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ObjectCache {
    /// `None` when `capacity` is zero.
    pub fn new(capacity: usize) -> Option<Self> {
        let cap = NonZeroUsize::new(capacity)?;
        Some(Self {
            objects: Mutex::new(LruCache::new(cap)),
            names: Mutex::new(LruCache::new(cap)),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, id: &ObjectId) -> GraphResult<Option<CachedObject>> {
        let mut objects = self.objects.lock().map_err(|e| GraphError::LockPoisoned(e.to_string()))?;
        Ok(objects.get(id).cloned())
    }

    pub fn insert(&self, id: ObjectId, entry: CachedObject) -> GraphResult<()> {
        let mut objects = self.objects.lock().map_err(|e| GraphError::LockPoisoned(e.to_string()))?;
        objects.put(id, entry);
        Ok(())
    }

    pub fn evict(&self, id: &ObjectId) -> GraphResult<()> {
        let mut objects = self.objects.lock().map_err(|e| GraphError::LockPoisoned(e.to_string()))?;
        if objects.pop(id).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn get_name(&self, id: &ObjectId) -> GraphResult<Option<(FqName, String)>> {
        let mut names = self.names.lock().map_err(|e| GraphError::LockPoisoned(e.to_string()))?;
        Ok(names.get(id).cloned())
    }

    pub fn put_name(&self, id: ObjectId, fq_name: FqName, obj_type: String) -> GraphResult<()> {
        let mut names = self.names.lock().map_err(|e| GraphError::LockPoisoned(e.to_string()))?;
        names.put(id, (fq_name, obj_type));
        Ok(())
    }

    pub fn evict_name(&self, id: &ObjectId) -> GraphResult<()> {
        let mut names = self.names.lock().map_err(|e| GraphError::LockPoisoned(e.to_string()))?;
        names.pop(id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
