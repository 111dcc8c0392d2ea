//! Cache-replacement policies for the swap space.

use std::collections::{BTreeMap, HashMap};

use betula_common::{ObjectId, Result};

/// Callback surface a cache manager uses to inspect and act on resident
/// objects.
///
/// Implemented by the swap space over its object table and passed
/// explicitly into every manager call. Objects can die underneath the
/// manager while one of its calls is on the stack (a clean can cascade
/// into deaths), so every method tolerates IDs the table no longer knows:
/// `is_pinned` reports true (never a victim), `is_dirty` reports false,
/// and `clean`/`evict` are no-ops. The corresponding death notifications
/// are replayed to the manager once its call returns.
pub trait CacheOps {
    /// True if the object is currently pinned (or unknown).
    fn is_pinned(&self, id: ObjectId) -> bool;

    /// True if the object has unwritten modifications.
    fn is_dirty(&self, id: ObjectId) -> bool;

    /// Serializes the object to the backing store and marks it clean.
    fn clean(&mut self, id: ObjectId) -> Result<()>;

    /// Frees the object's in-memory target. The object must be clean and
    /// unpinned.
    fn evict(&mut self, id: ObjectId) -> Result<()>;
}

/// Replacement policy driven by swap-space lifecycle events.
///
/// The swap space notifies the manager of every birth, load, read, write,
/// clean, eviction, and death; the manager is free to call back through
/// [`CacheOps`] to query residency state and to demand cleans and
/// evictions that keep the resident set bounded.
pub trait CacheManager: Send {
    /// A new object was created (resident, dirty).
    fn note_birth(&mut self, id: ObjectId, ops: &mut dyn CacheOps) -> Result<()>;

    /// An object was loaded from the backing store.
    fn note_load(&mut self, id: ObjectId, ops: &mut dyn CacheOps) -> Result<()>;

    /// A resident object was examined.
    fn note_read(&mut self, id: ObjectId, ops: &mut dyn CacheOps) -> Result<()>;

    /// A resident object was modified.
    fn note_write(&mut self, id: ObjectId, ops: &mut dyn CacheOps) -> Result<()>;

    /// A resident object was made durable.
    fn note_clean(&mut self, id: ObjectId, ops: &mut dyn CacheOps) -> Result<()>;

    /// An object's in-memory target was freed.
    fn note_evict(&mut self, id: ObjectId, ops: &mut dyn CacheOps) -> Result<()>;

    /// An object was destroyed.
    fn note_death(&mut self, id: ObjectId, ops: &mut dyn CacheOps) -> Result<()>;

    /// Adjusts the resident-set bound, evicting as necessary.
    fn set_cache_size(&mut self, size: u64, ops: &mut dyn CacheOps) -> Result<()>;

    /// Flushes every dirty resident to the backing store.
    fn checkpoint(&mut self, ops: &mut dyn CacheOps) -> Result<()>;
}

/// Least-recently-used replacement with coarse-granularity access times.
///
/// Residents are ordered by a monotone access counter. To avoid reordering
/// the set on every access, an entry is repositioned only when its
/// recorded access time is more than `cache_size / 100` ticks stale. On
/// overflow the manager scans in access order and takes the first unpinned
/// entry, cleaning it first when dirty.
pub struct LruCacheManager {
    /// Resident objects ordered by last recorded access.
    by_access: BTreeMap<u64, ObjectId>,
    /// Last recorded access per resident object.
    access: HashMap<ObjectId, u64>,
    max_in_memory: u64,
    update_interval: u64,
    next_access: u64,
}

impl LruCacheManager {
    /// Creates a manager bounding the resident set to `cache_size`
    /// objects.
    pub fn new(cache_size: u64) -> Self {
        let update_interval = cache_size / 100;
        Self {
            by_access: BTreeMap::new(),
            access: HashMap::new(),
            max_in_memory: cache_size,
            update_interval,
            next_access: update_interval + 1,
        }
    }

    /// Returns the number of objects the manager believes are resident.
    pub fn resident(&self) -> usize {
        self.by_access.len()
    }

    fn insert(&mut self, id: ObjectId) {
        let stamp = self.next_access;
        self.next_access += 1;
        self.by_access.insert(stamp, id);
        self.access.insert(id, stamp);
    }

    fn remove(&mut self, id: ObjectId) {
        if let Some(stamp) = self.access.remove(&id) {
            self.by_access.remove(&stamp);
        }
    }

    fn note_birth_or_load(&mut self, id: ObjectId, ops: &mut dyn CacheOps) -> Result<()> {
        self.insert(id);
        self.maybe_evict_something(ops)
    }

    fn note_read_or_write(&mut self, id: ObjectId) {
        let Some(&stamp) = self.access.get(&id) else {
            return;
        };
        if self.next_access - stamp > self.update_interval {
            self.by_access.remove(&stamp);
            self.insert(id);
        }
    }

    fn maybe_evict_something(&mut self, ops: &mut dyn CacheOps) -> Result<()> {
        while self.by_access.len() as u64 > self.max_in_memory {
            let victim = self
                .by_access
                .values()
                .copied()
                .find(|&id| !ops.is_pinned(id));

            let Some(victim) = victim else {
                return Ok(());
            };

            if ops.is_dirty(victim) {
                ops.clean(victim)?;
            }
            ops.evict(victim)?;
            self.remove(victim);
        }
        Ok(())
    }
}

impl CacheManager for LruCacheManager {
    fn note_birth(&mut self, id: ObjectId, ops: &mut dyn CacheOps) -> Result<()> {
        tracing::trace!(%id, "birth");
        self.note_birth_or_load(id, ops)
    }

    fn note_load(&mut self, id: ObjectId, ops: &mut dyn CacheOps) -> Result<()> {
        tracing::trace!(%id, "load");
        self.note_birth_or_load(id, ops)
    }

    fn note_read(&mut self, id: ObjectId, _ops: &mut dyn CacheOps) -> Result<()> {
        self.note_read_or_write(id);
        Ok(())
    }

    fn note_write(&mut self, id: ObjectId, _ops: &mut dyn CacheOps) -> Result<()> {
        self.note_read_or_write(id);
        Ok(())
    }

    fn note_clean(&mut self, _id: ObjectId, _ops: &mut dyn CacheOps) -> Result<()> {
        // Residency is unchanged by a write-back.
        Ok(())
    }

    fn note_evict(&mut self, id: ObjectId, _ops: &mut dyn CacheOps) -> Result<()> {
        tracing::trace!(%id, "evict");
        self.remove(id);
        Ok(())
    }

    fn note_death(&mut self, id: ObjectId, _ops: &mut dyn CacheOps) -> Result<()> {
        tracing::trace!(%id, "death");
        self.remove(id);
        Ok(())
    }

    fn set_cache_size(&mut self, size: u64, ops: &mut dyn CacheOps) -> Result<()> {
        self.max_in_memory = size;
        self.maybe_evict_something(ops)
    }

    fn checkpoint(&mut self, ops: &mut dyn CacheOps) -> Result<()> {
        let resident: Vec<ObjectId> = self.by_access.values().copied().collect();
        for id in resident {
            if ops.is_dirty(id) {
                ops.clean(id)?;
            }
        }
        Ok(())
    }
}
