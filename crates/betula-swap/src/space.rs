//! The swap space: a handle factory with transparent paging.
//!
//! Users allocate heap objects into the space and receive reference-counted
//! handles. Dereferencing a handle yields a short-lived pin that guarantees
//! the object is resident for the pin's lifetime, reloading it from the
//! backing store if it was evicted. Objects reference each other through
//! handles; when an object is serialized, its outbound handles are written
//! as object IDs and counted into `ondisk_referents`, which is the basis
//! for reference-count correctness across the serialization boundary.
//!
//! The space is the sole owner of the object table. Handles carry a weak
//! reference to it plus an object ID and never own the space; an object's
//! in-memory target may embed further handles, which is why targets are
//! always dropped outside the table lock.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use betula_common::{BetulaError, BlobId, ObjectId, Result};

use crate::cache::{CacheManager, CacheOps};
use crate::codec::{LoadStream, SaveStream};
use crate::store::BackingStore;

pub(crate) type WeakSpace = Weak<SpaceInner>;

type TargetCell = Arc<dyn Any + Send + Sync>;
type SaveFn = fn(&(dyn Any + Send + Sync), &mut SaveStream) -> Result<()>;

/// A heap object the swap space can page in and out.
///
/// `save` writes the object to a stream, emitting embedded handles through
/// [`Handle::save`]/[`Handle::save_opt`] so they are counted; `load` is the
/// inverse. The multiset of handles resolved by `load` must equal the one
/// recorded by the `save` that produced the blob, or the image is treated
/// as corrupt.
pub trait Swappable: Send + Sync + 'static {
    /// Serializes the object.
    fn save(&self, out: &mut SaveStream) -> Result<()>;

    /// Deserializes an object previously written by [`Swappable::save`].
    fn load(input: &mut LoadStream<'_>) -> Result<Self>
    where
        Self: Sized;
}

fn save_target<T: Swappable>(cell: &(dyn Any + Send + Sync), out: &mut SaveStream) -> Result<()> {
    let lock = cell
        .downcast_ref::<RwLock<T>>()
        .expect("serialize of mismatched target type");
    lock.read().save(out)
}

/// A resident object's in-memory target plus the serializer that matches
/// its erased type.
struct Resident {
    cell: TargetCell,
    save: SaveFn,
}

/// Bookkeeping for one swappable object.
struct ObjectEntry {
    /// Current on-disk image, if the object has ever been cleaned.
    blob: Option<BlobId>,
    /// Live handles plus durable contributions (on-disk referents of
    /// other objects, the space root, the last checkpoint).
    refcount: u64,
    /// Live pins.
    pincount: u64,
    /// The target has modifications the blob does not.
    dirty: bool,
    /// In-memory target, absent when evicted.
    resident: Option<Resident>,
    /// Outbound handle counts in the most recently written image.
    ondisk_referents: HashMap<ObjectId, u64>,
}

struct State {
    objects: HashMap<ObjectId, ObjectEntry>,
    root: Option<ObjectId>,
    next_id: u64,
    /// Objects covered by the last successful checkpoint; each holds one
    /// logical reference that the next checkpoint releases.
    last_checkpoint: HashSet<ObjectId>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            root: None,
            next_id: 1,
            last_checkpoint: HashSet::new(),
        }
    }
}

/// Lifecycle transitions that occur while the cache manager is on the
/// stack and are replayed to it afterwards.
enum CacheEvent {
    Cleaned(ObjectId),
    Evicted(ObjectId),
    Died(ObjectId),
}

pub(crate) struct SpaceInner {
    state: Mutex<State>,
    store: Mutex<Box<dyn BackingStore>>,
    cache: Mutex<Box<dyn CacheManager>>,
}

/// Decrements an object's reference count, destroying it (and cascading
/// through its on-disk referents) when both counts reach zero. Passing a
/// zero amount just re-checks the death condition.
fn release(
    state: &mut State,
    store: &mut dyn BackingStore,
    events: &mut Vec<CacheEvent>,
    deferred: &mut Vec<TargetCell>,
    id: ObjectId,
    amount: u64,
) -> Result<()> {
    let mut stack = vec![(id, amount)];
    while let Some((id, amount)) = stack.pop() {
        let entry = state
            .objects
            .get_mut(&id)
            .expect("release of unknown object");
        assert!(entry.refcount >= amount, "refcount underflow");
        entry.refcount -= amount;
        if entry.refcount == 0 && entry.pincount == 0 {
            let entry = state.objects.remove(&id).expect("entry vanished");
            if let Some(resident) = entry.resident {
                deferred.push(resident.cell);
            }
            if let Some(blob) = entry.blob {
                store.deallocate(blob)?;
                stack.extend(entry.ondisk_referents);
            }
            events.push(CacheEvent::Died(id));
            tracing::trace!(%id, "object died");
        }
    }
    Ok(())
}

/// Serializes a dirty resident to a fresh blob and transfers the
/// reference counts held by its previous image to the new one.
fn clean_object(
    state: &mut State,
    store: &mut dyn BackingStore,
    events: &mut Vec<CacheEvent>,
    deferred: &mut Vec<TargetCell>,
    id: ObjectId,
) -> Result<()> {
    let entry = state.objects.get(&id).expect("clean of unknown object");
    assert!(entry.dirty, "clean of clean object");
    let resident = entry.resident.as_ref().expect("clean of evicted object");
    let cell = resident.cell.clone();
    let save = resident.save;

    let mut out = SaveStream::new();
    save(cell.as_ref(), &mut out)?;
    let (bytes, new_refs) = out.finish();

    let new_blob = store.allocate(bytes.len())?;
    store.write(new_blob, &bytes)?;

    for (&rid, &count) in &new_refs {
        state
            .objects
            .get_mut(&rid)
            .expect("serialized referent missing from table")
            .refcount += count;
    }

    let entry = state.objects.get_mut(&id).expect("entry vanished");
    let old_blob = entry.blob.replace(new_blob);
    let old_refs = std::mem::replace(&mut entry.ondisk_referents, new_refs);
    entry.dirty = false;
    tracing::trace!(%id, %new_blob, "object cleaned");

    if let Some(old) = old_blob {
        store.deallocate(old)?;
        for (rid, count) in old_refs {
            release(state, store, events, deferred, rid, count)?;
        }
    }
    events.push(CacheEvent::Cleaned(id));
    Ok(())
}

/// Frees a clean, unpinned object's in-memory target; the blob remains.
fn evict_object(
    state: &mut State,
    events: &mut Vec<CacheEvent>,
    deferred: &mut Vec<TargetCell>,
    id: ObjectId,
) {
    let entry = state.objects.get_mut(&id).expect("evict of unknown object");
    assert!(!entry.dirty, "evict of dirty object");
    assert_eq!(entry.pincount, 0, "evict of pinned object");
    assert!(entry.blob.is_some(), "evict of object with no on-disk image");
    let resident = entry.resident.take().expect("evict of non-resident object");
    deferred.push(resident.cell);
    events.push(CacheEvent::Evicted(id));
    tracing::trace!(%id, "object evicted");
}

/// The [`CacheOps`] view handed to the cache manager: the object table
/// plus queues for events and for targets that must drop outside the lock.
struct Ctx<'a> {
    state: &'a mut State,
    store: &'a mut dyn BackingStore,
    events: &'a mut Vec<CacheEvent>,
    deferred: &'a mut Vec<TargetCell>,
}

impl CacheOps for Ctx<'_> {
    fn is_pinned(&self, id: ObjectId) -> bool {
        self.state.objects.get(&id).map_or(true, |e| e.pincount > 0)
    }

    fn is_dirty(&self, id: ObjectId) -> bool {
        self.state.objects.get(&id).map_or(false, |e| e.dirty)
    }

    fn clean(&mut self, id: ObjectId) -> Result<()> {
        if !self.state.objects.contains_key(&id) {
            return Ok(());
        }
        clean_object(self.state, self.store, self.events, self.deferred, id)
    }

    fn evict(&mut self, id: ObjectId) -> Result<()> {
        if !self.state.objects.contains_key(&id) {
            return Ok(());
        }
        evict_object(self.state, self.events, self.deferred, id);
        Ok(())
    }
}

fn dispatch_event(
    cache: &mut dyn CacheManager,
    ops: &mut dyn CacheOps,
    event: CacheEvent,
) -> Result<()> {
    match event {
        CacheEvent::Cleaned(id) => cache.note_clean(id, ops),
        CacheEvent::Evicted(id) => cache.note_evict(id, ops),
        CacheEvent::Died(id) => cache.note_death(id, ops),
    }
}

enum Note {
    Birth,
    Load,
    Read,
    Write,
}

impl SpaceInner {
    /// Runs a cache-manager call with a [`CacheOps`] view over the table,
    /// then replays queued lifecycle events until quiescent. Targets freed
    /// along the way are dropped only after every lock is released.
    fn with_cache<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn CacheManager, &mut dyn CacheOps) -> Result<()>,
    {
        let mut deferred: Vec<TargetCell> = Vec::new();
        let result = (|| {
            let mut state = self.state.lock();
            let mut store = self.store.lock();
            let mut cache = self.cache.lock();
            let mut events = Vec::new();
            {
                let mut ctx = Ctx {
                    state: &mut state,
                    store: &mut **store,
                    events: &mut events,
                    deferred: &mut deferred,
                };
                f(&mut **cache, &mut ctx)?;
            }
            loop {
                let batch = std::mem::take(&mut events);
                if batch.is_empty() {
                    break;
                }
                for event in batch {
                    let mut ctx = Ctx {
                        state: &mut state,
                        store: &mut **store,
                        events: &mut events,
                        deferred: &mut deferred,
                    };
                    dispatch_event(&mut **cache, &mut ctx, event)?;
                }
            }
            Ok(())
        })();
        drop(deferred);
        result
    }

    fn notify(&self, note: Note, id: ObjectId) -> Result<()> {
        self.with_cache(|cache, ops| match note {
            Note::Birth => cache.note_birth(id, ops),
            Note::Load => cache.note_load(id, ops),
            Note::Read => cache.note_read(id, ops),
            Note::Write => cache.note_write(id, ops),
        })
    }

    fn replay_events(&self, events: Vec<CacheEvent>) {
        if events.is_empty() {
            return;
        }
        let result = self.with_cache(move |cache, ops| {
            for event in events {
                dispatch_event(cache, ops, event)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            tracing::error!(error = %e, "cache event replay failed");
        }
    }

    /// Drops one reference contribution. Used from handle drops, which
    /// cannot propagate errors; failures are logged.
    fn release_ref(&self, id: ObjectId, amount: u64) {
        let mut events = Vec::new();
        let mut deferred = Vec::new();
        {
            let mut state = self.state.lock();
            let mut store = self.store.lock();
            if let Err(e) = release(
                &mut state,
                &mut **store,
                &mut events,
                &mut deferred,
                id,
                amount,
            ) {
                tracing::error!(%id, error = %e, "release failed");
            }
        }
        self.replay_events(events);
        drop(deferred);
    }

    fn release_pin(&self, id: ObjectId) {
        let mut events = Vec::new();
        let mut deferred = Vec::new();
        {
            let mut state = self.state.lock();
            let mut store = self.store.lock();
            let entry = state.objects.get_mut(&id).expect("unpin of unknown object");
            assert!(entry.pincount > 0, "pincount underflow");
            entry.pincount -= 1;
            if entry.refcount == 0 && entry.pincount == 0 {
                if let Err(e) = release(
                    &mut state,
                    &mut **store,
                    &mut events,
                    &mut deferred,
                    id,
                    0,
                ) {
                    tracing::error!(%id, error = %e, "release after unpin failed");
                }
            }
        }
        self.replay_events(events);
        drop(deferred);
    }
}

/// Logical reference to a swappable object.
///
/// Cloning and dropping a handle adjusts the object's reference count;
/// when the count reaches zero with no pins outstanding, the object dies
/// and its on-disk image is released. Handles are created by
/// [`SwapSpace::allocate`], recovered via [`SwapSpace::get_root`], or
/// reconstructed during deserialization with [`Handle::load`].
pub struct Handle<T> {
    space: WeakSpace,
    id: ObjectId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn space(&self) -> Arc<SpaceInner> {
        self.space.upgrade().expect("handle outlived its swap space")
    }

    /// The object's stable identifier.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// True if the object's target is in memory (clean or dirty).
    pub fn is_resident(&self) -> bool {
        let inner = self.space();
        let state = inner.state.lock();
        state
            .objects
            .get(&self.id)
            .expect("handle to unknown object")
            .resident
            .is_some()
    }

    /// True if the object has modifications pending write-back.
    pub fn is_dirty(&self) -> bool {
        let inner = self.space();
        let state = inner.state.lock();
        state
            .objects
            .get(&self.id)
            .expect("handle to unknown object")
            .dirty
    }
}

impl<T: Swappable> Handle<T> {
    /// Acquires a read pin on the object, loading it if necessary.
    pub fn read(&self) -> Result<Pin<T>> {
        Pin::acquire(self, false)
    }

    /// Acquires a write pin on the object, loading it if necessary and
    /// marking it dirty.
    pub fn write(&self) -> Result<Pin<T>> {
        Pin::acquire(self, true)
    }

    /// Serializes this handle as its object ID and counts the reference.
    pub fn save(&self, out: &mut SaveStream) {
        out.put_u64(self.id.get());
        out.note_ref(self.id);
    }

    /// Serializes an optional handle; absent handles encode as 0.
    pub fn save_opt(handle: Option<&Handle<T>>, out: &mut SaveStream) {
        match handle {
            Some(h) => h.save(out),
            None => out.put_u64(0),
        }
    }

    /// Reconstructs a handle written by [`Handle::save`], taking a
    /// reference on the object and counting it in the stream's tally.
    pub fn load(input: &mut LoadStream<'_>) -> Result<Handle<T>> {
        match Self::load_opt(input)? {
            Some(handle) => Ok(handle),
            None => Err(BetulaError::corruption(0, "null handle where one was required")),
        }
    }

    /// Reconstructs an optional handle written by [`Handle::save_opt`].
    pub fn load_opt(input: &mut LoadStream<'_>) -> Result<Option<Handle<T>>> {
        let raw = input.get_u64()?;
        if raw == 0 {
            return Ok(None);
        }
        let id = ObjectId(raw);
        let space = input
            .space
            .clone()
            .expect("handle load through a detached stream");
        let inner = space.upgrade().expect("handle load after swap space dropped");
        {
            let mut state = inner.state.lock();
            let entry = state.objects.get_mut(&id).ok_or_else(|| {
                BetulaError::corruption(raw, "referent missing from object table")
            })?;
            entry.refcount += 1;
        }
        input.note_ref(id);
        Ok(Some(Handle {
            space,
            id,
            _marker: PhantomData,
        }))
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        let inner = self.space();
        inner
            .state
            .lock()
            .objects
            .get_mut(&self.id)
            .expect("clone of handle to unknown object")
            .refcount += 1;
        Handle {
            space: self.space.clone(),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        // The space dropping first tears down the whole graph; nothing
        // left to account.
        let Some(inner) = self.space.upgrade() else {
            return;
        };
        inner.release_ref(self.id, 1);
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("id", &self.id).finish()
    }
}

/// Scoped guarantee that an object is resident.
///
/// Constructed as either a read pin or a write pin; only a write pin
/// grants mutable access. The object cannot be evicted or destroyed while
/// a pin exists.
pub struct Pin<T> {
    inner: Arc<SpaceInner>,
    id: ObjectId,
    cell: Arc<RwLock<T>>,
    write: bool,
}

impl<T> std::fmt::Debug for Pin<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pin")
            .field("id", &self.id)
            .field("write", &self.write)
            .finish()
    }
}

impl<T: Swappable> Pin<T> {
    fn acquire(handle: &Handle<T>, write: bool) -> Result<Pin<T>> {
        let inner = handle.space();
        let resident = {
            let mut state = inner.state.lock();
            let entry = state
                .objects
                .get_mut(&handle.id)
                .expect("pin of unknown object");
            entry.pincount += 1;
            match &entry.resident {
                Some(r) => {
                    if write {
                        entry.dirty = true;
                    }
                    Some(r.cell.clone())
                }
                None => None,
            }
        };

        let paged_in = resident.is_none();
        let cell: Arc<RwLock<T>> = match resident {
            Some(cell) => cell
                .downcast::<RwLock<T>>()
                .unwrap_or_else(|_| panic!("object {} pinned with mismatched type", handle.id)),
            None => match Self::page_in(&inner, handle.id, write) {
                Ok(cell) => cell,
                Err(e) => {
                    inner.release_pin(handle.id);
                    return Err(e);
                }
            },
        };

        let note = match (paged_in, write) {
            (true, _) => Note::Load,
            (false, true) => Note::Write,
            (false, false) => Note::Read,
        };
        if let Err(e) = inner.notify(note, handle.id) {
            inner.release_pin(handle.id);
            return Err(e);
        }
        if paged_in {
            let after = if write { Note::Write } else { Note::Read };
            if let Err(e) = inner.notify(after, handle.id) {
                inner.release_pin(handle.id);
                return Err(e);
            }
        }

        Ok(Pin {
            inner,
            id: handle.id,
            cell,
            write,
        })
    }

    /// Reads the blob, deserializes the target, and verifies that the
    /// references it resolved match the counts recorded for the image.
    fn page_in(inner: &Arc<SpaceInner>, id: ObjectId, write: bool) -> Result<Arc<RwLock<T>>> {
        let (blob, expected) = {
            let state = inner.state.lock();
            let entry = state.objects.get(&id).expect("pin of unknown object");
            let blob = entry.blob.expect("non-resident object has no blob");
            (blob, entry.ondisk_referents.clone())
        };

        let bytes = inner.store.lock().read(blob)?;
        let mut input = LoadStream::new(&bytes, Arc::downgrade(inner));
        let value = T::load(&mut input)?;
        if !input.finished() {
            drop(value);
            return Err(BetulaError::corruption(id.get(), "trailing bytes in object blob"));
        }
        if *input.refs() != expected {
            drop(value);
            return Err(BetulaError::corruption(
                id.get(),
                "referent tally does not match on-disk record",
            ));
        }

        let cell = Arc::new(RwLock::new(value));
        {
            let mut state = inner.state.lock();
            let entry = state.objects.get_mut(&id).expect("pin of unknown object");
            assert!(entry.resident.is_none(), "object loaded twice");
            let erased: TargetCell = cell.clone();
            entry.resident = Some(Resident {
                cell: erased,
                save: save_target::<T>,
            });
            if write {
                entry.dirty = true;
            }
        }
        tracing::trace!(%id, %blob, "object loaded");
        Ok(cell)
    }
}

impl<T> Pin<T> {
    /// Shared view of the pinned object.
    pub fn value(&self) -> RwLockReadGuard<'_, T> {
        self.cell.read()
    }

    /// Exclusive view of the pinned object. Panics unless this is a
    /// write pin.
    pub fn value_mut(&self) -> RwLockWriteGuard<'_, T> {
        assert!(self.write, "write access through a read pin");
        self.cell.write()
    }
}

impl<T> Drop for Pin<T> {
    fn drop(&mut self) {
        self.inner.release_pin(self.id);
    }
}

/// The object manager: owns the table, the backing store, and the cache
/// manager; hands out handles; coordinates checkpoints.
#[derive(Clone)]
pub struct SwapSpace {
    inner: Arc<SpaceInner>,
}

impl SwapSpace {
    /// Opens a swap space over the given store and cache policy. If the
    /// store has a root blob, the object directory is rebuilt from it
    /// (targets stay on disk until pinned).
    pub fn new(mut store: Box<dyn BackingStore>, cache: Box<dyn CacheManager>) -> Result<SwapSpace> {
        let state = match store.get_root()? {
            Some(root_blob) => {
                let bytes = store.read(root_blob)?;
                let state = decode_directory(&bytes)?;
                tracing::debug!(objects = state.objects.len(), "swap space rebooted");
                state
            }
            None => State::default(),
        };
        Ok(SwapSpace {
            inner: Arc::new(SpaceInner {
                state: Mutex::new(state),
                store: Mutex::new(store),
                cache: Mutex::new(cache),
            }),
        })
    }

    /// Creates a new object wrapping `value`. The returned handle owns one
    /// reference; the object is born resident and dirty.
    pub fn allocate<T: Swappable>(&self, value: T) -> Result<Handle<T>> {
        let inner = &self.inner;
        let cell = Arc::new(RwLock::new(value));
        let id = {
            let mut state = inner.state.lock();
            let id = ObjectId(state.next_id);
            state.next_id += 1;
            let erased: TargetCell = cell.clone();
            state.objects.insert(
                id,
                ObjectEntry {
                    blob: None,
                    refcount: 1,
                    pincount: 0,
                    dirty: true,
                    resident: Some(Resident {
                        cell: erased,
                        save: save_target::<T>,
                    }),
                    ondisk_referents: HashMap::new(),
                },
            );
            id
        };
        let handle = Handle {
            space: Arc::downgrade(inner),
            id,
            _marker: PhantomData,
        };
        inner.notify(Note::Birth, id)?;
        Ok(handle)
    }

    /// Publishes the handle that roots the persistent object graph.
    pub fn set_root<T: Swappable>(&self, handle: &Handle<T>) -> Result<()> {
        let inner = &self.inner;
        let mut events = Vec::new();
        let mut deferred = Vec::new();
        {
            let mut state = inner.state.lock();
            let mut store = inner.store.lock();
            state
                .objects
                .get_mut(&handle.id)
                .expect("root handle to unknown object")
                .refcount += 1;
            let old = state.root.replace(handle.id);
            if let Some(old) = old {
                release(&mut state, &mut **store, &mut events, &mut deferred, old, 1)?;
            }
        }
        inner.replay_events(events);
        drop(deferred);
        Ok(())
    }

    /// Recovers the root handle, if one has been published.
    pub fn get_root<T: Swappable>(&self) -> Result<Option<Handle<T>>> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let Some(id) = state.root else {
            return Ok(None);
        };
        state
            .objects
            .get_mut(&id)
            .expect("root missing from object table")
            .refcount += 1;
        Ok(Some(Handle {
            space: Arc::downgrade(inner),
            id,
            _marker: PhantomData,
        }))
    }

    /// Writes a durable, self-describing image of the space to the store
    /// and atomically flips the store's root pointer to it. A crash
    /// before the flip leaves the previous checkpoint readable.
    pub fn checkpoint(&self) -> Result<()> {
        let inner = &self.inner;

        // (1) Write back every dirty resident.
        inner.with_cache(|cache, ops| cache.checkpoint(ops))?;

        let mut events = Vec::new();
        let mut deferred = Vec::new();
        {
            let mut state_guard = inner.state.lock();
            let mut store = inner.store.lock();
            let state = &mut *state_guard;

            // (2) A logical reference on every live object, so releasing
            // the previous checkpoint cannot kill anything it shouldn't.
            for entry in state.objects.values_mut() {
                entry.refcount += 1;
            }
            // (3) Drop the references held by the previous checkpoint.
            let previous = std::mem::take(&mut state.last_checkpoint);
            for id in previous {
                release(state, &mut **store, &mut events, &mut deferred, id, 1)?;
            }
            // (4) Serialize the directory.
            let bytes = encode_directory(state);
            // (5) Commit.
            let new_blob = store.allocate(bytes.len())?;
            store.write(new_blob, &bytes)?;
            let old_root = store.get_root()?;
            store.set_root(Some(new_blob))?;
            // (6) Free the previous directory blob.
            if let Some(old) = old_root {
                store.deallocate(old)?;
            }
            // (7) Remember what this checkpoint covers.
            state.last_checkpoint = state.objects.keys().copied().collect();
            tracing::debug!(objects = state.objects.len(), %new_blob, "checkpoint committed");
        }
        inner.replay_events(events);
        drop(deferred);
        Ok(())
    }

    /// Adjusts the cache manager's resident-set bound.
    pub fn set_cache_size(&self, size: u64) -> Result<()> {
        self.inner
            .with_cache(|cache, ops| cache.set_cache_size(size, ops))
    }

    /// Number of objects currently in the table.
    pub fn object_count(&self) -> usize {
        self.inner.state.lock().objects.len()
    }

    /// Number of objects whose target is in memory.
    pub fn resident_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .objects
            .values()
            .filter(|e| e.resident.is_some())
            .count()
    }

    /// Checks reference-count conservation: every on-disk referent must
    /// exist, and each object's reference count must cover the
    /// contributions from other objects' images, the root, and the last
    /// checkpoint.
    pub fn verify_referents(&self) -> Result<()> {
        let state = self.inner.state.lock();
        let mut inbound: HashMap<ObjectId, u64> = HashMap::new();
        for (id, entry) in &state.objects {
            for (rid, count) in &entry.ondisk_referents {
                if !state.objects.contains_key(rid) {
                    return Err(BetulaError::corruption(
                        id.get(),
                        format!("on-disk referent {rid} missing from table"),
                    ));
                }
                *inbound.entry(*rid).or_insert(0) += count;
            }
        }
        for (id, entry) in &state.objects {
            let mut expected = inbound.get(id).copied().unwrap_or(0);
            if state.root == Some(*id) {
                expected += 1;
            }
            if state.last_checkpoint.contains(id) {
                expected += 1;
            }
            if entry.refcount < expected {
                return Err(BetulaError::corruption(
                    id.get(),
                    format!(
                        "refcount {} below durable contributions {}",
                        entry.refcount, expected
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Directory blob layout: `next_id`, object count, then per object
/// `(id, blob, refcount, referent count, [(referent id, count)])` sorted
/// by ID, then the root object ID (0 = none).
fn encode_directory(state: &State) -> Vec<u8> {
    let mut out = SaveStream::new();
    out.put_u64(state.next_id);
    out.put_u64(state.objects.len() as u64);
    let mut ids: Vec<ObjectId> = state.objects.keys().copied().collect();
    ids.sort();
    for id in ids {
        let entry = &state.objects[&id];
        out.put_u64(id.get());
        let blob = entry.blob.expect("checkpointed object has no blob");
        out.put_u64(blob.get());
        out.put_u64(entry.refcount);
        out.put_u64(entry.ondisk_referents.len() as u64);
        let mut refs: Vec<(&ObjectId, &u64)> = entry.ondisk_referents.iter().collect();
        refs.sort();
        for (rid, count) in refs {
            out.put_u64(rid.get());
            out.put_u64(*count);
        }
    }
    out.put_u64(state.root.map_or(0, |id| id.get()));
    out.finish().0
}

fn decode_directory(bytes: &[u8]) -> Result<State> {
    let mut input = LoadStream::detached(bytes);
    let next_id = input.get_u64()?;
    let count = input.get_u64()?;
    let mut objects = HashMap::new();
    for _ in 0..count {
        let id = ObjectId(input.get_u64()?);
        let blob = BlobId::decode(input.get_u64()?)
            .ok_or_else(|| BetulaError::corruption(id.get(), "object with no blob in directory"))?;
        let refcount = input.get_u64()?;
        let nrefs = input.get_u64()?;
        let mut refs = HashMap::new();
        for _ in 0..nrefs {
            let rid = ObjectId(input.get_u64()?);
            let rcount = input.get_u64()?;
            refs.insert(rid, rcount);
        }
        objects.insert(
            id,
            ObjectEntry {
                blob: Some(blob),
                refcount,
                pincount: 0,
                dirty: false,
                resident: None,
                ondisk_referents: refs,
            },
        );
    }
    let root = match input.get_u64()? {
        0 => None,
        raw => Some(ObjectId(raw)),
    };
    if !input.finished() {
        return Err(BetulaError::corruption(0, "trailing bytes in directory blob"));
    }

    // Referent links are stored as IDs, so the load-time fix-up is just
    // an existence check.
    for (id, entry) in &objects {
        for rid in entry.ondisk_referents.keys() {
            if !objects.contains_key(rid) {
                return Err(BetulaError::corruption(
                    id.get(),
                    format!("referent {rid} missing from directory"),
                ));
            }
        }
    }
    if let Some(root) = root {
        if !objects.contains_key(&root) {
            return Err(BetulaError::corruption(
                root.get(),
                "root missing from directory",
            ));
        }
    }

    let last_checkpoint = objects.keys().copied().collect();
    Ok(State {
        objects,
        root,
        next_id,
        last_checkpoint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruCacheManager;
    use crate::store::{FileStore, FileStoreConfig, MemStore};
    use tempfile::tempdir;

    /// A chain link: a value plus an optional handle to the next link.
    #[derive(Debug)]
    struct ChainItem {
        value: u64,
        next: Option<Handle<ChainItem>>,
    }

    impl ChainItem {
        fn leaf(value: u64) -> Self {
            Self { value, next: None }
        }
    }

    impl Swappable for ChainItem {
        fn save(&self, out: &mut SaveStream) -> Result<()> {
            out.put_u64(self.value);
            Handle::save_opt(self.next.as_ref(), out);
            Ok(())
        }

        fn load(input: &mut LoadStream<'_>) -> Result<Self> {
            let value = input.get_u64()?;
            let next = Handle::load_opt(input)?;
            Ok(Self { value, next })
        }
    }

    fn mem_space(cache_size: u64) -> SwapSpace {
        SwapSpace::new(
            Box::new(MemStore::new()),
            Box::new(LruCacheManager::new(cache_size)),
        )
        .unwrap()
    }

    #[test]
    fn test_allocate_and_pin_roundtrip() {
        let space = mem_space(16);
        let handle = space.allocate(ChainItem::leaf(7)).unwrap();

        assert!(handle.is_resident());
        assert!(handle.is_dirty());
        assert_eq!(space.object_count(), 1);

        let pin = handle.read().unwrap();
        assert_eq!(pin.value().value, 7);
    }

    #[test]
    fn test_write_pin_mutates() {
        let space = mem_space(16);
        let handle = space.allocate(ChainItem::leaf(1)).unwrap();

        {
            let pin = handle.write().unwrap();
            pin.value_mut().value = 99;
        }
        let pin = handle.read().unwrap();
        assert_eq!(pin.value().value, 99);
    }

    #[test]
    #[should_panic(expected = "write access through a read pin")]
    fn test_read_pin_rejects_mutation() {
        let space = mem_space(16);
        let handle = space.allocate(ChainItem::leaf(1)).unwrap();
        let pin = handle.read().unwrap();
        let _ = pin.value_mut();
    }

    #[test]
    fn test_drop_last_handle_destroys_object() {
        let space = mem_space(16);
        let handle = space.allocate(ChainItem::leaf(5)).unwrap();
        assert_eq!(space.object_count(), 1);

        drop(handle);
        assert_eq!(space.object_count(), 0);
    }

    #[test]
    fn test_clone_keeps_object_alive() {
        let space = mem_space(16);
        let a = space.allocate(ChainItem::leaf(5)).unwrap();
        let b = a.clone();

        drop(a);
        assert_eq!(space.object_count(), 1);
        drop(b);
        assert_eq!(space.object_count(), 0);
    }

    #[test]
    fn test_eviction_and_reload() {
        let space = mem_space(1);
        let a = space.allocate(ChainItem::leaf(10)).unwrap();
        let b = space.allocate(ChainItem::leaf(20)).unwrap();

        // Capacity 1: allocating b cleans and evicts a.
        assert!(!a.is_resident());
        assert!(b.is_resident());
        assert_eq!(space.resident_count(), 1);

        // Pinning a pages it back in and pushes b out.
        let pin = a.read().unwrap();
        assert_eq!(pin.value().value, 10);
        drop(pin);
        assert!(!b.is_resident());
        assert_eq!(space.resident_count(), 1);
    }

    #[test]
    fn test_pinned_object_is_not_evicted() {
        let space = mem_space(1);
        let a = space.allocate(ChainItem::leaf(1)).unwrap();
        let pin = a.read().unwrap();

        let _b = space.allocate(ChainItem::leaf(2)).unwrap();
        // a is pinned, so it stays resident even though the cache is over
        // capacity.
        assert!(a.is_resident());
        drop(pin);
    }

    #[test]
    fn test_ondisk_reference_keeps_child_alive() {
        let space = mem_space(16);
        let child = space.allocate(ChainItem::leaf(2)).unwrap();
        let parent = space
            .allocate(ChainItem {
                value: 1,
                next: Some(child.clone()),
            })
            .unwrap();

        // Push both out so the parent's image holds a durable reference.
        space.set_cache_size(0).unwrap();
        assert_eq!(space.resident_count(), 0);
        space.verify_referents().unwrap();

        // The child survives losing its direct handle: the parent's
        // on-disk image still references it.
        drop(child);
        assert_eq!(space.object_count(), 2);

        // Killing the parent cascades through the image reference.
        drop(parent);
        assert_eq!(space.object_count(), 0);
    }

    #[test]
    fn test_death_releases_blobs() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(FileStoreConfig {
            dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        })
        .unwrap();
        let space =
            SwapSpace::new(Box::new(store), Box::new(LruCacheManager::new(0))).unwrap();

        let handle = space.allocate(ChainItem::leaf(3)).unwrap();
        // Cache size 0 forces an immediate clean + evict.
        assert!(!handle.is_resident());
        let blobs = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(blobs, 1);

        drop(handle);
        let blobs = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(blobs, 0);
    }

    #[test]
    fn test_set_root_replaces_previous() {
        let space = mem_space(16);
        let a = space.allocate(ChainItem::leaf(1)).unwrap();
        let b = space.allocate(ChainItem::leaf(2)).unwrap();

        space.set_root(&a).unwrap();
        drop(a);
        // The root reference keeps a alive without a handle.
        assert_eq!(space.object_count(), 2);

        space.set_root(&b).unwrap();
        // Replacing the root releases the old one.
        assert_eq!(space.object_count(), 1);

        let recovered = space.get_root::<ChainItem>().unwrap().unwrap();
        assert_eq!(recovered.id(), b.id());
    }

    #[test]
    fn test_checkpoint_and_reboot() {
        let dir = tempdir().unwrap();
        let config = FileStoreConfig {
            dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        };

        let (chain_head, tail_value) = {
            let store = FileStore::open(config.clone()).unwrap();
            let space =
                SwapSpace::new(Box::new(store), Box::new(LruCacheManager::new(4))).unwrap();

            let tail = space.allocate(ChainItem::leaf(30)).unwrap();
            let head = space
                .allocate(ChainItem {
                    value: 20,
                    next: Some(tail),
                })
                .unwrap();
            space.set_root(&head).unwrap();
            space.checkpoint().unwrap();
            space.verify_referents().unwrap();
            (head.id(), 30u64)
        };

        let store = FileStore::open(config).unwrap();
        let space = SwapSpace::new(Box::new(store), Box::new(LruCacheManager::new(4))).unwrap();
        assert_eq!(space.object_count(), 2);
        space.verify_referents().unwrap();

        let head = space.get_root::<ChainItem>().unwrap().unwrap();
        assert_eq!(head.id(), chain_head);
        let pin = head.read().unwrap();
        assert_eq!(pin.value().value, 20);
        let tail = pin.value().next.clone().unwrap();
        drop(pin);
        assert_eq!(tail.read().unwrap().value().value, tail_value);
    }

    #[test]
    fn test_checkpoint_reference_retains_covered_objects() {
        let space = mem_space(16);
        let a = space.allocate(ChainItem::leaf(1)).unwrap();
        let root = space.allocate(ChainItem::leaf(0)).unwrap();
        space.set_root(&root).unwrap();
        space.checkpoint().unwrap();

        // a is now held by its handle and the checkpoint reference, so
        // dropping the handle does not destroy it.
        drop(a);
        assert_eq!(space.object_count(), 2);

        // The rolling checkpoint reference carries it across further
        // checkpoints as well.
        space.checkpoint().unwrap();
        assert_eq!(space.object_count(), 2);
        space.verify_referents().unwrap();
    }

    #[test]
    fn test_object_born_after_checkpoint_dies_normally() {
        let space = mem_space(16);
        let root = space.allocate(ChainItem::leaf(0)).unwrap();
        space.set_root(&root).unwrap();
        space.checkpoint().unwrap();

        let a = space.allocate(ChainItem::leaf(1)).unwrap();
        assert_eq!(space.object_count(), 2);
        drop(a);
        assert_eq!(space.object_count(), 1);
    }

    #[test]
    fn test_corrupt_blob_is_detected() {
        let dir = tempdir().unwrap();
        let config = FileStoreConfig {
            dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        };
        let store = FileStore::open(config).unwrap();
        let space =
            SwapSpace::new(Box::new(store), Box::new(LruCacheManager::new(16))).unwrap();

        let b = space.allocate(ChainItem::leaf(200)).unwrap();
        let c = space.allocate(ChainItem::leaf(300)).unwrap();
        let marker = 0xDEAD_BEEFu64;
        let a = space
            .allocate(ChainItem {
                value: marker,
                next: Some(b.clone()),
            })
            .unwrap();

        // Force everything to disk, then rewrite a's referent field to
        // point at c instead of b.
        space.set_cache_size(0).unwrap();
        let mut tampered = false;
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let path = entry.unwrap().path();
            let data = std::fs::read(&path).unwrap();
            if data.len() == 16 && data[0..8] == marker.to_le_bytes() {
                let mut data = data;
                data[8..16].copy_from_slice(&c.id().get().to_le_bytes());
                std::fs::write(&path, data).unwrap();
                tampered = true;
            }
        }
        assert!(tampered, "blob for object a not found");

        let err = a.read().unwrap_err();
        assert!(matches!(err, BetulaError::Corruption { .. }), "{err}");
    }

    #[test]
    fn test_verify_referents_clean_space() {
        let space = mem_space(4);
        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(space.allocate(ChainItem::leaf(i)).unwrap());
        }
        let parent = space
            .allocate(ChainItem {
                value: 100,
                next: Some(handles[0].clone()),
            })
            .unwrap();
        space.set_root(&parent).unwrap();
        space.verify_referents().unwrap();
        space.checkpoint().unwrap();
        space.verify_referents().unwrap();
    }

    #[test]
    fn test_resident_bound_respected() {
        let space = mem_space(3);
        let mut handles = Vec::new();
        for i in 0..20 {
            handles.push(space.allocate(ChainItem::leaf(i)).unwrap());
        }
        assert!(space.resident_count() <= 3);

        // Random-ish access pattern keeps the bound.
        for i in (0..20).step_by(3) {
            let pin = handles[i].read().unwrap();
            assert_eq!(pin.value().value, i as u64);
            drop(pin);
            assert!(space.resident_count() <= 3);
        }
    }
}
