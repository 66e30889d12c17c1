//! The buffer pool manager: public surface and lock discipline.

use crate::buffer::{device_copy, ChunkBuffer};
use crate::chunk_index::ChunkIndex;
use crate::segment::{Segment, SegmentArena, SegmentHandle, SegmentId};
use crate::slab::SlabPool;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use strata_common::{
    ChunkKey, DeviceId, EncoderMeta, PoolConfig, Result, StrataError, SCRATCH_SENTINEL,
};
use sysinfo::System;
use tracing::{debug, trace};

/// Lower tier consulted on misses and during checkpoint.
///
/// [`BufferMgr`] implements this itself, so managers stack into tiers.
pub trait ParentMgr: Send + Sync {
    /// Fills `dest` with the chunk's bytes, fetching at least `num_bytes`
    /// (0 means the whole chunk).
    fn fetch_buffer(&self, key: &ChunkKey, dest: &ChunkBuffer, num_bytes: usize) -> Result<()>;

    /// Persists `src` into this tier.
    fn put_buffer(&self, key: &ChunkKey, src: &ChunkBuffer) -> Result<()>;
}

/// Transient placeholder segments, visible only between `create_buffer` and
/// the first reservation.
#[derive(Default)]
struct PlaceholderPool {
    arena: SegmentArena,
    order: Vec<SegmentId>,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Slabs currently backing the pool.
    pub num_slabs: usize,
    /// Slabs the byte budget allows.
    pub max_num_slabs: usize,
    /// Pages held by used segments.
    pub used_pages: usize,
    /// Pages held by free segments.
    pub free_pages: usize,
    /// Chunks in the index.
    pub num_chunks: usize,
    /// Chunks still awaiting their first allocation.
    pub num_placeholders: usize,
}

/// Buffer pool manager for one device tier.
///
/// Holds chunks in a bounded region of preallocated slab memory, serves
/// reads by hitting the pool or fetching through the parent tier, accepts
/// writes and flushes dirty chunks on checkpoint, and reclaims space by
/// evicting the cheapest contiguous run of unpinned segments.
///
/// Lock order, top to bottom: sized segments, chunk index, placeholders.
/// Operations touching more than one structure acquire in that order and
/// never take an earlier lock while holding a later one.
pub struct BufferMgr {
    self_ref: Weak<BufferMgr>,
    device_id: DeviceId,
    page_size: usize,
    slab_size: usize,
    num_pages_per_slab: usize,
    max_num_slabs: usize,
    parent: Option<Arc<dyn ParentMgr>>,
    /// Slab vector and every slab-resident segment.
    sized: Mutex<SlabPool>,
    /// Chunk key to segment handle.
    chunk_index: Mutex<ChunkIndex>,
    /// Placeholders awaiting first allocation.
    placeholders: Mutex<PlaceholderPool>,
    /// LRU proxy; every assignment consumes a fresh epoch.
    buffer_epoch: AtomicU64,
    /// Counter behind anonymous scratch keys.
    buffer_id: Mutex<i32>,
}

impl BufferMgr {
    /// Creates a manager from a validated configuration.
    pub fn new(config: PoolConfig, parent: Option<Arc<dyn ParentMgr>>) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            device_id: config.device_id,
            page_size: config.page_size,
            slab_size: config.slab_size,
            num_pages_per_slab: config.num_pages_per_slab(),
            max_num_slabs: config.max_num_slabs(),
            parent,
            sized: Mutex::new(SlabPool::new(config.page_size, config.slab_size)),
            chunk_index: Mutex::new(ChunkIndex::new()),
            placeholders: Mutex::new(PlaceholderPool::default()),
            buffer_epoch: AtomicU64::new(0),
            buffer_id: Mutex::new(0),
        }))
    }

    /// Creates a manager whose byte budget is 25% of available system RAM,
    /// rounded down to whole slabs (minimum one).
    pub fn auto_sized(parent: Option<Arc<dyn ParentMgr>>) -> Result<Arc<Self>> {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available = sys.available_memory() as usize;
        let mut config = PoolConfig::default();
        let target = (available / 4).max(config.slab_size);
        config.max_buffer_size = target - target % config.slab_size;
        Self::new(config, parent)
    }

    /// Device this tier serves.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Allocation granularity in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages per slab; the largest single allocation the pool can hold.
    pub fn num_pages_per_slab(&self) -> usize {
        self.num_pages_per_slab
    }

    fn next_epoch(&self) -> u64 {
        self.buffer_epoch.fetch_add(1, Ordering::Relaxed)
    }

    fn next_buffer_id(&self) -> i32 {
        let mut id = self.buffer_id.lock();
        let assigned = *id;
        *id += 1;
        assigned
    }

    /// Creates a new chunk and reserves `initial_size` bytes for it.
    ///
    /// `chunk_page_size` records the chunk's dirty-tracking granularity;
    /// 0 means the pool's page size. The returned buffer is pinned.
    pub fn create_buffer(
        &self,
        key: &ChunkKey,
        chunk_page_size: usize,
        initial_size: usize,
    ) -> Result<Arc<ChunkBuffer>> {
        let page_size = if chunk_page_size == 0 {
            self.page_size
        } else {
            chunk_page_size
        };
        let buffer = {
            let mut index = self.chunk_index.lock();
            if index.contains(key) {
                return Err(StrataError::ChunkExists(key.clone()));
            }
            let mut placeholders = self.placeholders.lock();
            let seg_id = placeholders.arena.insert(Segment::placeholder(key.clone()));
            placeholders.order.push(seg_id);
            let handle = SegmentHandle::Placeholder(seg_id);
            let buffer = Arc::new(ChunkBuffer::new(
                self.self_ref.clone(),
                self.device_id,
                page_size,
                handle,
            ));
            if let Some(seg) = placeholders.arena.get_mut(seg_id) {
                seg.buffer = Some(buffer.clone());
            }
            index.insert(key.clone(), handle);
            buffer
        };
        // The construction pin keeps the new chunk safe outside the locks.
        if let Err(err) = buffer.reserve(initial_size) {
            // roll back the half-created chunk
            let _ = self.delete_buffer(key, false);
            return Err(err);
        }
        Ok(buffer)
    }

    /// Deletes a chunk, destroying its buffer and freeing its segment.
    pub fn delete_buffer(&self, key: &ChunkKey, purge: bool) -> Result<()> {
        // purge is accepted and ignored: whether deletion should propagate
        // to the parent tier is not decidable at this layer.
        let _ = purge;
        let handle = {
            let mut index = self.chunk_index.lock();
            index
                .remove(key)
                .ok_or_else(|| StrataError::ChunkNotFound(key.clone()))?
        };
        // index lock released before the segment locks
        self.destroy_segment(handle);
        Ok(())
    }

    /// Deletes every chunk whose key begins with `prefix`.
    pub fn delete_buffers_with_prefix(&self, prefix: &ChunkKey, purge: bool) {
        let _ = purge; // same deliberate no-op as delete_buffer
        // Sized lock first so a concurrent reserve cannot interleave between
        // the index walk and the segment teardown.
        let mut pool = self.sized.lock();
        let mut index = self.chunk_index.lock();
        let keys = index.keys_with_prefix(prefix);
        let removed = keys.len();
        for key in keys {
            if let Some(handle) = index.remove(&key) {
                match handle {
                    SegmentHandle::Slab(id) => pool.remove_segment(id),
                    SegmentHandle::Placeholder(id) => self.remove_placeholder(id),
                }
            }
        }
        if removed > 0 {
            debug!(%prefix, removed, "deleted chunks by prefix");
        }
    }

    /// Returns the chunk's buffer, pinned, fetching through the parent tier
    /// on a miss or when the resident bytes are shorter than `num_bytes`.
    pub fn get_buffer(&self, key: &ChunkKey, num_bytes: usize) -> Result<Arc<ChunkBuffer>> {
        if let Some(buffer) = self.lookup_resident(key) {
            if buffer.size() < num_bytes {
                if let Some(parent) = &self.parent {
                    if parent.fetch_buffer(key, &buffer, num_bytes).is_err() {
                        buffer.unpin();
                        return Err(StrataError::ChunkUnavailable(key.clone()));
                    }
                }
            }
            return Ok(buffer);
        }
        let Some(parent) = &self.parent else {
            return Err(StrataError::ChunkNotFound(key.clone()));
        };
        let buffer = self.create_buffer(key, self.page_size, num_bytes)?;
        if parent.fetch_buffer(key, &buffer, num_bytes).is_err() {
            // fetch failed: remove the chunk we just created
            let _ = self.delete_buffer(key, false);
            return Err(StrataError::ChunkUnavailable(key.clone()));
        }
        Ok(buffer)
    }

    /// Copies the chunk's bytes into a caller-supplied buffer instead of
    /// handing out the resident one; the resident is unpinned on return.
    pub fn fetch_buffer(&self, key: &ChunkKey, dest: &ChunkBuffer, num_bytes: usize) -> Result<()> {
        let buffer = match self.lookup_resident(key) {
            Some(buffer) => {
                if buffer.size() < num_bytes {
                    if let Some(parent) = &self.parent {
                        if parent.fetch_buffer(key, &buffer, num_bytes).is_err() {
                            buffer.unpin();
                            return Err(StrataError::ChunkUnavailable(key.clone()));
                        }
                    }
                }
                buffer
            }
            None => {
                let Some(parent) = &self.parent else {
                    return Err(StrataError::ChunkNotFound(key.clone()));
                };
                let buffer = self.create_buffer(key, self.page_size, num_bytes)?;
                if parent.fetch_buffer(key, &buffer, num_bytes).is_err() {
                    let _ = self.delete_buffer(key, false);
                    return Err(StrataError::ChunkUnavailable(key.clone()));
                }
                buffer
            }
        };
        let result = self.copy_out(&buffer, dest, num_bytes);
        buffer.unpin();
        result
    }

    /// Writes `src` into the resident chunk, creating it if missing.
    ///
    /// Fails `Inconsistency` when the resident chunk already holds unflushed
    /// changes. Net pin count is unchanged.
    pub fn put_buffer(
        &self,
        key: &ChunkKey,
        src: &ChunkBuffer,
        num_bytes: usize,
    ) -> Result<Arc<ChunkBuffer>> {
        let buffer = match self.lookup_resident(key) {
            Some(buffer) => buffer,
            None => self.create_buffer(key, self.page_size, 0)?,
        };
        let result = self.copy_in(&buffer, src, num_bytes);
        buffer.unpin();
        result?;
        Ok(buffer)
    }

    /// Flushes every dirty named chunk to the parent tier.
    ///
    /// Scratch chunks (leading key component `-1`) never flush. Idempotent
    /// over the dirty set: a second call performs no parent writes.
    pub fn checkpoint(&self) -> Result<()> {
        let Some(parent) = &self.parent else {
            return Ok(());
        };
        let pool = self.sized.lock();
        let index = self.chunk_index.lock();
        for (key, handle) in index.iter() {
            if key.is_scratch() {
                continue;
            }
            let Some(buffer) = self.resolve_buffer(&pool, handle) else {
                continue;
            };
            if buffer.is_dirty() {
                debug!(%key, size = buffer.size(), "checkpoint flush");
                parent.put_buffer(key, &buffer)?;
                buffer.clear_dirty_bits();
            }
        }
        Ok(())
    }

    /// Creates an anonymous scratch chunk of `num_bytes`.
    pub fn alloc(&self, num_bytes: usize) -> Result<Arc<ChunkBuffer>> {
        let key = ChunkKey::new(vec![SCRATCH_SENTINEL, self.next_buffer_id()]);
        self.create_buffer(&key, self.page_size, num_bytes)
    }

    /// Deletes the chunk owning `buffer`.
    ///
    /// Fails `WrongBufferKind` when the buffer came from another manager.
    pub fn free(&self, buffer: &ChunkBuffer) -> Result<()> {
        if !buffer.belongs_to(&self.self_ref) {
            return Err(StrataError::WrongBufferKind);
        }
        let key = match buffer.segment_handle() {
            SegmentHandle::Slab(id) => self
                .sized
                .lock()
                .arena
                .get(id)
                .and_then(|seg| seg.chunk_key.clone()),
            SegmentHandle::Placeholder(id) => self
                .placeholders
                .lock()
                .arena
                .get(id)
                .and_then(|seg| seg.chunk_key.clone()),
        }
        .ok_or_else(|| StrataError::Inconsistency("buffer is not resident in this pool".into()))?;
        self.delete_buffer(&key, false)
    }

    /// Returns true if the chunk is resident. Pure lookup, no side effects.
    pub fn is_buffer_on_device(&self, key: &ChunkKey) -> bool {
        self.chunk_index.lock().contains(key)
    }

    /// Total bytes currently backed by slabs.
    pub fn size(&self) -> usize {
        self.sized.lock().total_bytes()
    }

    /// Number of chunks in the index.
    pub fn num_chunks(&self) -> usize {
        self.chunk_index.lock().len()
    }

    /// Destroys every buffer, empties all structures, and resets the epoch.
    ///
    /// Outstanding buffer handles are detached (null base, zero size) so
    /// later operations on them fail instead of touching freed slab memory.
    pub fn clear(&self) {
        let mut pool = self.sized.lock();
        let mut index = self.chunk_index.lock();
        let mut placeholders = self.placeholders.lock();
        index.clear();
        pool.clear();
        placeholders.arena.clear();
        placeholders.order.clear();
        self.buffer_epoch.store(0, Ordering::Relaxed);
    }

    /// Snapshot of pool occupancy.
    pub fn stats(&self) -> PoolStats {
        let pool = self.sized.lock();
        let num_chunks = self.chunk_index.lock().len();
        let num_placeholders = self.placeholders.lock().order.len();
        PoolStats {
            num_slabs: pool.num_slabs(),
            max_num_slabs: self.max_num_slabs,
            used_pages: pool.used_pages(),
            free_pages: pool.free_pages(),
            num_chunks,
            num_placeholders,
        }
    }

    /// Renders every slab's segment sequence for diagnostics.
    pub fn dump_segments(&self) -> String {
        self.sized.lock().dump()
    }

    /// Chunk metadata lives with the tier that owns the chunks; this cache
    /// cannot enumerate it.
    pub fn chunk_metadata(&self) -> Result<Vec<(ChunkKey, EncoderMeta)>> {
        Err(StrataError::Unsupported("chunk metadata enumeration"))
    }

    /// See [`BufferMgr::chunk_metadata`].
    pub fn chunk_metadata_with_prefix(
        &self,
        _prefix: &ChunkKey,
    ) -> Result<Vec<(ChunkKey, EncoderMeta)>> {
        Err(StrataError::Unsupported("chunk metadata enumeration"))
    }

    /// Grow-in-place or migrate; never shrinks. The caller must hold a pin
    /// on `buffer` so its segment cannot be evicted mid-flight.
    pub(crate) fn reserve_buffer(&self, buffer: &ChunkBuffer, num_bytes: usize) -> Result<()> {
        let requested_pages = num_bytes.div_ceil(self.page_size);
        let migrated_key;
        let new_handle;
        {
            let mut pool = self.sized.lock();
            let handle = buffer.segment_handle();

            match handle {
                SegmentHandle::Slab(id) => {
                    let cur_pages = pool.arena.get(id).map(|seg| seg.num_pages).ok_or_else(|| {
                        StrataError::Inconsistency("buffer's segment is gone".into())
                    })?;
                    if requested_pages <= cur_pages {
                        return Ok(());
                    }
                    let extra = requested_pages - cur_pages;
                    if pool.grow_in_place(id, extra) {
                        return Ok(());
                    }
                }
                SegmentHandle::Placeholder(_) => {
                    if requested_pages == 0 {
                        // a zero-size chunk stays a placeholder until its
                        // first write
                        return Ok(());
                    }
                }
            }

            // No room in place: find a new segment and move the chunk across.
            let new_id = self.find_free_segment(&mut pool, requested_pages)?;

            let (old_key, old_buffer) = match handle {
                SegmentHandle::Slab(id) => match pool.arena.get_mut(id) {
                    Some(seg) => (seg.chunk_key.take(), seg.buffer.take()),
                    None => (None, None),
                },
                SegmentHandle::Placeholder(id) => {
                    let mut placeholders = self.placeholders.lock();
                    match placeholders.arena.get_mut(id) {
                        Some(seg) => (seg.chunk_key.take(), seg.buffer.take()),
                        None => (None, None),
                    }
                }
            };
            let Some(owned) = old_buffer else {
                pool.remove_segment(new_id);
                return Err(StrataError::Inconsistency(
                    "segment lost its buffer during reserve".into(),
                ));
            };

            let old_mem = owned.mem_ptr();
            let new_mem = pool
                .segment_base(new_id)
                .expect("migration target is slab-resident");
            buffer.set_mem(new_mem);
            if matches!(handle, SegmentHandle::Slab(_)) && !old_mem.is_null() {
                let len = owned.size();
                if len > 0 {
                    // Safety: the source segment is pinned and was therefore
                    // excluded from the window that produced the target, so
                    // the regions cannot overlap.
                    unsafe { device_copy(old_mem, new_mem, len, self.device_id, self.device_id) };
                }
            }
            if let Some(new_seg) = pool.arena.get_mut(new_id) {
                new_seg.chunk_key = old_key.clone();
                new_seg.buffer = Some(owned);
            }
            match handle {
                SegmentHandle::Slab(id) => pool.remove_segment(id),
                SegmentHandle::Placeholder(id) => self.remove_placeholder(id),
            }
            buffer.set_segment_handle(SegmentHandle::Slab(new_id));
            migrated_key = old_key;
            new_handle = SegmentHandle::Slab(new_id);
        }
        // sized lock released before the index is touched
        if let Some(key) = migrated_key {
            self.chunk_index.lock().insert(key, new_handle);
        }
        Ok(())
    }

    /// First-fit across existing slabs, then slab growth, then eviction.
    /// Runs under the sized lock.
    fn find_free_segment(&self, pool: &mut SlabPool, requested_pages: usize) -> Result<SegmentId> {
        debug_assert!(requested_pages > 0);
        if requested_pages > self.num_pages_per_slab {
            return Err(StrataError::AllocationTooLarge {
                requested_pages,
                max_pages: self.num_pages_per_slab,
            });
        }
        if let Some(id) = pool.find_free(requested_pages, self.next_epoch()) {
            return Ok(id);
        }
        if pool.num_slabs() < self.max_num_slabs {
            let slab = pool.add_slab();
            // a fresh slab always fits a request bounded by the slab size
            if let Some(id) = pool.find_free_in_slab(slab, requested_pages, self.next_epoch()) {
                return Ok(id);
            }
        }
        let plan = pool
            .plan_eviction(requested_pages)
            .ok_or(StrataError::OutOfMemory { requested_pages })?;
        let (new_id, displaced) =
            pool.evict(plan.slab, plan.start_pos, requested_pages, self.next_epoch());
        if !displaced.is_empty() {
            // canonical order: sized (held) then chunk index
            let mut index = self.chunk_index.lock();
            for (key, _) in &displaced {
                index.remove(key);
            }
        }
        Ok(new_id)
    }

    /// Finds the resident buffer for `key`, pinning it under the sized lock
    /// and stamping a fresh epoch. Stale handles left by raced deletions are
    /// dropped as absent.
    fn lookup_resident(&self, key: &ChunkKey) -> Option<Arc<ChunkBuffer>> {
        let mut pool = self.sized.lock();
        let mut index = self.chunk_index.lock();
        let handle = index.get(key)?;
        match self.resolve_buffer(&pool, handle) {
            Some(buffer) => {
                // Pinned under the sized lock, so eviction cannot choose this
                // segment between lookup and pin.
                buffer.pin();
                if let SegmentHandle::Slab(id) = handle {
                    if let Some(seg) = pool.arena.get_mut(id) {
                        seg.last_touched = self.next_epoch();
                    }
                }
                trace!(%key, "buffer pool hit");
                Some(buffer)
            }
            None => {
                index.remove(key);
                None
            }
        }
    }

    fn resolve_buffer(&self, pool: &SlabPool, handle: SegmentHandle) -> Option<Arc<ChunkBuffer>> {
        match handle {
            SegmentHandle::Slab(id) => pool.arena.get(id).and_then(|seg| seg.buffer.clone()),
            SegmentHandle::Placeholder(id) => self
                .placeholders
                .lock()
                .arena
                .get(id)
                .and_then(|seg| seg.buffer.clone()),
        }
    }

    fn destroy_segment(&self, handle: SegmentHandle) {
        match handle {
            SegmentHandle::Slab(id) => self.sized.lock().remove_segment(id),
            SegmentHandle::Placeholder(id) => self.remove_placeholder(id),
        }
    }

    fn remove_placeholder(&self, id: SegmentId) {
        let mut placeholders = self.placeholders.lock();
        placeholders.arena.remove(id);
        placeholders.order.retain(|&s| s != id);
    }

    /// Copies the resident chunk into a caller-supplied destination,
    /// honoring update-vs-append semantics. The caller holds a pin on
    /// `buffer`.
    fn copy_out(&self, buffer: &ChunkBuffer, dest: &ChunkBuffer, num_bytes: usize) -> Result<()> {
        let chunk_size = if num_bytes == 0 {
            buffer.size()
        } else {
            // never read past the resident bytes
            num_bytes.min(buffer.size())
        };
        dest.reserve(chunk_size)?;
        if buffer.is_updated() {
            // Safety: dest just reserved chunk_size bytes; the pin keeps the
            // source bytes put.
            unsafe { buffer.read_raw(dest.mem_ptr(), chunk_size, 0, dest.device_id()) };
        } else {
            // append semantics: only the tail the destination is missing
            let dest_size = dest.size();
            if chunk_size > dest_size {
                // Safety: as above, offset past the destination's current
                // bytes and within its reservation.
                unsafe {
                    buffer.read_raw(
                        dest.mem_ptr().add(dest_size),
                        chunk_size - dest_size,
                        dest_size,
                        dest.device_id(),
                    )
                };
            }
        }
        dest.set_size(chunk_size);
        dest.sync_encoder(buffer);
        Ok(())
    }

    /// Writes `src` into the resident chunk, honoring update-vs-append
    /// semantics. The caller holds a pin on `buffer`.
    fn copy_in(&self, buffer: &ChunkBuffer, src: &ChunkBuffer, num_bytes: usize) -> Result<()> {
        let old_size = buffer.size();
        let new_size = if num_bytes == 0 { src.size() } else { num_bytes };

        if buffer.is_dirty() {
            return Err(StrataError::Inconsistency(
                "target chunk is already dirty".into(),
            ));
        }
        if new_size > src.size() {
            return Err(StrataError::Inconsistency(format!(
                "source chunk holds {} bytes but {} were requested",
                src.size(),
                new_size
            )));
        }

        if src.is_updated() {
            let bytes = if new_size > 0 {
                let src_ptr = src.mem_ptr();
                if src_ptr.is_null() {
                    return Err(StrataError::Inconsistency(
                        "source buffer is unallocated".into(),
                    ));
                }
                // Safety: new_size is within the source's logical size, and
                // the caller keeps the source alive for the call.
                unsafe { std::slice::from_raw_parts(src_ptr, new_size) }
            } else {
                &[]
            };
            buffer.write(bytes, 0, src.device_id())?;
        } else if src.is_appended() {
            if old_size >= new_size {
                return Err(StrataError::Inconsistency(
                    "append requires the chunk to grow".into(),
                ));
            }
            let src_ptr = src.mem_ptr();
            if src_ptr.is_null() {
                return Err(StrataError::Inconsistency(
                    "source buffer is unallocated".into(),
                ));
            }
            // Safety: old_size..new_size is within the source's bytes.
            let tail =
                unsafe { std::slice::from_raw_parts(src_ptr.add(old_size), new_size - old_size) };
            buffer.append(tail, src.device_id())?;
        }
        // a clean source transfers nothing but still syncs metadata
        src.clear_dirty_bits();
        buffer.sync_encoder(src);
        Ok(())
    }
}

impl ParentMgr for BufferMgr {
    fn fetch_buffer(&self, key: &ChunkKey, dest: &ChunkBuffer, num_bytes: usize) -> Result<()> {
        BufferMgr::fetch_buffer(self, key, dest, num_bytes)
    }

    fn put_buffer(&self, key: &ChunkKey, src: &ChunkBuffer) -> Result<()> {
        BufferMgr::put_buffer(self, key, src, 0).map(|_| ())
    }
}
