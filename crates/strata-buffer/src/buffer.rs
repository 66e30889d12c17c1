//! Per-chunk buffer objects.

use crate::pool::BufferMgr;
use crate::segment::SegmentHandle;
use parking_lot::Mutex;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Weak;
use strata_common::{DeviceId, EncoderMeta, Result, StrataError};

/// Copies bytes between device-resident regions.
///
/// The in-memory tier only handles host memory, so the transfer is a plain
/// copy; the device ids ride along so callers state where each side lives.
///
/// # Safety
/// `src` must be valid for `len` reads, `dst` for `len` writes, and the two
/// regions must not overlap.
pub(crate) unsafe fn device_copy(
    src: *const u8,
    dst: *mut u8,
    len: usize,
    _src_device: DeviceId,
    _dst_device: DeviceId,
) {
    unsafe { ptr::copy_nonoverlapping(src, dst, len) };
}

/// A chunk's bytes plus the bookkeeping the pool needs around them.
///
/// The buffer does not own its memory: its base pointer aims into the slab
/// region of the segment that owns the buffer, and migration retargets the
/// pointer without copying the handle. The owning direction is
/// segment → buffer (`Arc`); the buffer's segment back-reference is a plain
/// handle updated by the manager.
///
/// A buffer starts pinned: the creating caller owns the first pin and
/// releases it with [`ChunkBuffer::unpin`]. While the pin count is nonzero
/// the segment cannot be evicted, which is what makes the base pointer safe
/// to dereference between `pin` and `unpin`.
pub struct ChunkBuffer {
    mgr: Weak<BufferMgr>,
    device_id: DeviceId,
    /// Page granularity recorded for dirty-range tracking.
    page_size: usize,
    /// Base of the chunk's bytes inside its slab; null until first
    /// allocation and after the pool clears.
    mem: AtomicPtr<u8>,
    /// Logical size in bytes; never exceeds the reserved pages.
    size: AtomicUsize,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    updated: AtomicBool,
    appended: AtomicBool,
    encoder: Mutex<EncoderMeta>,
    segment: Mutex<SegmentHandle>,
}

impl ChunkBuffer {
    pub(crate) fn new(
        mgr: Weak<BufferMgr>,
        device_id: DeviceId,
        page_size: usize,
        segment: SegmentHandle,
    ) -> Self {
        Self {
            mgr,
            device_id,
            page_size,
            mem: AtomicPtr::new(ptr::null_mut()),
            size: AtomicUsize::new(0),
            // Construction pins: the creating caller owns the first pin.
            pin_count: AtomicU32::new(1),
            dirty: AtomicBool::new(false),
            updated: AtomicBool::new(false),
            appended: AtomicBool::new(false),
            encoder: Mutex::new(EncoderMeta::default()),
            segment: Mutex::new(segment),
        }
    }

    /// Device this buffer's bytes live on.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Page granularity this chunk was created with.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Increments the pin count and returns the previous count.
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count and returns the new count.
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            // Underflow protection: restore to 0
            self.pin_count.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    /// Returns the current pin count.
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Returns true if this buffer is pinned.
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Logical size in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Sets the logical size without touching the bytes.
    pub fn set_size(&self, num_bytes: usize) {
        self.size.store(num_bytes, Ordering::Release);
    }

    /// Base pointer of the chunk's bytes; null while unallocated.
    pub fn mem_ptr(&self) -> *mut u8 {
        self.mem.load(Ordering::Acquire)
    }

    pub(crate) fn set_mem(&self, base: *mut u8) {
        self.mem.store(base, Ordering::Release);
    }

    pub(crate) fn segment_handle(&self) -> SegmentHandle {
        *self.segment.lock()
    }

    pub(crate) fn set_segment_handle(&self, handle: SegmentHandle) {
        *self.segment.lock() = handle;
    }

    pub(crate) fn belongs_to(&self, mgr: &Weak<BufferMgr>) -> bool {
        Weak::ptr_eq(&self.mgr, mgr)
    }

    /// Ensures at least `num_bytes` of backing space, growing in place or
    /// migrating to a larger segment. Never shrinks.
    pub fn reserve(&self, num_bytes: usize) -> Result<()> {
        let mgr = self
            .mgr
            .upgrade()
            .ok_or_else(|| StrataError::Inconsistency("buffer outlived its manager".into()))?;
        mgr.reserve_buffer(self, num_bytes)
    }

    /// Writes `src` at `offset`, reserving space as needed. Marks the buffer
    /// dirty and updated, and extends the logical size to cover the write.
    pub fn write(&self, src: &[u8], offset: usize, src_device: DeviceId) -> Result<()> {
        self.reserve(offset + src.len())?;
        if !src.is_empty() {
            let base = self.mem_ptr();
            if base.is_null() {
                return Err(StrataError::Inconsistency(
                    "write to an unallocated buffer".into(),
                ));
            }
            // Safety: reserve guaranteed offset + len bytes behind base, and
            // the caller's pin keeps the segment from moving underneath us.
            unsafe {
                device_copy(
                    src.as_ptr(),
                    base.add(offset),
                    src.len(),
                    src_device,
                    self.device_id,
                )
            };
        }
        self.dirty.store(true, Ordering::Release);
        self.updated.store(true, Ordering::Release);
        if offset + src.len() > self.size() {
            self.set_size(offset + src.len());
        }
        Ok(())
    }

    /// Appends `src` after the current logical size. Marks the buffer dirty
    /// and appended.
    pub fn append(&self, src: &[u8], src_device: DeviceId) -> Result<()> {
        let old_size = self.size();
        self.reserve(old_size + src.len())?;
        if !src.is_empty() {
            let base = self.mem_ptr();
            if base.is_null() {
                return Err(StrataError::Inconsistency(
                    "append to an unallocated buffer".into(),
                ));
            }
            // Safety: reserve guaranteed old_size + len bytes behind base.
            unsafe {
                device_copy(
                    src.as_ptr(),
                    base.add(old_size),
                    src.len(),
                    src_device,
                    self.device_id,
                )
            };
        }
        self.dirty.store(true, Ordering::Release);
        self.appended.store(true, Ordering::Release);
        self.set_size(old_size + src.len());
        Ok(())
    }

    /// Copies bytes starting at `offset` into `dst`.
    pub fn read_into(&self, dst: &mut [u8], offset: usize, dst_device: DeviceId) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        if offset + dst.len() > self.size() {
            return Err(StrataError::Inconsistency(format!(
                "read of {} bytes at offset {} past chunk size {}",
                dst.len(),
                offset,
                self.size()
            )));
        }
        let base = self.mem_ptr();
        if base.is_null() {
            return Err(StrataError::Inconsistency(
                "read from an unallocated buffer".into(),
            ));
        }
        // Safety: offset + len is within the logical size, which never
        // exceeds the reserved pages; the caller's pin keeps the bytes put.
        unsafe {
            device_copy(
                base.add(offset),
                dst.as_mut_ptr(),
                dst.len(),
                self.device_id,
                dst_device,
            )
        };
        Ok(())
    }

    /// Raw read used for buffer-to-buffer transfers.
    ///
    /// # Safety
    /// `dst` must be valid for `num_bytes` writes, `offset + num_bytes` must
    /// not exceed this buffer's reserved space, and the caller must hold a
    /// pin on this buffer for the duration.
    pub(crate) unsafe fn read_raw(
        &self,
        dst: *mut u8,
        num_bytes: usize,
        offset: usize,
        dst_device: DeviceId,
    ) {
        if num_bytes == 0 {
            return;
        }
        let base = self.mem_ptr();
        debug_assert!(!base.is_null());
        unsafe { device_copy(base.add(offset), dst, num_bytes, self.device_id, dst_device) };
    }

    /// Returns true if the buffer holds changes not yet flushed downstream.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Returns true if the buffer was overwritten in place.
    pub fn is_updated(&self) -> bool {
        self.updated.load(Ordering::Acquire)
    }

    /// Returns true if bytes were appended past the previously flushed size.
    pub fn is_appended(&self) -> bool {
        self.appended.load(Ordering::Acquire)
    }

    /// Clears the dirty, updated, and appended flags.
    pub fn clear_dirty_bits(&self) {
        self.dirty.store(false, Ordering::Release);
        self.updated.store(false, Ordering::Release);
        self.appended.store(false, Ordering::Release);
    }

    /// Returns a copy of the encoder metadata.
    pub fn encoder(&self) -> EncoderMeta {
        *self.encoder.lock()
    }

    /// Replaces the encoder metadata.
    pub fn set_encoder(&self, meta: EncoderMeta) {
        *self.encoder.lock() = meta;
    }

    /// Copies encoder metadata from `src`, keeping the chunk's
    /// interpretation in step with its bytes.
    pub fn sync_encoder(&self, src: &ChunkBuffer) {
        *self.encoder.lock() = src.encoder();
    }
}

impl std::fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("device_id", &self.device_id)
            .field("size", &self.size())
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .field("updated", &self.is_updated())
            .field("appended", &self.is_appended())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentId;
    use strata_common::Encoding;

    fn detached_buffer() -> ChunkBuffer {
        let handle = SegmentHandle::Placeholder(SegmentId {
            index: 0,
            generation: 0,
        });
        ChunkBuffer::new(Weak::new(), DeviceId(0), 64, handle)
    }

    #[test]
    fn test_buffer_starts_pinned() {
        let buffer = detached_buffer();
        assert_eq!(buffer.pin_count(), 1);
        assert!(buffer.is_pinned());
    }

    #[test]
    fn test_buffer_pin_unpin() {
        let buffer = detached_buffer();

        buffer.pin();
        assert_eq!(buffer.pin_count(), 2);

        assert_eq!(buffer.unpin(), 1);
        assert_eq!(buffer.unpin(), 0);
        assert!(!buffer.is_pinned());
    }

    #[test]
    fn test_buffer_unpin_underflow() {
        let buffer = detached_buffer();
        buffer.unpin();
        // Unpin when already at 0 should stay at 0
        assert_eq!(buffer.unpin(), 0);
        assert_eq!(buffer.pin_count(), 0);
    }

    #[test]
    fn test_buffer_dirty_flags() {
        let buffer = detached_buffer();
        assert!(!buffer.is_dirty());
        assert!(!buffer.is_updated());
        assert!(!buffer.is_appended());

        buffer.dirty.store(true, Ordering::Release);
        buffer.appended.store(true, Ordering::Release);
        assert!(buffer.is_dirty());
        assert!(buffer.is_appended());

        buffer.clear_dirty_bits();
        assert!(!buffer.is_dirty());
        assert!(!buffer.is_appended());
    }

    #[test]
    fn test_buffer_encoder_sync() {
        let a = detached_buffer();
        let b = detached_buffer();

        a.set_encoder(EncoderMeta {
            encoding: Encoding::Delta,
            elem_count: 9,
        });
        b.sync_encoder(&a);

        assert_eq!(b.encoder().encoding, Encoding::Delta);
        assert_eq!(b.encoder().elem_count, 9);
    }

    #[test]
    fn test_buffer_reserve_without_manager_fails() {
        let buffer = detached_buffer();
        assert!(matches!(
            buffer.reserve(128),
            Err(StrataError::Inconsistency(_))
        ));
    }

    #[test]
    fn test_buffer_read_unallocated_fails() {
        let buffer = detached_buffer();
        buffer.set_size(8);
        let mut dst = [0u8; 8];
        assert!(buffer.read_into(&mut dst, 0, DeviceId(0)).is_err());
    }
}
