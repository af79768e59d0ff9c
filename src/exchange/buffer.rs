//! The buffer object and its release protocol.
//!
//! A [`BufferObject`] coordinates four independent lifetimes over one
//! contiguous allocation: the allocation itself, the exported handle,
//! zero or more attachments, and any fault-driven process mapping. All of
//! them funnel into a single explicit reference count; whichever release
//! observes the count reach zero tears the buffer down, exactly once.
//!
//! The count is an explicit `AtomicUsize` rather than `Arc` strong counts
//! so the free-at-zero transition stays auditable: `retain` and
//! `release_ref` are the only mutations, and `fetch_sub` totally orders
//! the decrement against the zero check, so no two releases can both
//! observe the transition.
//!
//! CPU-access brackets live here too, because they own the buffer's cached
//! mapping: the first [`begin_access`](BufferObject::begin_access)
//! establishes a translation against the owning consumer and caches it;
//! every later bracket only synchronizes caches over that same mapping.
//! Caching amortizes translation cost across the common pattern of short,
//! frequent software read/write spans on a buffer that stays attached to
//! one owner for its whole life.

use crate::error::{Error, Result};
use crate::exchange::{
    BusMapping, BusTranslator, Consumer, ContigAllocator, ContigRegion, Direction, SgEntry,
    PAGE_SIZE,
};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A shareable, reference-counted contiguous buffer.
///
/// Constructed once by [`allocate`](BufferObject::allocate) with a count of
/// one; destroyed when the count returns to zero. Between those points the
/// buffer may be attached, mapped, bracketed for CPU access, and faulted
/// into a process mapping, from any number of threads.
pub struct BufferObject {
    page_count: usize,
    /// Copies of the region's addresses, readable without the region lock.
    cpu_base: NonNull<u8>,
    bus_base: u64,
    /// The one allocation. Taken exactly once, at teardown.
    region: Mutex<Option<ContigRegion>>,
    /// Mapping cached across CPU-access brackets. All readers and writers
    /// of this field serialize on the mutex, including teardown.
    cached: Mutex<Option<BusMapping>>,
    owner: Consumer,
    refs: AtomicUsize,
    allocator: Arc<dyn ContigAllocator>,
    translator: Arc<dyn BusTranslator>,
}

// SAFETY: the raw base pointer is only dereferenced by fault resolution,
// which holds a reference keeping the allocation alive; everything else is
// guarded by atomics and mutexes.
unsafe impl Send for BufferObject {}
// SAFETY: interior mutability is confined to the atomic count and the two
// mutexes.
unsafe impl Sync for BufferObject {}

impl BufferObject {
    /// Allocate a contiguous buffer of `len` bytes owned by `owner`.
    ///
    /// `len` must be a positive multiple of [`PAGE_SIZE`]; validation and
    /// exhaustion errors come straight from the allocator, untouched. The
    /// returned buffer holds one reference.
    pub fn allocate(
        allocator: Arc<dyn ContigAllocator>,
        translator: Arc<dyn BusTranslator>,
        owner: &Consumer,
        len: usize,
    ) -> Result<Arc<Self>> {
        let region = allocator.allocate(owner, len)?;

        let buffer = Arc::new(Self {
            page_count: region.page_count(),
            cpu_base: region.cpu_ptr(),
            bus_base: region.bus_addr(),
            region: Mutex::new(Some(region)),
            cached: Mutex::new(None),
            owner: owner.clone(),
            refs: AtomicUsize::new(1),
            allocator,
            translator,
        });

        tracing::debug!(
            owner = %buffer.owner,
            pages = buffer.page_count,
            bus_addr = buffer.bus_base,
            "buffer allocated"
        );
        Ok(buffer)
    }

    /// Number of pages in the allocation.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Length of the allocation in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.page_count * PAGE_SIZE
    }

    /// Returns true if the buffer covers no pages (never for a live buffer).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.page_count == 0
    }

    /// Bus address of the allocation's base.
    #[inline]
    pub fn bus_base(&self) -> u64 {
        self.bus_base
    }

    /// CPU-addressable base of the allocation.
    ///
    /// Valid only while the caller holds a reference on the buffer.
    #[inline]
    pub fn cpu_base(&self) -> NonNull<u8> {
        self.cpu_base
    }

    /// The consumer context the buffer was allocated against.
    #[inline]
    pub fn owner(&self) -> &Consumer {
        &self.owner
    }

    /// Current reference count. Diagnostic only; the value may be stale by
    /// the time the caller reads it.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Whether a CPU-access mapping is currently cached.
    pub fn has_cached_mapping(&self) -> bool {
        self.cached.lock().unwrap().is_some()
    }

    /// Take one more reference.
    ///
    /// The caller must already hold a reference; taking a reference on a
    /// buffer whose count reached zero is a protocol violation.
    pub(crate) fn retain(&self) {
        let prev = self.refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "retain on a released buffer");
    }

    /// Drop one reference, tearing the buffer down on the 1 -> 0 transition.
    pub(crate) fn release_ref(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.destroy();
        }
    }

    /// The single-range scatter description covering the whole allocation.
    pub(crate) fn whole_buffer_sg(&self) -> [SgEntry; 1] {
        [SgEntry {
            addr: self.cpu_base.as_ptr() as u64,
            len: self.len(),
        }]
    }

    /// Translate the whole buffer for `consumer` in `direction`.
    ///
    /// Used by attachments; the cached CPU-access mapping goes through
    /// [`begin_access`](Self::begin_access) instead.
    pub(crate) fn translate_for(
        &self,
        consumer: &Consumer,
        direction: Direction,
    ) -> Result<BusMapping> {
        let ranges = self
            .translator
            .map_ranges(consumer, direction, &self.whole_buffer_sg())?;
        Ok(BusMapping::new(direction, ranges))
    }

    /// Reverse a translation produced by [`translate_for`](Self::translate_for).
    pub(crate) fn untranslate_for(&self, consumer: &Consumer, mapping: &BusMapping) {
        self.translator
            .unmap_ranges(consumer, mapping.direction(), mapping.ranges());
    }

    /// Open a CPU-access bracket.
    ///
    /// If no mapping is cached yet, one is established against the owning
    /// consumer in `direction` and cached for reuse. If one is already
    /// cached, caches are instead synchronized so the CPU observes the
    /// consumer's writes. The two branches are mutually exclusive; a single
    /// call never does both.
    pub fn begin_access(&self, direction: Direction) -> Result<()> {
        let mut cached = self.cached.lock().unwrap();
        match cached.as_ref() {
            None => {
                let ranges =
                    self.translator
                        .map_ranges(&self.owner, direction, &self.whole_buffer_sg())?;
                tracing::debug!(owner = %self.owner, ?direction, "cached CPU-access mapping");
                *cached = Some(BusMapping::new(direction, ranges));
                Ok(())
            }
            Some(mapping) => {
                self.translator
                    .sync_for_cpu(&self.owner, direction, mapping.ranges());
                Ok(())
            }
        }
    }

    /// Close a CPU-access bracket.
    ///
    /// Synchronizes caches so the consumer observes the CPU's writes.
    /// Fails with [`Error::NoActiveMapping`] if no bracket was ever opened;
    /// never creates or destroys the cached mapping.
    pub fn end_access(&self, direction: Direction) -> Result<()> {
        let cached = self.cached.lock().unwrap();
        match cached.as_ref() {
            None => Err(Error::NoActiveMapping),
            Some(mapping) => {
                self.translator
                    .sync_for_device(&self.owner, direction, mapping.ranges());
                Ok(())
            }
        }
    }

    /// Tear the buffer down: cached mapping first, then the allocation.
    ///
    /// Reached only from the release that observed the count hit zero, so
    /// it runs at most once; the `Option` takes make that checkable.
    fn destroy(&self) {
        if let Some(mapping) = self.cached.lock().unwrap().take() {
            self.translator
                .unmap_ranges(&self.owner, mapping.direction(), mapping.ranges());
        }
        if let Some(region) = self.region.lock().unwrap().take() {
            self.allocator.free(&self.owner, region);
        }
        tracing::debug!(owner = %self.owner, pages = self.page_count, "buffer released");
    }
}

impl std::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferObject")
            .field("pages", &self.page_count)
            .field("bus_base", &self.bus_base)
            .field("owner", &self.owner)
            .field("refs", &self.ref_count())
            .field("cached_mapping", &self.has_cached_mapping())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{IdentityTranslator, MappedRange, MemfdAllocator};

    fn host_buffer(len: usize) -> (Arc<dyn ContigAllocator>, Arc<BufferObject>) {
        let allocator: Arc<dyn ContigAllocator> = Arc::new(MemfdAllocator::new());
        let translator: Arc<dyn BusTranslator> = Arc::new(IdentityTranslator::new());
        let owner = Consumer::new("owner");
        let buffer = BufferObject::allocate(Arc::clone(&allocator), translator, &owner, len).unwrap();
        (allocator, buffer)
    }

    #[test]
    fn release_frees_allocation_exactly_once() {
        let (allocator, buffer) = host_buffer(2 * PAGE_SIZE);
        assert_eq!(allocator.bytes_outstanding(), 2 * PAGE_SIZE);
        assert_eq!(buffer.ref_count(), 1);

        buffer.release_ref();
        assert_eq!(allocator.bytes_outstanding(), 0);
    }

    #[test]
    fn retain_defers_release() {
        let (allocator, buffer) = host_buffer(PAGE_SIZE);

        buffer.retain();
        buffer.release_ref();
        assert_eq!(allocator.bytes_outstanding(), PAGE_SIZE);

        buffer.release_ref();
        assert_eq!(allocator.bytes_outstanding(), 0);
    }

    #[test]
    fn begin_access_caches_one_mapping() {
        let (_allocator, buffer) = host_buffer(PAGE_SIZE);

        assert!(!buffer.has_cached_mapping());
        buffer.begin_access(Direction::Bidirectional).unwrap();
        assert!(buffer.has_cached_mapping());

        // Second bracket reuses the cached mapping.
        buffer.begin_access(Direction::Bidirectional).unwrap();
        assert!(buffer.has_cached_mapping());

        buffer.end_access(Direction::Bidirectional).unwrap();
        buffer.release_ref();
    }

    #[test]
    fn end_access_without_begin_fails() {
        let (_allocator, buffer) = host_buffer(PAGE_SIZE);
        assert!(matches!(
            buffer.end_access(Direction::FromConsumer),
            Err(Error::NoActiveMapping)
        ));
        buffer.release_ref();
    }

    #[test]
    fn end_access_does_not_consume_mapping() {
        let (_allocator, buffer) = host_buffer(PAGE_SIZE);

        buffer.begin_access(Direction::FromConsumer).unwrap();
        buffer.end_access(Direction::FromConsumer).unwrap();
        assert!(buffer.has_cached_mapping());
        buffer.end_access(Direction::FromConsumer).unwrap();

        buffer.release_ref();
    }

    #[test]
    fn translation_failure_leaves_no_cached_mapping() {
        struct RejectingTranslator;
        impl BusTranslator for RejectingTranslator {
            fn map_ranges(
                &self,
                _consumer: &Consumer,
                _direction: Direction,
                _ranges: &[SgEntry],
            ) -> Result<Vec<MappedRange>> {
                Err(Error::TranslationFailed("no bus space".into()))
            }
            fn unmap_ranges(&self, _: &Consumer, _: Direction, _: &[MappedRange]) {}
            fn sync_for_cpu(&self, _: &Consumer, _: Direction, _: &[MappedRange]) {}
            fn sync_for_device(&self, _: &Consumer, _: Direction, _: &[MappedRange]) {}
        }

        let allocator: Arc<dyn ContigAllocator> = Arc::new(MemfdAllocator::new());
        let owner = Consumer::new("owner");
        let buffer = BufferObject::allocate(
            Arc::clone(&allocator),
            Arc::new(RejectingTranslator),
            &owner,
            PAGE_SIZE,
        )
        .unwrap();

        assert!(matches!(
            buffer.begin_access(Direction::ToConsumer),
            Err(Error::TranslationFailed(_))
        ));
        assert!(!buffer.has_cached_mapping());
        // A failed bracket is still "never begun" for end_access.
        assert!(matches!(
            buffer.end_access(Direction::ToConsumer),
            Err(Error::NoActiveMapping)
        ));

        buffer.release_ref();
        assert_eq!(allocator.bytes_outstanding(), 0);
    }

    #[test]
    fn concurrent_releases_free_once() {
        use std::thread;

        let (allocator, buffer) = host_buffer(PAGE_SIZE);
        for _ in 0..7 {
            buffer.retain();
        }

        let mut handles = vec![];
        for _ in 0..8 {
            let buffer = Arc::clone(&buffer);
            handles.push(thread::spawn(move || buffer.release_ref()));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(allocator.bytes_outstanding(), 0);
    }
}
