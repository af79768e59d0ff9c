//! Handle issuance and the descriptor table.
//!
//! A [`BufferHandle`] is the exported face of a buffer: cloning duplicates
//! the handle (sharing the buffer), dropping releases it, and the buffer's
//! only public operations run through it. The [`HandleRegistry`] maps
//! process-visible integer descriptors to handles, so control-plane
//! callers can name buffers without holding Rust objects.

use crate::error::{Error, Result};
use crate::exchange::{
    Attachment, BufferObject, BusTranslator, Consumer, ContigAllocator, Direction,
    IdentityTranslator, MemfdAllocator,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

/// Default descriptor-table capacity.
pub(crate) const DEFAULT_CAPACITY: usize = 1024;

/// An owned, duplicable reference to a shared buffer.
///
/// Every live handle accounts for one reference on the underlying
/// [`BufferObject`]; the buffer is torn down exactly when the last handle,
/// attachment, or fault mapping referencing it goes away.
pub struct BufferHandle {
    buffer: Arc<BufferObject>,
}

impl BufferHandle {
    /// Wrap a freshly allocated buffer, adopting its initial reference.
    pub(crate) fn from_buffer(buffer: Arc<BufferObject>) -> Self {
        Self { buffer }
    }

    pub(crate) fn buffer(&self) -> &Arc<BufferObject> {
        &self.buffer
    }

    /// Attach a consumer to the buffer.
    ///
    /// Always succeeds on a live handle; the attachment takes its own
    /// buffer reference, independent of this handle.
    pub fn attach(&self, consumer: &Consumer) -> Attachment {
        Attachment::new(Arc::clone(&self.buffer), consumer)
    }

    /// Open a CPU-access bracket. See [`BufferObject::begin_access`].
    pub fn begin_access(&self, direction: Direction) -> Result<()> {
        self.buffer.begin_access(direction)
    }

    /// Close a CPU-access bracket. See [`BufferObject::end_access`].
    pub fn end_access(&self, direction: Direction) -> Result<()> {
        self.buffer.end_access(direction)
    }

    /// Number of pages in the buffer.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.buffer.page_count()
    }

    /// Buffer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if the buffer covers no pages (never for a live handle).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bus address of the buffer's base.
    #[inline]
    pub fn bus_base(&self) -> u64 {
        self.buffer.bus_base()
    }

    /// Current buffer reference count (diagnostic).
    pub fn ref_count(&self) -> usize {
        self.buffer.ref_count()
    }

    /// Whether the buffer currently holds a cached CPU-access mapping.
    pub fn has_cached_mapping(&self) -> bool {
        self.buffer.has_cached_mapping()
    }
}

impl Clone for BufferHandle {
    /// Duplicate the handle, sharing the buffer.
    fn clone(&self) -> Self {
        self.buffer.retain();
        Self {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.buffer.release_ref();
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// Issues descriptors for exported buffers.
///
/// The registry owns the platform seams (allocator and translator) and a
/// bounded descriptor table. Descriptors are non-negative, never reused
/// within a registry's lifetime, and invalidated atomically with the
/// removal of their table entry.
pub struct HandleRegistry {
    allocator: Arc<dyn ContigAllocator>,
    translator: Arc<dyn BusTranslator>,
    table: Mutex<HashMap<i32, BufferHandle>>,
    next_descriptor: AtomicI32,
    capacity: usize,
}

impl HandleRegistry {
    /// Create a registry over the given platform seams.
    ///
    /// `capacity` bounds the number of simultaneously live descriptors.
    pub fn new(
        allocator: Arc<dyn ContigAllocator>,
        translator: Arc<dyn BusTranslator>,
        capacity: usize,
    ) -> Self {
        Self {
            allocator,
            translator,
            table: Mutex::new(HashMap::new()),
            next_descriptor: AtomicI32::new(0),
            capacity,
        }
    }

    /// Create a registry on the host platform seams
    /// ([`MemfdAllocator`] + [`IdentityTranslator`]) with the default
    /// descriptor capacity.
    pub fn with_host_platform() -> Self {
        Self::new(
            Arc::new(MemfdAllocator::new()),
            Arc::new(IdentityTranslator::new()),
            DEFAULT_CAPACITY,
        )
    }

    /// The registry's allocator, for accounting.
    pub fn allocator(&self) -> &Arc<dyn ContigAllocator> {
        &self.allocator
    }

    /// Allocate a buffer of `len` bytes for `owner` and export it.
    ///
    /// Validates the size (positive, page-aligned), allocates the
    /// contiguous region, and installs a handle with reference count one,
    /// returning its descriptor. If installation fails after the
    /// allocation succeeded, the allocation is freed before the error
    /// returns; nothing leaks on any path.
    pub fn create(&self, owner: &Consumer, len: usize) -> Result<i32> {
        let buffer = BufferObject::allocate(
            Arc::clone(&self.allocator),
            Arc::clone(&self.translator),
            owner,
            len,
        )?;
        let handle = BufferHandle::from_buffer(buffer);

        let mut table = self.table.lock().unwrap();
        if table.len() >= self.capacity {
            // Dropping the handle unwinds the allocation before we return.
            drop(table);
            drop(handle);
            return Err(Error::OutOfMemory { requested: len });
        }

        let descriptor = self.next_descriptor.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(owner = %owner, descriptor, len, "exported buffer");
        table.insert(descriptor, handle);
        Ok(descriptor)
    }

    /// Look up a descriptor, returning an independently owned handle.
    ///
    /// The returned handle carries its own buffer reference; the buffer
    /// stays alive even if the descriptor is closed afterwards.
    pub fn get(&self, descriptor: i32) -> Result<BufferHandle> {
        self.table
            .lock()
            .unwrap()
            .get(&descriptor)
            .cloned()
            .ok_or(Error::BadDescriptor(descriptor))
    }

    /// Close a descriptor, dropping the table's reference.
    ///
    /// The descriptor is invalid from the moment this returns; the buffer
    /// itself is released only when its last reference goes away.
    pub fn close(&self, descriptor: i32) -> Result<()> {
        let handle = self
            .table
            .lock()
            .unwrap()
            .remove(&descriptor)
            .ok_or(Error::BadDescriptor(descriptor))?;
        tracing::debug!(descriptor, "closed descriptor");
        drop(handle);
        Ok(())
    }

    /// Number of live descriptors.
    pub fn live_descriptors(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("live_descriptors", &self.live_descriptors())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PAGE_SIZE;

    #[test]
    fn create_then_close_balances_accounting() {
        let registry = HandleRegistry::with_host_platform();
        let owner = Consumer::new("owner");

        let descriptor = registry.create(&owner, 4 * PAGE_SIZE).unwrap();
        assert!(descriptor >= 0);
        assert_eq!(registry.allocator().bytes_outstanding(), 4 * PAGE_SIZE);

        registry.close(descriptor).unwrap();
        assert_eq!(registry.allocator().bytes_outstanding(), 0);
        assert_eq!(registry.live_descriptors(), 0);
    }

    #[test]
    fn invalid_sizes_allocate_nothing() {
        let registry = HandleRegistry::with_host_platform();
        let owner = Consumer::new("owner");

        for len in [0, 1, PAGE_SIZE - 1, PAGE_SIZE + 1, 4097] {
            assert!(matches!(
                registry.create(&owner, len),
                Err(Error::InvalidArgument(_))
            ));
        }
        assert_eq!(registry.allocator().bytes_outstanding(), 0);
        assert_eq!(registry.live_descriptors(), 0);
    }

    #[test]
    fn descriptors_are_not_reused() {
        let registry = HandleRegistry::with_host_platform();
        let owner = Consumer::new("owner");

        let first = registry.create(&owner, PAGE_SIZE).unwrap();
        registry.close(first).unwrap();
        let second = registry.create(&owner, PAGE_SIZE).unwrap();

        assert_ne!(first, second);
        registry.close(second).unwrap();
    }

    #[test]
    fn closed_descriptor_is_invalid() {
        let registry = HandleRegistry::with_host_platform();
        let owner = Consumer::new("owner");

        let descriptor = registry.create(&owner, PAGE_SIZE).unwrap();
        registry.close(descriptor).unwrap();

        assert!(matches!(
            registry.get(descriptor),
            Err(Error::BadDescriptor(_))
        ));
        assert!(matches!(
            registry.close(descriptor),
            Err(Error::BadDescriptor(_))
        ));
    }

    #[test]
    fn duplicated_handle_outlives_descriptor() {
        let registry = HandleRegistry::with_host_platform();
        let owner = Consumer::new("owner");

        let descriptor = registry.create(&owner, PAGE_SIZE).unwrap();
        let handle = registry.get(descriptor).unwrap();
        assert_eq!(handle.ref_count(), 2);

        registry.close(descriptor).unwrap();
        // Table reference gone, ours remains; the allocation survives.
        assert_eq!(handle.ref_count(), 1);
        assert_eq!(registry.allocator().bytes_outstanding(), PAGE_SIZE);

        drop(handle);
        assert_eq!(registry.allocator().bytes_outstanding(), 0);
    }

    #[test]
    fn full_table_unwinds_the_allocation() {
        let registry = HandleRegistry::new(
            Arc::new(MemfdAllocator::new()),
            Arc::new(IdentityTranslator::new()),
            1,
        );
        let owner = Consumer::new("owner");

        let descriptor = registry.create(&owner, PAGE_SIZE).unwrap();
        assert!(matches!(
            registry.create(&owner, PAGE_SIZE),
            Err(Error::OutOfMemory { .. })
        ));
        // The failed create left no allocation behind.
        assert_eq!(registry.allocator().bytes_outstanding(), PAGE_SIZE);

        registry.close(descriptor).unwrap();
        assert_eq!(registry.allocator().bytes_outstanding(), 0);
    }

    #[test]
    fn handle_clone_shares_the_buffer() {
        let registry = HandleRegistry::with_host_platform();
        let owner = Consumer::new("owner");

        let descriptor = registry.create(&owner, PAGE_SIZE).unwrap();
        let handle = registry.get(descriptor).unwrap();
        let duplicate = handle.clone();

        assert_eq!(duplicate.ref_count(), 3);
        assert_eq!(duplicate.bus_base(), handle.bus_base());

        drop(handle);
        drop(duplicate);
        registry.close(descriptor).unwrap();
        assert_eq!(registry.allocator().bytes_outstanding(), 0);
    }
}
