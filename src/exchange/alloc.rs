//! Contiguous allocation for the buffer exchange.
//!
//! The exchange needs exactly one capability from the platform allocator:
//! hand out one physically contiguous, page-aligned region per buffer and
//! take it back, once, with exact accounting. [`ContigAllocator`] is that
//! seam; [`MemfdAllocator`] is the host production implementation, backed
//! by `memfd_create` + `MAP_SHARED` mmap so the same pages stay shareable
//! across processes with zero copies.
//!
//! On a real device platform the allocation would additionally carry
//! weak-ordering / write-combine cache attributes; a host process cannot
//! express those, so here they are a property of the allocation path rather
//! than of the pages themselves.

use crate::error::{Error, Result};
use crate::exchange::Consumer;
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Page size (4KB).
pub const PAGE_SIZE: usize = 4096;

/// One contiguous, page-aligned allocation.
///
/// Carries both views of the region: the CPU-addressable mapping and the
/// bus address consumers reach it by. The region is produced by
/// [`ContigAllocator::allocate`] and must be returned, unmodified, to
/// [`ContigAllocator::free`] on the same allocator.
#[derive(Debug)]
pub struct ContigRegion {
    cpu: NonNull<u8>,
    bus_addr: u64,
    len: usize,
    /// Backing memfd. Kept open for the lifetime of the region so the
    /// pages can be re-mapped by other processes.
    fd: Option<OwnedFd>,
}

// SAFETY: the region is a plain record of addresses plus an owned fd; the
// mapping it describes is valid from any thread.
unsafe impl Send for ContigRegion {}
// SAFETY: shared references only read the addresses.
unsafe impl Sync for ContigRegion {}

impl ContigRegion {
    /// Assemble a region from its parts.
    ///
    /// For use by [`ContigAllocator`] implementations. `len` must be a
    /// positive multiple of [`PAGE_SIZE`]; `fd` is the backing file
    /// descriptor on platforms that have one.
    pub fn new(cpu: NonNull<u8>, bus_addr: u64, len: usize, fd: Option<OwnedFd>) -> Self {
        debug_assert!(len > 0 && len % PAGE_SIZE == 0);
        Self { cpu, bus_addr, len, fd }
    }

    /// Start of the CPU-addressable mapping.
    #[inline]
    pub fn cpu_ptr(&self) -> NonNull<u8> {
        self.cpu
    }

    /// Bus address of the region as seen from the owning consumer's side.
    #[inline]
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    /// Length in bytes. Always a multiple of [`PAGE_SIZE`].
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region has zero length (never for a live region).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pages in the region.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.len / PAGE_SIZE
    }
}

/// Platform seam for obtaining and releasing contiguous memory.
///
/// One production implementation exists per platform; [`MemfdAllocator`]
/// covers coherent hosts. Implementations must be usable concurrently.
pub trait ContigAllocator: Send + Sync {
    /// Obtain one contiguous region of `len` bytes for `owner`.
    ///
    /// `len` must be non-zero and a multiple of [`PAGE_SIZE`], otherwise
    /// the call fails with [`Error::InvalidArgument`] and no memory is
    /// touched. Exhaustion surfaces as [`Error::OutOfMemory`]; it is never
    /// retried here. Returned pages are zero-filled.
    fn allocate(&self, owner: &Consumer, len: usize) -> Result<ContigRegion>;

    /// Release a region previously returned by [`allocate`](Self::allocate).
    ///
    /// Consuming the region by value guarantees the exact size and
    /// addresses from allocation come back, and that it comes back once.
    fn free(&self, owner: &Consumer, region: ContigRegion);

    /// Bytes currently allocated and not yet freed.
    ///
    /// Drives leak accounting: a create/release pair must leave this
    /// value unchanged.
    fn bytes_outstanding(&self) -> usize;
}

/// Host contiguous allocator backed by `memfd_create` + `MAP_SHARED` mmap.
///
/// Each allocation is an anonymous in-memory file mapped shared, so the
/// pages are zero-filled, virtually contiguous, and shareable by fd. The
/// bus address is the identity of the mapping, matching the identity
/// translation used on coherent hosts; a device platform substitutes its
/// own [`ContigAllocator`] with real bus addresses.
#[derive(Debug, Default)]
pub struct MemfdAllocator {
    outstanding: AtomicUsize,
}

impl MemfdAllocator {
    /// Create a host allocator with empty accounting.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContigAllocator for MemfdAllocator {
    fn allocate(&self, owner: &Consumer, len: usize) -> Result<ContigRegion> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "allocation size {len} is not a positive multiple of {PAGE_SIZE}"
            )));
        }

        let fd = rustix::fs::memfd_create("dmashare-region", rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, len as u64)?;

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|errno| {
                if errno == rustix::io::Errno::NOMEM {
                    Error::OutOfMemory { requested: len }
                } else {
                    Error::System(errno)
                }
            })?
        };

        let cpu = NonNull::new(ptr.cast::<u8>())
            .ok_or(Error::OutOfMemory { requested: len })?;

        self.outstanding.fetch_add(len, Ordering::AcqRel);
        tracing::debug!(
            owner = %owner,
            len,
            addr = cpu.as_ptr() as u64,
            "allocated contiguous region"
        );

        Ok(ContigRegion {
            cpu,
            bus_addr: cpu.as_ptr() as u64,
            len,
            fd: Some(fd),
        })
    }

    fn free(&self, owner: &Consumer, region: ContigRegion) {
        // Unmap before the fd is closed.
        unsafe {
            let _ = rustix::mm::munmap(region.cpu.as_ptr().cast(), region.len);
        }
        self.outstanding.fetch_sub(region.len, Ordering::AcqRel);
        tracing::debug!(owner = %owner, len = region.len, "freed contiguous region");
        drop(region.fd);
    }

    fn bytes_outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}
