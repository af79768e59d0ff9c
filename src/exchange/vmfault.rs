//! Fault-driven process memory mapping.
//!
//! A process maps a buffer into its address space up front, but no page
//! becomes resident until it is first touched. Each fault resolves one
//! page, independently and lazily, against the buffer's allocation; a
//! fault past the buffer's extent is answered with a bus error that
//! terminates only that access, never the mapping.
//!
//! The mapping holds a [`BufferHandle`] for its whole lifetime, so the
//! buffer cannot be released out from under resident pages. Residency is
//! an index-based table sized `page_count`, one entry per page, resolved
//! or not.

use crate::error::{Error, Result};
use crate::exchange::{BufferHandle, PAGE_SIZE};
use std::sync::Mutex;

/// Parameters of a process memory-mapping request.
#[derive(Debug, Clone, Copy)]
pub struct MapRequest {
    /// Whether the mapping requests shared (or may-share) visibility.
    /// Private mappings are rejected; the pages are shared by design.
    pub shared: bool,
}

impl MapRequest {
    /// A shared mapping request, the only kind that validates.
    pub fn shared() -> Self {
        Self { shared: true }
    }
}

/// One resident page of a fault-driven mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidentPage {
    /// Index of the page within the buffer.
    pub index: usize,
    /// CPU address of the page.
    pub cpu_addr: u64,
    /// Bus address of the page.
    pub bus_addr: u64,
}

/// A process memory mapping over a buffer, populated page by page.
///
/// Independent of any attachment: consumers and process mappings reference
/// the buffer separately.
pub struct FaultMapping {
    handle: BufferHandle,
    resident: Mutex<Vec<Option<ResidentPage>>>,
}

impl FaultMapping {
    /// Validate a mapping request and create the mapping, no pages resident.
    ///
    /// Fails with [`Error::InvalidArgument`] if the request does not ask
    /// for shared visibility. The handle is held until the mapping is
    /// dropped, keeping the buffer referenced for the mapping's duration.
    pub fn new(handle: BufferHandle, request: MapRequest) -> Result<Self> {
        if !request.shared {
            return Err(Error::InvalidArgument(
                "memory mapping must request shared visibility".into(),
            ));
        }
        let page_count = handle.page_count();
        tracing::debug!(pages = page_count, "fault mapping created");
        Ok(Self {
            handle,
            resident: Mutex::new(vec![None; page_count]),
        })
    }

    /// Number of pages the mapping spans.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.handle.page_count()
    }

    /// Number of pages currently resident.
    pub fn resident_pages(&self) -> usize {
        self.resident
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.is_some())
            .count()
    }

    /// The handle the mapping holds.
    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    /// Resolve the fault for page `index`.
    ///
    /// Out-of-range indices fail with [`Error::BusError`]; the mapping
    /// stays usable. In-range faults resolve the page from the buffer's
    /// allocation on first touch and return the same page on every later
    /// fault of the same index.
    pub fn fault(&self, index: usize) -> Result<ResidentPage> {
        let page_count = self.page_count();
        if index >= page_count {
            tracing::warn!(index, page_count, "fault outside buffer extent");
            return Err(Error::BusError {
                page: index,
                page_count,
            });
        }

        let mut resident = self.resident.lock().unwrap();
        if let Some(page) = resident[index] {
            return Ok(page);
        }

        let offset = (index * PAGE_SIZE) as u64;
        let buffer = self.handle.buffer();
        let page = ResidentPage {
            index,
            cpu_addr: buffer.cpu_base().as_ptr() as u64 + offset,
            bus_addr: buffer.bus_base() + offset,
        };
        resident[index] = Some(page);
        tracing::trace!(index, "page resolved");
        Ok(page)
    }
}

impl std::fmt::Debug for FaultMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultMapping")
            .field("pages", &self.page_count())
            .field("resident", &self.resident_pages())
            .finish()
    }
}
