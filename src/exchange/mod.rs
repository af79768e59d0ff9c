//! The buffer-exchange core.
//!
//! This module implements the object model that lets one contiguous
//! allocation be shared, without copies, between any number of consumers:
//!
//! - [`ContigAllocator`]: trait for the platform's contiguous allocator,
//!   with [`MemfdAllocator`] as the host production implementation
//! - [`BusTranslator`]: trait for the platform's address-translation layer
//!   (the IOMMU seam), with [`IdentityTranslator`] for coherent hosts
//! - [`BufferObject`]: owns the allocation, the cached CPU-access mapping,
//!   and the reference-counted release protocol
//! - [`Attachment`] / [`MappedView`]: a consumer's binding to a buffer and
//!   its loan-style bus mapping
//! - [`HandleRegistry`] / [`BufferHandle`]: descriptor issuance and the
//!   public operation surface
//! - [`FaultMapping`]: lazy, fault-driven page residency for process
//!   memory mappings
//!
//! # Example
//!
//! ```rust
//! use dmashare::exchange::{Consumer, HandleRegistry, Direction, PAGE_SIZE};
//!
//! let registry = HandleRegistry::with_host_platform();
//! let owner = Consumer::new("rasterizer");
//!
//! let descriptor = registry.create(&owner, 3 * PAGE_SIZE).unwrap();
//! let handle = registry.get(descriptor).unwrap();
//!
//! // CPU-access bracket against the cached mapping.
//! handle.begin_access(Direction::Bidirectional).unwrap();
//! handle.end_access(Direction::Bidirectional).unwrap();
//!
//! // A second consumer attaches and maps the same pages.
//! let scanout = Consumer::new("scanout");
//! let attachment = handle.attach(&scanout);
//! let view = attachment.map(Direction::ToConsumer).unwrap();
//! assert_eq!(view.ranges().len(), 1);
//! drop(view);
//!
//! registry.close(descriptor).unwrap();
//! ```

mod alloc;
mod attach;
mod buffer;
mod consumer;
mod registry;
mod translate;
mod vmfault;

pub use alloc::{ContigAllocator, ContigRegion, MemfdAllocator, PAGE_SIZE};
pub use attach::{Attachment, MappedView};
pub use buffer::BufferObject;
pub use consumer::Consumer;
pub use registry::{BufferHandle, HandleRegistry};
pub use translate::{BusMapping, BusTranslator, Direction, IdentityTranslator, MappedRange, SgEntry};
pub use vmfault::{FaultMapping, MapRequest, ResidentPage};
