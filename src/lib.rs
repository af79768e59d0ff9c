//! # dmashare
//!
//! Reference-counted contiguous buffer exchange with zero-copy consumer
//! mappings.
//!
//! One contiguous, page-aligned allocation is exported as a shareable
//! buffer object that any number of independent consumers (hardware
//! endpoints, other subsystems, processes) can attach to, map into their
//! own bus address space, and synchronize with CPU-side access, without
//! ever copying the memory. The allocation, the exported handle, each
//! attachment, and any fault-driven process mapping all feed a single
//! explicit reference count: the buffer is torn down exactly when the last
//! of them lets go.
//!
//! ## Architecture
//!
//! - [`exchange`]: the core object model: allocator and translator seams,
//!   the buffer object with its release protocol and CPU-access brackets,
//!   attachments with loan-style mappings, the descriptor registry, and
//!   the fault-driven mapper
//! - [`control`]: a thin dispatcher translating fixed-size request
//!   structures into exchange calls, returning platform-style codes
//!
//! ## Quick Start
//!
//! ```rust
//! use dmashare::prelude::*;
//!
//! let registry = HandleRegistry::with_host_platform();
//! let owner = Consumer::new("capture");
//!
//! // Export a 3-page buffer and share it with a consumer.
//! let descriptor = registry.create(&owner, 3 * PAGE_SIZE)?;
//! let handle = registry.get(descriptor)?;
//!
//! let display = Consumer::new("display");
//! let attachment = handle.attach(&display);
//! let view = attachment.map(Direction::ToConsumer)?;
//! assert_eq!(view.ranges().len(), 1);
//!
//! drop(view);
//! drop(attachment);
//! registry.close(descriptor)?;
//! # Ok::<(), dmashare::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod control;
pub mod error;
pub mod exchange;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::control::{AllocRequest, BusAddrRequest, ControlPlane, DumpRequest};
    pub use crate::error::{Error, Result};
    pub use crate::exchange::{
        Attachment, BufferHandle, BufferObject, BusTranslator, Consumer, ContigAllocator,
        Direction, FaultMapping, HandleRegistry, MapRequest, MappedView, PAGE_SIZE,
    };
}

pub use error::{Error, Result};
