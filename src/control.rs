//! Control-plane dispatcher.
//!
//! A thin request surface over the exchange: fixed-size, by-value request
//! structures come in as raw byte payloads, get decoded, run against the
//! registry, and return platform-style codes: negative on error, the
//! descriptor (or zero) on success. Inspection operations attach a
//! transient consumer, build exactly one mapping, read it, and fully
//! detach again on every path, including errors.

use crate::error::{Error, Result};
use crate::exchange::{Consumer, Direction, HandleRegistry, MappedView};
use std::sync::Arc;

/// Operation code: allocate a buffer ([`AllocRequest`] payload).
pub const OP_ALLOC: u32 = 1;
/// Operation code: query a buffer's bus address ([`BusAddrRequest`] payload).
pub const OP_QUERY_BUS_ADDR: u32 = 2;
/// Operation code: dump a buffer's mapping ranges ([`DumpRequest`] payload).
pub const OP_DUMP: u32 = 3;

/// Allocation request: size in, bus address out.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AllocRequest {
    /// Requested size in bytes; must be a positive page multiple.
    pub size: u32,
    /// Filled with the allocation's bus base address on success.
    pub bus_addr: u64,
}

impl AllocRequest {
    /// Size of the request on the wire (u32 + padding + u64).
    pub const WIRE_SIZE: usize = 16;

    /// Decode from a fixed-size payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        check_payload(payload.len(), Self::WIRE_SIZE)?;
        Ok(Self {
            size: u32::from_ne_bytes(payload[0..4].try_into().unwrap()),
            bus_addr: u64::from_ne_bytes(payload[8..16].try_into().unwrap()),
        })
    }

    /// Encode into a fixed-size payload.
    pub fn encode(&self, payload: &mut [u8]) -> Result<()> {
        check_payload(payload.len(), Self::WIRE_SIZE)?;
        payload[0..4].copy_from_slice(&self.size.to_ne_bytes());
        payload[4..8].fill(0);
        payload[8..16].copy_from_slice(&self.bus_addr.to_ne_bytes());
        Ok(())
    }
}

/// Bus-address query: descriptor in, bus address out.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct BusAddrRequest {
    /// Descriptor of the buffer to inspect.
    pub descriptor: i32,
    /// Filled with the mapping's bus address on success.
    pub bus_addr: u64,
}

impl BusAddrRequest {
    /// Size of the request on the wire (i32 + padding + u64).
    pub const WIRE_SIZE: usize = 16;

    /// Decode from a fixed-size payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        check_payload(payload.len(), Self::WIRE_SIZE)?;
        Ok(Self {
            descriptor: i32::from_ne_bytes(payload[0..4].try_into().unwrap()),
            bus_addr: u64::from_ne_bytes(payload[8..16].try_into().unwrap()),
        })
    }

    /// Encode into a fixed-size payload.
    pub fn encode(&self, payload: &mut [u8]) -> Result<()> {
        check_payload(payload.len(), Self::WIRE_SIZE)?;
        payload[0..4].copy_from_slice(&self.descriptor.to_ne_bytes());
        payload[4..8].fill(0);
        payload[8..16].copy_from_slice(&self.bus_addr.to_ne_bytes());
        Ok(())
    }
}

/// Debug-dump request: descriptor in, no output payload.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DumpRequest {
    /// Descriptor of the buffer to dump.
    pub descriptor: i32,
}

impl DumpRequest {
    /// Size of the request on the wire.
    pub const WIRE_SIZE: usize = 4;

    /// Decode from a fixed-size payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        check_payload(payload.len(), Self::WIRE_SIZE)?;
        Ok(Self {
            descriptor: i32::from_ne_bytes(payload[0..4].try_into().unwrap()),
        })
    }
}

/// Wrong-size payloads are transfer faults, not argument errors: the copy
/// in or out of the caller's buffer is what failed.
fn check_payload(actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(Error::TransferFault { expected, actual });
    }
    Ok(())
}

/// The control-plane request surface over a [`HandleRegistry`].
///
/// Carries the consumer context external requests run under (the control
/// device itself, as far as the exchange is concerned).
pub struct ControlPlane {
    registry: Arc<HandleRegistry>,
    consumer: Consumer,
}

impl ControlPlane {
    /// Create a control plane over `registry`, acting as `consumer`.
    pub fn new(registry: Arc<HandleRegistry>, consumer: Consumer) -> Self {
        Self { registry, consumer }
    }

    /// The registry behind this control plane.
    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Allocate a buffer. Returns the new descriptor (non-negative) and
    /// writes the bus base address into the request, or returns a negative
    /// error code.
    pub fn alloc(&self, request: &mut AllocRequest) -> i32 {
        match self.try_alloc(request) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::debug!(error = %e, "alloc failed");
                e.code()
            }
        }
    }

    fn try_alloc(&self, request: &mut AllocRequest) -> Result<i32> {
        let descriptor = self
            .registry
            .create(&self.consumer, request.size as usize)?;
        // The descriptor was just created, so the lookup cannot fail.
        let handle = self.registry.get(descriptor)?;
        request.bus_addr = handle.bus_base();
        Ok(descriptor)
    }

    /// Query the bus address a consumer would reach the buffer at.
    ///
    /// Attaches transiently, builds exactly one mapping, and detaches
    /// again. A multi-range result is rejected as `InvalidArgument`: the
    /// caller asked for *the* address of a contiguous buffer.
    /// Returns zero on success, a negative code otherwise.
    pub fn query_bus_addr(&self, request: &mut BusAddrRequest) -> i32 {
        let result = self.with_mapping(request.descriptor, |view| {
            match view.ranges() {
                [range] => Ok(range.bus_addr),
                ranges => Err(Error::InvalidArgument(format!(
                    "expected one mapped range, got {}",
                    ranges.len()
                ))),
            }
        });
        match result {
            Ok(bus_addr) => {
                request.bus_addr = bus_addr;
                0
            }
            Err(e) => {
                tracing::debug!(descriptor = request.descriptor, error = %e, "query failed");
                e.code()
            }
        }
    }

    /// Log every mapped range of the buffer behind `descriptor`.
    ///
    /// Attaches transiently and detaches on every path. Returns zero on
    /// success, a negative code otherwise.
    pub fn debug_dump(&self, descriptor: i32) -> i32 {
        let result = self.with_mapping(descriptor, |view| {
            tracing::info!(descriptor, ranges = view.ranges().len(), "mapping dump");
            for (i, range) in view.ranges().iter().enumerate() {
                tracing::info!(
                    descriptor,
                    range = i,
                    bus_addr = format_args!("{:#010x}", range.bus_addr),
                    len_kib = range.len >> 10,
                    "range"
                );
            }
            Ok(())
        });
        match result {
            Ok(()) => 0,
            Err(e) => {
                tracing::debug!(descriptor, error = %e, "dump failed");
                e.code()
            }
        }
    }

    /// Raw byte entry point: decode the fixed-size request for `op`, run
    /// it, and copy results back out. Unknown operations and wrong-size
    /// payloads return negative codes (`-22` and `-14` respectively).
    pub fn dispatch(&self, op: u32, payload: &mut [u8]) -> i32 {
        match op {
            OP_ALLOC => {
                let mut request = match AllocRequest::decode(payload) {
                    Ok(r) => r,
                    Err(e) => return e.code(),
                };
                let code = self.alloc(&mut request);
                if code < 0 {
                    return code;
                }
                match request.encode(payload) {
                    Ok(()) => code,
                    Err(e) => e.code(),
                }
            }
            OP_QUERY_BUS_ADDR => {
                let mut request = match BusAddrRequest::decode(payload) {
                    Ok(r) => r,
                    Err(e) => return e.code(),
                };
                let code = self.query_bus_addr(&mut request);
                if code < 0 {
                    return code;
                }
                match request.encode(payload) {
                    Ok(()) => code,
                    Err(e) => e.code(),
                }
            }
            OP_DUMP => match DumpRequest::decode(payload) {
                Ok(request) => self.debug_dump(request.descriptor),
                Err(e) => e.code(),
            },
            unknown => {
                tracing::debug!(op = unknown, "unknown control operation");
                Error::InvalidArgument(format!("unknown operation {unknown}")).code()
            }
        }
    }

    /// Attach transiently, map once, run `f`, then unmap and detach in
    /// reverse order, on error paths too, which is what the RAII guards
    /// guarantee.
    fn with_mapping<T>(
        &self,
        descriptor: i32,
        f: impl FnOnce(&MappedView<'_>) -> Result<T>,
    ) -> Result<T> {
        let handle = self.registry.get(descriptor)?;
        let attachment = handle.attach(&self.consumer);
        let view = attachment.map(Direction::ToConsumer)?;
        let out = f(&view);
        view.unmap();
        attachment.detach();
        out
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("consumer", &self.consumer)
            .field("registry", &self.registry)
            .finish()
    }
}
