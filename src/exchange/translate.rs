//! Address translation for consumer-visible mappings.
//!
//! Translating a buffer's pages into a consumer's bus address space is the
//! platform's job (IOMMU, SMMU, or nothing at all); the exchange only needs
//! a narrow seam for it. [`BusTranslator`] is that seam. The scatter input
//! is built by the exchange (for a contiguous buffer, always one entry
//! spanning the whole allocation); the output is the consumer-visible range
//! list plus cache synchronization hooks for CPU-access brackets.

use crate::error::Result;
use crate::exchange::Consumer;

/// Access intent for a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The consumer reads the buffer (CPU produces, device consumes).
    ToConsumer,
    /// The consumer writes the buffer (device produces, CPU consumes).
    FromConsumer,
    /// Both sides read and write.
    Bidirectional,
}

/// One scatter entry on the CPU/physical side of a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// CPU-side address of the chunk.
    pub addr: u64,
    /// Length of the chunk in bytes.
    pub len: usize,
}

/// One consumer-visible address range produced by translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    /// Bus address the consumer reaches the chunk at.
    pub bus_addr: u64,
    /// Length of the chunk in bytes.
    pub len: usize,
}

/// A translated mapping: how a buffer's pages are visible to one consumer.
///
/// Owned by exactly one of the buffer object (cached across CPU-access
/// brackets) or a single attachment view; never shared between two owners.
/// For a contiguous buffer, `ranges` always holds exactly one entry.
#[derive(Debug, Clone)]
pub struct BusMapping {
    direction: Direction,
    ranges: Vec<MappedRange>,
}

impl BusMapping {
    pub(crate) fn new(direction: Direction, ranges: Vec<MappedRange>) -> Self {
        Self { direction, ranges }
    }

    /// The direction this mapping was established for.
    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The consumer-visible ranges, in order.
    #[inline]
    pub fn ranges(&self) -> &[MappedRange] {
        &self.ranges
    }

    /// Total mapped length in bytes.
    pub fn len(&self) -> usize {
        self.ranges.iter().map(|r| r.len).sum()
    }

    /// Returns true if the mapping covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Platform seam for bus address translation and cache synchronization.
///
/// Implementations must not leave partial state behind on failure: a
/// rejected [`map_ranges`](Self::map_ranges) call performs no translation
/// at all.
pub trait BusTranslator: Send + Sync {
    /// Translate CPU-side ranges into `consumer`'s bus address space.
    ///
    /// Fails with [`crate::Error::TranslationFailed`] if the platform
    /// rejects the request.
    fn map_ranges(
        &self,
        consumer: &Consumer,
        direction: Direction,
        ranges: &[SgEntry],
    ) -> Result<Vec<MappedRange>>;

    /// Reverse a translation previously produced by
    /// [`map_ranges`](Self::map_ranges).
    fn unmap_ranges(&self, consumer: &Consumer, direction: Direction, ranges: &[MappedRange]);

    /// Synchronize caches so the CPU observes the consumer's writes.
    fn sync_for_cpu(&self, consumer: &Consumer, direction: Direction, ranges: &[MappedRange]);

    /// Synchronize caches so the consumer observes the CPU's writes.
    fn sync_for_device(&self, consumer: &Consumer, direction: Direction, ranges: &[MappedRange]);
}

/// Identity translator for cache-coherent hosts.
///
/// Bus addresses equal CPU addresses and cache synchronization is a no-op;
/// only tracing remains, which keeps CPU-access brackets observable in
/// logs. A platform with a real IOMMU substitutes its own translator.
#[derive(Debug, Default)]
pub struct IdentityTranslator;

impl IdentityTranslator {
    /// Create an identity translator.
    pub fn new() -> Self {
        Self
    }
}

impl BusTranslator for IdentityTranslator {
    fn map_ranges(
        &self,
        consumer: &Consumer,
        direction: Direction,
        ranges: &[SgEntry],
    ) -> Result<Vec<MappedRange>> {
        tracing::debug!(consumer = %consumer, ?direction, count = ranges.len(), "mapping ranges");
        Ok(ranges
            .iter()
            .map(|sg| MappedRange {
                bus_addr: sg.addr,
                len: sg.len,
            })
            .collect())
    }

    fn unmap_ranges(&self, consumer: &Consumer, direction: Direction, ranges: &[MappedRange]) {
        tracing::debug!(consumer = %consumer, ?direction, count = ranges.len(), "unmapping ranges");
    }

    fn sync_for_cpu(&self, consumer: &Consumer, direction: Direction, ranges: &[MappedRange]) {
        tracing::trace!(consumer = %consumer, ?direction, count = ranges.len(), "sync for cpu");
    }

    fn sync_for_device(&self, consumer: &Consumer, direction: Direction, ranges: &[MappedRange]) {
        tracing::trace!(consumer = %consumer, ?direction, count = ranges.len(), "sync for device");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_translation_preserves_addresses() {
        let translator = IdentityTranslator::new();
        let consumer = Consumer::new("test");

        let sg = [SgEntry { addr: 0x1000, len: 8192 }];
        let ranges = translator
            .map_ranges(&consumer, Direction::ToConsumer, &sg)
            .unwrap();

        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].bus_addr, 0x1000);
        assert_eq!(ranges[0].len, 8192);
    }

    #[test]
    fn mapping_reports_total_length() {
        let mapping = BusMapping::new(
            Direction::Bidirectional,
            vec![
                MappedRange { bus_addr: 0x1000, len: 4096 },
                MappedRange { bus_addr: 0x8000, len: 8192 },
            ],
        );
        assert_eq!(mapping.len(), 12288);
        assert!(!mapping.is_empty());
        assert_eq!(mapping.direction(), Direction::Bidirectional);
    }
}
