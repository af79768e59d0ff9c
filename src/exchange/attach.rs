//! Consumer attachments and their bus mappings.
//!
//! An [`Attachment`] is one consumer's binding to a buffer. It holds its
//! own reference, so the buffer outlives the handle that created it for as
//! long as the attachment exists. Mappings obtained through an attachment
//! are loans: a [`MappedView`] borrows the attachment and reverses the
//! translation when it goes away, so an attachment can never be detached
//! with a mapping still outstanding, and a mapping can never be unmapped
//! twice.

use crate::error::Result;
use crate::exchange::{BufferObject, BusMapping, Consumer, Direction, MappedRange};
use std::sync::Arc;

/// A consumer's binding to a [`BufferObject`].
///
/// Created by [`BufferHandle::attach`](crate::exchange::BufferHandle::attach);
/// destroyed by dropping (or the explicit [`detach`](Attachment::detach)).
/// Holds one buffer reference for its whole lifetime, independent of the
/// originating handle.
pub struct Attachment {
    consumer: Consumer,
    buffer: Arc<BufferObject>,
}

impl Attachment {
    pub(crate) fn new(buffer: Arc<BufferObject>, consumer: &Consumer) -> Self {
        buffer.retain();
        tracing::debug!(consumer = %consumer, buffer = ?buffer, "attached");
        Self {
            consumer: consumer.clone(),
            buffer,
        }
    }

    /// The consumer this attachment belongs to.
    #[inline]
    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// The attached buffer.
    #[inline]
    pub fn buffer(&self) -> &BufferObject {
        &self.buffer
    }

    /// Map the whole buffer into this consumer's bus address space.
    ///
    /// Builds the single-range scatter description covering the allocation
    /// and asks the platform translator to translate it for this consumer
    /// in `direction`. On [`crate::Error::TranslationFailed`] no state
    /// changes. The view borrows the attachment, so the attachment cannot
    /// be detached while the mapping is live.
    pub fn map(&self, direction: Direction) -> Result<MappedView<'_>> {
        let mapping = self.buffer.translate_for(&self.consumer, direction)?;
        Ok(MappedView {
            attachment: self,
            mapping: Some(mapping),
        })
    }

    /// Detach from the buffer, dropping the attachment's reference.
    ///
    /// Equivalent to dropping. If this was the last reference, the buffer
    /// is released.
    pub fn detach(self) {}
}

impl Drop for Attachment {
    fn drop(&mut self) {
        tracing::debug!(consumer = %self.consumer, "detached");
        self.buffer.release_ref();
    }
}

/// A live bus mapping obtained through an [`Attachment`].
///
/// The translation is reversed when the view is dropped or explicitly
/// [`unmap`](MappedView::unmap)ped. Unmapping consumes the view, so a
/// second unmap of the same mapping does not compile.
pub struct MappedView<'at> {
    attachment: &'at Attachment,
    mapping: Option<BusMapping>,
}

impl MappedView<'_> {
    fn inner(&self) -> &BusMapping {
        // Only `Drop` takes the mapping, and the view is gone afterwards.
        self.mapping.as_ref().unwrap()
    }

    /// The direction this mapping was established for.
    #[inline]
    pub fn direction(&self) -> Direction {
        self.inner().direction()
    }

    /// The consumer-visible ranges, in order.
    ///
    /// For a contiguous buffer this is always exactly one range spanning
    /// the whole allocation.
    #[inline]
    pub fn ranges(&self) -> &[MappedRange] {
        self.inner().ranges()
    }

    /// Total mapped length in bytes.
    pub fn len(&self) -> usize {
        self.inner().len()
    }

    /// Returns true if the mapping covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.inner().is_empty()
    }

    /// Reverse the translation.
    ///
    /// Equivalent to dropping the view; the explicit form exists for call
    /// sites that want the unmap visible in the control flow.
    pub fn unmap(self) {}
}

impl Drop for MappedView<'_> {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            self.attachment
                .buffer
                .untranslate_for(&self.attachment.consumer, &mapping);
        }
    }
}
