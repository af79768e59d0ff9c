//! Error types for dmashare.

use thiserror::Error;

/// Result type alias using dmashare's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for buffer-exchange operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A size, alignment, or request parameter was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The platform allocator has no contiguous region of the requested size.
    #[error("out of contiguous memory: {requested} bytes")]
    OutOfMemory {
        /// Size of the allocation that could not be satisfied.
        requested: usize,
    },

    /// The address-translation layer rejected a mapping request.
    #[error("bus translation failed: {0}")]
    TranslationFailed(String),

    /// `end_access` was called on a buffer that was never mapped for CPU access.
    #[error("no active CPU mapping")]
    NoActiveMapping,

    /// A page fault landed beyond the buffer's extent.
    #[error("bus error: page {page} outside buffer of {page_count} pages")]
    BusError {
        /// The faulting page index.
        page: usize,
        /// Number of pages in the buffer.
        page_count: usize,
    },

    /// Copy-in/copy-out of a control-plane payload failed.
    #[error("payload transfer fault: expected {expected} bytes, got {actual}")]
    TransferFault {
        /// Size the request structure requires.
        expected: usize,
        /// Size the caller supplied.
        actual: usize,
    },

    /// The descriptor does not name a live buffer handle.
    #[error("bad descriptor: {0}")]
    BadDescriptor(i32),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Negative platform-style error code, for control-plane callers.
    ///
    /// Zero and positive values are reserved for success (descriptors);
    /// every error maps to a negative errno-flavored code.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -22,
            Error::OutOfMemory { .. } => -12,
            Error::TranslationFailed(_) => -5,
            Error::NoActiveMapping => -22,
            Error::BusError { .. } => -14,
            Error::TransferFault { .. } => -14,
            Error::BadDescriptor(_) => -9,
            Error::System(errno) => -errno.raw_os_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative() {
        let errors = [
            Error::InvalidArgument("x".into()),
            Error::OutOfMemory { requested: 4096 },
            Error::TranslationFailed("x".into()),
            Error::NoActiveMapping,
            Error::BusError { page: 3, page_count: 3 },
            Error::TransferFault { expected: 16, actual: 4 },
            Error::BadDescriptor(7),
        ];
        for e in errors {
            assert!(e.code() < 0, "{e} must map to a negative code");
        }
    }

    #[test]
    fn display_mentions_detail() {
        let e = Error::BusError { page: 5, page_count: 3 };
        assert!(e.to_string().contains("page 5"));
    }
}
