//! Consumer identity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for generating unique consumer IDs.
static CONSUMER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of a buffer consumer (a hardware endpoint or another subsystem).
///
/// A `Consumer` is the context a buffer is allocated against and the target
/// of address translations. It is cheap to clone and compares by its unique
/// ID, so two consumers created with the same name are still distinct.
#[derive(Clone, Debug)]
pub struct Consumer {
    id: u64,
    name: Arc<str>,
}

impl Consumer {
    /// Create a consumer with a human-readable name.
    pub fn new(name: &str) -> Self {
        Self {
            id: CONSUMER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name),
        }
    }

    /// Unique ID of this consumer.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable name, for logs and diagnostics.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Consumer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Consumer {}

impl std::fmt::Display for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}
