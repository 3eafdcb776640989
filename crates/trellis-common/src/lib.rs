// Shared data types and small helpers used across crates.
use serde::{Deserialize, Serialize};

pub mod path;

pub use path::ParsedPath;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

pub mod ids {
    // Per-connection counters; never shared process-wide so several brokers can
    // coexist in one test binary.
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Issues request ids (`rid`) and subscription ids (`sid`).
    ///
    /// Both sequences start at 1; 0 is reserved for the subscription update
    /// channel on the wire.
    ///
    /// ```
    /// use trellis_common::ids::IdAllocator;
    ///
    /// let ids = IdAllocator::new();
    /// assert_eq!(ids.next_rid(), 1);
    /// assert_eq!(ids.next_rid(), 2);
    /// assert_eq!(ids.next_sid(), 1);
    /// ```
    #[derive(Debug)]
    pub struct IdAllocator {
        next_rid: AtomicU64,
        next_sid: AtomicU64,
    }

    impl IdAllocator {
        pub fn new() -> Self {
            Self {
                next_rid: AtomicU64::new(1),
                next_sid: AtomicU64::new(1),
            }
        }

        pub fn next_rid(&self) -> u64 {
            self.next_rid.fetch_add(1, Ordering::Relaxed)
        }

        pub fn next_sid(&self) -> u64 {
            self.next_sid.fetch_add(1, Ordering::Relaxed)
        }
    }

    impl Default for IdAllocator {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_frame_bytes: usize,
    pub max_missing_acks: u64,
    pub max_pending_envelopes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        // Defaults are conservative for local/dev usage.
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            max_missing_acks: 8,
            max_pending_envelopes: 4096,
        }
    }
}
