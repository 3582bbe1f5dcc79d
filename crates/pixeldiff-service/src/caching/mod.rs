//! A generic read-through cache with single-flight computations.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

mod read_through;

pub use read_through::{ReadThroughCache, WorkerFn};

/// Priority class for work that should run as soon as a worker is free,
/// ahead of any queued background work.
pub const PRIORITY_NOW: i64 = 0;

/// Priority class for background warming work.
pub const PRIORITY_BACKGROUND: i64 = 100;

static SUBMISSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Priority of one job on a [`ReadThroughCache`] worker pool.
///
/// Combines a caller-supplied priority class with a process-wide submission
/// sequence number: lower classes run first, and jobs within the same class
/// run in submission order. The sequence number is assigned when the
/// [`Priority`] is created, so create it at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority {
    class: i64,
    submitted: u64,
}

impl Priority {
    pub fn new(class: i64) -> Self {
        Self {
            class,
            submitted: SUBMISSION_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The caller-supplied priority class.
    pub fn class(&self) -> i64 {
        self.class
    }
}

/// Shorthand for a result carrying a [`CacheError`].
pub type CacheContents<T> = Result<T, CacheError>;

/// An error produced while computing a cache value.
///
/// The error is `Clone` because a single failed computation is handed to
/// every caller that joined it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The requested item does not exist, locally or remotely.
    #[error("not found")]
    NotFound,
    /// The given id is not in a format the mapper accepts.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// The item could not be fetched from remote storage.
    ///
    /// The attached string contains the remote source's response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The item was fetched, but its contents are unusable, for example a
    /// byte stream that does not decode as an image.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in the service itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound;
        }
        let location = std::panic::Location::caller();
        tracing::error!(
            error = &err as &dyn std::error::Error,
            "io error at {location}",
        );
        Self::InternalError
    }
}
