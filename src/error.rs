// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error taxonomy for the concurrency and memory-management core.
//!
//! Every fallible entry point in this crate returns [`Result`]. There is no
//! silent error swallowing: a short positional I/O read is retried
//! internally, `EINTR` is retried internally, and an allocation failure is
//! retried once after a garbage-collection pass — but once those recovery
//! paths are exhausted the caller always sees a [`CoreError`].

use core::fmt;

use crate::threadinfo::ThreadId;

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, CoreError>;

/// Kind-level error taxonomy (spec §7).
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// An OS synchronization primitive (mutex, condvar, TLS key, barrier)
    /// could not be created.
    #[error("failed to initialize OS primitive: {0}")]
    InitFailure(&'static str),

    /// `acquire`/`lock` returned an OS error.
    #[error("failed to acquire lock: {0}")]
    LockFailure(&'static str),

    /// `release`/`unlock` returned an OS error, or was called without
    /// holding the lock.
    #[error("failed to release lock: {0}")]
    UnlockFailure(&'static str),

    /// A memory request failed even after one garbage-collection retry.
    #[error("allocation of {requested} bytes failed after garbage collection")]
    AllocFailure { requested: usize },

    /// A garbage-collection pass could not complete, because a nested lock
    /// acquisition failed.
    #[error("garbage collection pass failed: {source}")]
    GcFailure {
        #[source]
        source: Box<CoreError>,
    },

    /// An address or size exceeds the addressable range (the signed 63-bit
    /// range of the offset type), or a computed sum would wrap.
    #[error("address or size {value} exceeds the addressable range")]
    Overflow { value: u64 },

    /// A read/write/truncate/seek syscall failed, or returned an unexpected
    /// byte count after all retries were exhausted.
    #[error("I/O operation failed: {0}")]
    IoError(#[from] std::io::Error),

    /// Advisory file locks are unavailable on this platform or filesystem.
    /// Suppressed (turned into `Ok(())`) when the per-file "ignore disabled
    /// locks" flag is set; see [`crate::file::posix::PosixFile::lock`].
    #[error("advisory file locks are not supported here")]
    LockUnsupported,

    /// An invariant the caller is responsible for upholding (e.g. freeing a
    /// block through the wrong free-list class) was violated. These are
    /// `debug_assert!`-checked in development builds; in release builds the
    /// caller gets this error back instead of undefined behavior.
    #[error("programmer error: {0}")]
    ProgrammerError(&'static str),
}

impl CoreError {
    /// The thread on which this error is being recorded, for inclusion in a
    /// [`crate::threadinfo::ErrorStack`]. `None` when the error was
    /// constructed before a `ThreadInfo` existed (startup).
    pub fn annotate(self, thread: Option<ThreadId>) -> AnnotatedError {
        AnnotatedError { thread, error: self }
    }
}

/// A [`CoreError`] tagged with the thread it occurred on, as pushed onto a
/// per-thread [`crate::threadinfo::ErrorStack`].
#[derive(Debug)]
pub struct AnnotatedError {
    pub thread: Option<ThreadId>,
    pub error: CoreError,
}

impl fmt::Display for AnnotatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.thread {
            Some(tid) => write!(f, "[thread {}] {}", tid, self.error),
            None => write!(f, "{}", self.error),
        }
    }
}
