// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Backend capability layer (Design Note: "Dynamic dispatch over backend").
//!
//! The rest of the crate is written against the [`Backend`] trait and the
//! [`CurrentBackend`] type alias, never against `libc` or platform APIs
//! directly. Exactly one implementation is compiled in, selected by `cfg` at
//! build time; both implementations honor the same contract.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::Posix as CurrentBackend;

#[cfg(not(unix))]
mod other;
#[cfg(not(unix))]
pub use other::Generic as CurrentBackend;

/// Capability surface the rest of the crate needs from the host threading
/// model. A backend need not expose anything beyond what's listed here —
/// everything else (mutexes, condvars, TLS) comes from `std::sync` and
/// `std::thread_local!`, which are already portable.
pub trait Backend {
    /// Opaque save-point for whatever cancellability state `disable_cancellation`
    /// captured. Must be passed back to `restore_cancellation` unchanged.
    type CancelState: Copy;

    /// Disables cancellation of the calling thread, if the backend has such
    /// a concept (pthread-style backends do; others are a no-op). Called
    /// once, on the first successful recursive acquire of an
    /// [`crate::exlock::ExLock`].
    fn disable_cancellation() -> Self::CancelState;

    /// Restores whatever cancellability state `disable_cancellation`
    /// captured. Called once, on the final release of an `ExLock`.
    fn restore_cancellation(state: Self::CancelState);

    /// Whether this backend has a native thread-barrier primitive available
    /// (spec §4.5: "native if available, else mutex+condvar emulation").
    const HAS_NATIVE_BARRIER: bool;

    /// Whether this backend exposes positional I/O (`pread`/`pwrite`), so
    /// the file shim (spec §4.8) never needs to track a seek cursor.
    const HAS_POSITIONAL_IO: bool;
}
