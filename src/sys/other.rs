// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The native-Windows-style backend. `SRWLOCK`/`CONDITION_VARIABLE`-based
//! primitives have no cancellability concept, so this backend's pinning
//! hooks are no-ops; `std::sync::Barrier` stands in for a native barrier.

use super::Backend;

pub struct Generic;

impl Backend for Generic {
    type CancelState = ();

    fn disable_cancellation() {}

    fn restore_cancellation(_state: ()) {}

    const HAS_NATIVE_BARRIER: bool = true;

    /// The generic backend models a target without `pread`/`pwrite`, so the
    /// file shim exercises its seek-elision tracking path (spec testable
    /// scenario S6) instead.
    const HAS_POSITIONAL_IO: bool = false;
}
