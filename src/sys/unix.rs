// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The POSIX-like backend: pthread cancellation pinning, native barriers.

use super::Backend;

pub struct Posix;

impl Backend for Posix {
    type CancelState = libc::c_int;

    fn disable_cancellation() -> libc::c_int {
        let mut prev: libc::c_int = 0;
        // SAFETY: `prev` is a valid out-pointer for the duration of the call.
        let rc = unsafe { libc::pthread_setcancelstate(libc::PTHREAD_CANCEL_DISABLE, &mut prev) };
        debug_assert_eq!(rc, 0, "pthread_setcancelstate(DISABLE) failed");
        prev
    }

    fn restore_cancellation(state: libc::c_int) {
        let mut prev: libc::c_int = 0;
        // SAFETY: `prev` is a valid out-pointer for the duration of the call.
        let rc = unsafe { libc::pthread_setcancelstate(state, &mut prev) };
        debug_assert_eq!(rc, 0, "pthread_setcancelstate(restore) failed");
    }

    const HAS_NATIVE_BARRIER: bool = true;
    const HAS_POSITIONAL_IO: bool = true;
}
