// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Primitive sync wrappers (spec §2 item 1).
//!
//! Two of the five leaf primitives the spec lists — the condition variable
//! and the atomic counters — are already backend-portable in `std`
//! (`std::sync::Condvar`, `core::sync::atomic::*`), so the higher-level
//! locks in this crate use them directly rather than through a bespoke
//! wrapper. The remaining two, the plain mutex and the barrier, get their
//! own thin wrappers here because the higher-level code needs a contract
//! `std::sync::Mutex` doesn't offer (manual acquire/release for the former,
//! a native-vs-emulated choice for the latter). The thread-local key leaf
//! primitive is `std`'s own `thread_local!` macro, used directly in
//! [`crate::threadinfo`] and [`crate::rwlock`].

pub mod barrier;
pub mod mutex;
