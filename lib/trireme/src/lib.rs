// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The Trireme authenticated datapath.
//!
//! Every TCP and UDP packet entering or leaving a processing unit
//! (PU) is handed to the [`engine::datapath::Datapath`]. Connections
//! are authenticated in band: a signed token carrying the identity
//! claims of the sender rides on the handshake packets, the receiver
//! matches those claims against its policy, and the verdict decides
//! whether the flow may proceed.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]
// Enable features needed for USDT, if needed.
#![cfg_attr(all(feature = "usdt", not(usdt_stable_asm)), feature(asm))]
#![cfg_attr(
    all(feature = "usdt", target_os = "macos", not(usdt_stable_asm_sym)),
    feature(asm_sym)
)]

extern crate alloc;

#[macro_use]
extern crate cfg_if;

// This is needed so that the stat-macro (`#[derive(StatProvider)]`)
// can use fully-qualified type paths.
extern crate self as trireme;

pub use trireme_api as api;

pub mod config;
pub mod engine;
pub mod provider;
pub mod stat;
pub mod sync;
pub mod time;

/// Return value with `bit` set.
pub const fn bit_on(bit: u8) -> u8 {
    0x1 << bit
}

// ================================================================
// DTrace USDT Provider
//
// Allowing us to trace handshake progress and connection expiry
// when the `usdt` feature is on.
// ================================================================
#[cfg(feature = "usdt")]
#[usdt::provider]
mod trireme_provider {
    use trireme_api::Direction;

    fn tcp__flow__state(dir: Direction, flow: &str, prev: &str, next: &str) {}
    fn udp__flow__state(dir: Direction, flow: &str, prev: &str, next: &str) {}
    fn conn__expired(tracker: &str, flow: &str, state: &str) {}
    fn handshake__reject(dir: Direction, flow: &str, reason: &str) {}
}
