// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The datapath engine.
//!
//! Bottom up: header access and checksums ([`ip4`], [`tcp`], [`udp`],
//! [`checksum`]), the owned [`packet::Packet`] and its token surgery,
//! identity and policy ([`tags`], [`policy`], [`pucontext`]), signing
//! and tokens ([`secrets`], [`token`]), per-flow state ([`connection`],
//! [`tracker`]) and finally the [`datapath::Datapath`] tying it all
//! together behind the [`intercept`] queues.

pub mod checksum;
pub mod collector;
pub mod connection;
pub mod datapath;
pub mod intercept;
pub mod ip4;
pub mod packet;
pub mod policy;
pub mod processor;
pub mod pucontext;
pub mod secrets;
pub mod tags;
pub mod tcp;
pub mod token;
pub mod tracker;
pub mod udp;
pub mod writer;
