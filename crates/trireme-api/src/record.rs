// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Telemetry emitted by the datapath and the verdict handed back to
//! the intercept subsystem.

use super::Direction;
use super::FlowId;
use super::FlowPolicy;
use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The endpoint ID reported when the peer is not known.
pub const DEFAULT_ENDPOINT: &str = "default";

/// The verdict returned to the intercept subsystem.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Verdict {
    Drop = 0,
    Accept = 1,
}

impl Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub enum FlowAction {
    Accept,
    Reject,
}

impl Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
        };
        write!(f, "{s}")
    }
}

/// Why a flow was rejected.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum RejectReason {
    /// The token failed signature, expiry or nonce verification.
    InvalidToken,
    /// A handshake packet carried no token.
    MissingToken,
    /// The token or its carrier (TCP option, UDP marker) was malformed.
    InvalidFormat,
    /// The claims matched a reject rule or no accept rule.
    PolicyDrop,
    /// The claims carried no usable remote context.
    InvalidContext,
    /// The packet is inconsistent with the connection state.
    InvalidState,
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::InvalidToken => "InvalidToken",
            Self::MissingToken => "MissingToken",
            Self::InvalidFormat => "InvalidFormat",
            Self::PolicyDrop => "PolicyDrop",
            Self::InvalidContext => "InvalidContext",
            Self::InvalidState => "InvalidState",
        };
        write!(f, "{s}")
    }
}

/// An accepted or rejected flow.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowRecord {
    pub flow: FlowId,
    /// The PU (or remote context) that initiated the flow.
    pub source_id: String,
    /// The PU (or remote context) the flow was headed to.
    pub destination_id: String,
    /// The local PU that made the decision.
    pub context_id: String,
    pub action: FlowAction,
    pub reason: Option<RejectReason>,
    /// The decision that was enforced.
    pub policy: Option<FlowPolicy>,
    /// The decision that was observed, when it differs from the
    /// enforced one (shadow policy).
    pub observed: Option<FlowPolicy>,
    /// How many identical records this one stands for.
    pub count: u64,
}

impl Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} -> {} ctx={}",
            self.action,
            self.flow,
            self.source_id,
            self.destination_id,
            self.context_id
        )?;

        if let Some(reason) = self.reason {
            write!(f, " reason={reason}")?;
        }

        if let Some(policy) = &self.policy {
            write!(f, " policy={}", policy.policy_id)?;
        }

        Ok(())
    }
}

/// The stage of processing a traced packet reached.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PacketStage {
    Incoming,
    Auth,
    Service,
    Outgoing,
}

impl Display for PacketStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Incoming => "incoming",
            Self::Auth => "auth",
            Self::Service => "service",
            Self::Outgoing => "outgoing",
        };
        write!(f, "{s}")
    }
}

/// A raw packet trace event, emitted when packet tracing is on.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PacketReport {
    pub dir: Direction,
    pub flow: FlowId,
    /// TCP flags in `UAPRSF` form; empty for UDP.
    pub tcp_flags: String,
    pub mark: u32,
    pub length: usize,
    pub stage: PacketStage,
    pub dropped: bool,
    pub error: Option<String>,
}
