// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Per-flow connection state.
//!
//! A connection carries its own lock. Trackers hand out `Arc`s to it
//! and a packet handler holds the lock for the whole time it works on
//! the flow, so a retransmission delivered to another worker waits
//! rather than interleaving.
//!
//! The handshake state machines are pure functions from (state,
//! event) to an [`TcpAction`] or [`UdpAction`]; every pair has an
//! explicit answer.

use super::token::ConnectionClaims;
use super::token::EPHEMERAL_KEY_LEN;
use super::token::NONCE_LEN;
use super::token::Nonce;
use super::tracker::Tracked;
use crate::api::FlowId;
use crate::api::FlowPolicy;
use crate::api::RejectReason;
use crate::sync::KMutex;
use crate::sync::KMutexGuard;
use crate::time::Moment;
use alloc::collections::VecDeque;
use core::fmt;
use core::fmt::Display;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use core::time::Duration;

/// The handshake state of one side of a connection.
#[derive(Clone, Debug, Default)]
pub struct AuthInfo {
    pub local_nonce: Nonce,
    pub remote_nonce: Option<Nonce>,
    /// The PU ID the peer claimed.
    pub remote_context_id: Option<String>,
    pub remote_public_key: Vec<u8>,
    pub local_ephemeral_key: Option<[u8; EPHEMERAL_KEY_LEN]>,
    pub remote_ephemeral_key: Option<Vec<u8>>,
    pub claims: Option<ConnectionClaims>,
}

impl AuthInfo {
    pub fn new() -> Self {
        Self { local_nonce: rand::random::<[u8; NONCE_LEN]>(), ..Default::default() }
    }
}

/// Why an established connection was reaped, for counting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExpiredIn {
    Handshake,
    Established,
}

// ================================================================
// TCP
// ================================================================

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TcpState {
    /// Nothing seen yet, or reaped.
    #[default]
    Unknown,
    SynSend,
    SynReceived,
    SynAckSend,
    SynAckReceived,
    AckSend,
    AckProcessed,
    Data,
}

impl TcpState {
    pub fn is_established(&self) -> bool {
        matches!(self, Self::AckProcessed | Self::Data)
    }
}

impl Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::SynSend => "SYN_SEND",
            Self::SynReceived => "SYN_RECEIVED",
            Self::SynAckSend => "SYN_ACK_SEND",
            Self::SynAckReceived => "SYN_ACK_RECEIVED",
            Self::AckSend => "ACK_SEND",
            Self::AckProcessed => "ACK_PROCESSED",
            Self::Data => "DATA",
        };
        write!(f, "{s}")
    }
}

/// A handshake-relevant TCP packet, by origin.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TcpEvent {
    AppSyn,
    AppSynAck,
    AppAck,
    NetSyn,
    NetSynAck,
    NetAck,
    /// Any other flag combination.
    Other,
}

impl TcpEvent {
    pub const ALL: [TcpEvent; 7] = [
        Self::AppSyn,
        Self::AppSynAck,
        Self::AppAck,
        Self::NetSyn,
        Self::NetSynAck,
        Self::NetAck,
        Self::Other,
    ];
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TcpAction {
    /// Attach a SYN token; next state `SynSend`.
    AttachSyn,
    /// Attach a SYN-ACK token; next state `SynAckSend`.
    AttachSynAck,
    /// Attach the ACK token; next state `AckSend`.
    AttachAck,
    /// The first data packet of an initiated flow; next state `Data`
    /// and the handshake bookkeeping goes away.
    Establish,
    /// Verify a SYN token; next state `SynReceived`.
    VerifySyn,
    /// Verify a SYN-ACK token; next state `SynAckReceived`.
    VerifySynAck,
    /// Verify the ACK token; next state `AckProcessed`.
    VerifyAck,
    /// Pass the packet unmodified.
    Forward,
    /// Drop the packet.
    Reject(RejectReason),
}

impl TcpState {
    pub fn next_action(&self, ev: TcpEvent) -> TcpAction {
        use TcpAction::*;
        use TcpState::*;

        match (ev, *self) {
            (TcpEvent::Other, _) => Forward,

            // A SYN, fresh or retransmitted, restarts the handshake.
            (TcpEvent::AppSyn, _) => AttachSyn,
            (TcpEvent::NetSyn, _) => VerifySyn,

            (TcpEvent::AppSynAck, SynReceived | SynAckSend) => AttachSynAck,
            (TcpEvent::AppSynAck, AckProcessed | Data) => Forward,
            (TcpEvent::AppSynAck, _) => Reject(RejectReason::InvalidState),

            (TcpEvent::AppAck, SynSend | SynAckReceived) => AttachAck,
            (TcpEvent::AppAck, AckSend) => Establish,
            (TcpEvent::AppAck, Data) => Forward,
            (TcpEvent::AppAck, _) => Reject(RejectReason::InvalidState),

            // A SYN-ACK in `AckSend` means the peer never saw our ACK:
            // verify it again and send the ACK token again.
            (TcpEvent::NetSynAck, SynSend | SynAckReceived | AckSend) => {
                VerifySynAck
            }
            (TcpEvent::NetSynAck, Data) => Forward,
            (TcpEvent::NetSynAck, _) => Reject(RejectReason::InvalidState),

            (TcpEvent::NetAck, SynReceived | SynAckSend) => VerifyAck,
            (TcpEvent::NetAck, AckProcessed | Data) => Forward,
            (TcpEvent::NetAck, _) => Reject(RejectReason::InvalidState),
        }
    }
}

#[derive(Debug)]
pub struct TcpConnState {
    pub state: TcpState,
    pub auth: AuthInfo,
    /// The decision reported for the flow (observe rules included).
    pub report: Option<FlowPolicy>,
    /// The decision enforced on the flow.
    pub policy: Option<FlowPolicy>,
    /// Set once the accepted flow has been reported.
    pub reported: bool,
    /// Set when the SYN that created the connection failed and took
    /// it out of the trackers. A worker that finds it set looks the
    /// flow up again.
    pub discarded: bool,
}

#[derive(Debug)]
pub struct TcpConnection {
    flow: FlowId,
    context_id: String,
    inner: KMutex<TcpConnState>,
    expired: AtomicBool,
}

impl TcpConnection {
    pub fn new(flow: FlowId, context_id: &str) -> Self {
        Self {
            flow,
            context_id: context_id.into(),
            inner: KMutex::new(TcpConnState {
                state: TcpState::Unknown,
                auth: AuthInfo::new(),
                report: None,
                policy: None,
                reported: false,
                discarded: false,
            }),
            expired: AtomicBool::new(false),
        }
    }

    /// The flow as first seen by the side that created the
    /// connection.
    pub fn flow(&self) -> FlowId {
        self.flow
    }

    pub fn lock(&self) -> KMutexGuard<'_, TcpConnState> {
        self.inner.lock()
    }

    pub fn state(&self) -> TcpState {
        self.inner.lock().state
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// Mark the connection expired. Only the first call reports
    /// where the connection was when it died.
    pub fn expire(&self) -> Option<ExpiredIn> {
        if self.expired.swap(true, Ordering::AcqRel) {
            return None;
        }

        let mut inner = self.inner.lock();
        let died = if inner.state.is_established() {
            ExpiredIn::Established
        } else {
            ExpiredIn::Handshake
        };
        inner.state = TcpState::Unknown;
        Some(died)
    }
}

impl Tracked for TcpConnection {
    fn context_id(&self) -> &str {
        &self.context_id
    }

    fn flow(&self) -> FlowId {
        self.flow
    }
}

// ================================================================
// UDP
// ================================================================

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UdpState {
    #[default]
    Start,
    SynSend,
    SynReceived,
    SynAckSent,
    SynAckReceived,
    /// The responder verified the peer's ACK.
    AckReceived,
    /// The initiator sent its ACK.
    AckProcessed,
    Rst,
}

impl UdpState {
    pub fn is_established(&self) -> bool {
        matches!(self, Self::AckReceived | Self::AckProcessed)
    }
}

impl Display for UdpState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Start => "UDP_START",
            Self::SynSend => "SYN_SEND",
            Self::SynReceived => "SYN_RECEIVED",
            Self::SynAckSent => "SYN_ACK_SENT",
            Self::SynAckReceived => "SYN_ACK_RECEIVED",
            Self::AckReceived => "ACK_RECEIVED",
            Self::AckProcessed => "ACK_PROCESSED",
            Self::Rst => "RST",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UdpEvent {
    /// Any packet from the application.
    AppPacket,
    NetSyn,
    NetSynAck,
    NetAck,
    NetRst,
    /// A network packet without a handshake marker.
    NetData,
}

impl UdpEvent {
    pub const ALL: [UdpEvent; 6] = [
        Self::AppPacket,
        Self::NetSyn,
        Self::NetSynAck,
        Self::NetAck,
        Self::NetRst,
        Self::NetData,
    ];
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UdpAction {
    /// Queue the packet and send a SYN; next state `SynSend`.
    StartHandshake,
    /// Queue the packet until the handshake completes.
    Queue,
    /// Verify a SYN and answer with a SYN-ACK; next state
    /// `SynAckSent`.
    VerifySyn,
    /// Verify a SYN-ACK, answer with an ACK and release the queue;
    /// next state `AckProcessed`.
    VerifySynAck,
    /// Verify the ACK and release the queue; next state
    /// `AckReceived`.
    VerifyAck,
    /// Destroy the connection.
    Teardown,
    Forward,
    Reject(RejectReason),
}

impl UdpState {
    pub fn next_action(&self, ev: UdpEvent) -> UdpAction {
        use UdpAction::*;
        use UdpState::*;

        match (ev, *self) {
            (UdpEvent::NetRst, _) => Teardown,

            (UdpEvent::AppPacket, Start) => StartHandshake,
            (UdpEvent::AppPacket, AckReceived | AckProcessed) => Forward,
            (UdpEvent::AppPacket, Rst) => Reject(RejectReason::InvalidState),
            (UdpEvent::AppPacket, _) => Queue,

            // A peer restarting its side gets a fresh handshake.
            (UdpEvent::NetSyn, _) => VerifySyn,

            // A repeated SYN-ACK means our ACK was lost.
            (UdpEvent::NetSynAck, SynSend | SynAckReceived | AckProcessed) => {
                VerifySynAck
            }
            (UdpEvent::NetSynAck, _) => Reject(RejectReason::InvalidState),

            (UdpEvent::NetAck, SynAckSent | AckReceived) => VerifyAck,
            (UdpEvent::NetAck, _) => Reject(RejectReason::InvalidState),

            (UdpEvent::NetData, AckReceived | AckProcessed) => Forward,
            (UdpEvent::NetData, _) => Reject(RejectReason::InvalidState),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum QueueError {
    Full { limit: usize },
}

impl Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Full { limit } => write!(f, "packet queue full ({limit})"),
        }
    }
}

impl std::error::Error for QueueError {}

/// A handshake packet waiting to be sent again.
#[derive(Clone, Debug)]
pub struct Retransmit {
    /// The state the packet was sent from; a different state means
    /// the retransmit is stale.
    pub phase: UdpState,
    pub packet: Vec<u8>,
    pub mark: u32,
    pub attempts_left: u32,
    pub next_at: Moment,
}

/// What a retransmit check decided.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetransmitDue {
    NotYet,
    Send { packet: Vec<u8>, mark: u32 },
    Exhausted,
}

#[derive(Debug)]
pub struct UdpConnState {
    state: UdpState,
    pub auth: AuthInfo,
    pub report: Option<FlowPolicy>,
    pub policy: Option<FlowPolicy>,
    pub reported: bool,
    /// See [`TcpConnState::discarded`].
    pub discarded: bool,
    queue: VecDeque<(Vec<u8>, u32)>,
    queue_limit: usize,
    retransmit: Option<Retransmit>,
}

impl UdpConnState {
    pub fn state(&self) -> UdpState {
        self.state
    }

    /// Move to `next`. A pending retransmit belongs to the state it
    /// was armed in and is cancelled by any transition.
    pub fn set_state(&mut self, next: UdpState) {
        if next != self.state {
            self.retransmit = None;
        }
        self.state = next;
    }

    pub fn queue_packet(&mut self, pkt: Vec<u8>, mark: u32) -> Result<(), QueueError> {
        if self.queue.len() >= self.queue_limit {
            return Err(QueueError::Full { limit: self.queue_limit });
        }
        self.queue.push_back((pkt, mark));
        Ok(())
    }

    /// Take every queued packet, oldest first.
    pub fn drain_queue(&mut self) -> Vec<(Vec<u8>, u32)> {
        self.queue.drain(..).collect()
    }

    pub fn drop_queue(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn arm_retransmit(
        &mut self,
        packet: Vec<u8>,
        mark: u32,
        attempts: u32,
        now: Moment,
        interval: Duration,
    ) {
        self.retransmit = Some(Retransmit {
            phase: self.state,
            packet,
            mark,
            attempts_left: attempts,
            next_at: now + interval,
        });
    }

    pub fn cancel_retransmit(&mut self) {
        self.retransmit = None;
    }

    pub fn retransmit_pending(&self) -> bool {
        self.retransmit.is_some()
    }

    pub fn check_retransmit(&mut self, now: Moment, interval: Duration) -> RetransmitDue {
        let Some(rt) = self.retransmit.as_mut() else {
            return RetransmitDue::NotYet;
        };

        if rt.phase != self.state {
            self.retransmit = None;
            return RetransmitDue::NotYet;
        }

        if now < rt.next_at {
            return RetransmitDue::NotYet;
        }

        if rt.attempts_left == 0 {
            self.retransmit = None;
            return RetransmitDue::Exhausted;
        }

        rt.attempts_left -= 1;
        rt.next_at = now + interval;
        RetransmitDue::Send { packet: rt.packet.clone(), mark: rt.mark }
    }
}

static NEXT_UDP_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct UdpConnection {
    id: u64,
    flow: FlowId,
    context_id: String,
    inner: KMutex<UdpConnState>,
    expired: AtomicBool,
}

impl UdpConnection {
    pub fn new(flow: FlowId, context_id: &str, queue_limit: usize) -> Self {
        Self {
            id: NEXT_UDP_CONN_ID.fetch_add(1, Ordering::Relaxed),
            flow,
            context_id: context_id.into(),
            inner: KMutex::new(UdpConnState {
                state: UdpState::Start,
                auth: AuthInfo::new(),
                report: None,
                policy: None,
                reported: false,
                discarded: false,
                queue: VecDeque::new(),
                queue_limit,
                retransmit: None,
            }),
            expired: AtomicBool::new(false),
        }
    }

    /// A process-unique ID, used to key retransmit registrations.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flow(&self) -> FlowId {
        self.flow
    }

    pub fn lock(&self) -> KMutexGuard<'_, UdpConnState> {
        self.inner.lock()
    }

    pub fn state(&self) -> UdpState {
        self.inner.lock().state
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// Mark the connection expired, dropping its queue and any
    /// pending retransmit. Only the first call reports where the
    /// connection was when it died.
    pub fn expire(&self) -> Option<ExpiredIn> {
        if self.expired.swap(true, Ordering::AcqRel) {
            return None;
        }

        let mut inner = self.inner.lock();
        let died = if inner.state.is_established() {
            ExpiredIn::Established
        } else {
            ExpiredIn::Handshake
        };
        inner.drop_queue();
        inner.set_state(UdpState::Rst);
        Some(died)
    }
}

impl Tracked for UdpConnection {
    fn context_id(&self) -> &str {
        &self.context_id
    }

    fn flow(&self) -> FlowId {
        self.flow
    }
}
