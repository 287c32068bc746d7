// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! UDP: the datapath runs the handshake with packets of its own.
//!
//! The first application packet of a flow is queued and a SYN built
//! from its headers goes out in its place. The peer's datapath
//! answers with a SYN-ACK, we answer that with an ACK, and only then
//! is the queue written out. Handshake packets carry a marker in
//! front of the token and are always consumed by the receiving
//! datapath; the peer's application never sees them.

use super::Datapath;
use super::DropReason;
use super::HandshakeError;
use super::HandshakeResult;
use super::ProcessError;
use super::ProcessResult;
use super::flow_record;
use super::remote_id;
use crate::api::Direction;
use crate::api::FlowAction;
use crate::api::FlowId;
use crate::api::RejectReason;
use crate::config::DatapathConfigExt;
use crate::engine::connection::UdpAction;
use crate::engine::connection::UdpConnState;
use crate::engine::connection::UdpConnection;
use crate::engine::connection::UdpEvent;
use crate::engine::connection::UdpState;
use crate::engine::packet::Packet;
use crate::engine::pucontext::PuContext;
use crate::engine::tags::PORT_TAG_KEY;
use crate::engine::token::TokenError;
use crate::engine::tracker::Tracked;
use crate::engine::tracker::TrackerError;
use crate::engine::udp::UDP_MARKER_LEN;
use crate::engine::udp::UdpMarker;
use crate::engine::udp::UdpPacketType;
use crate::provider::LogLevel;
use crate::time::Moment;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// The token of a handshake packet, after the marker.
fn handshake_token(pkt: &Packet) -> &[u8] {
    pkt.payload().get(UDP_MARKER_LEN..).unwrap_or_default()
}

impl Datapath {
    pub(super) fn process_app_udp(
        &self,
        pkt: Packet,
    ) -> Result<ProcessResult, ProcessError> {
        let flow = pkt.flow();
        let conn = match self.udp_app_conn(flow)? {
            Some(conn) => conn,
            None => {
                let Some(ctx) = self.resolve_context(&pkt) else {
                    return Self::drop_pkt(DropReason::NoContext);
                };
                let limit = self.cfg.udp_queue_len;
                let (conn, _) = self.udp.app_orig.get_or_insert_with(flow, || {
                    Arc::new(UdpConnection::new(flow, ctx.id(), limit))
                })?;
                conn
            }
        };

        let Some(ctx) = self.contexts.get(conn.context_id()) else {
            return Self::drop_pkt(DropReason::NoContext);
        };

        let mut st = conn.lock();
        match st.state().next_action(UdpEvent::AppPacket) {
            UdpAction::StartHandshake => {
                let mark = pkt.mark();
                let token = self.tokens.create_syn_token(&ctx, &mut st.auth)?;
                let marker = UdpMarker::new(UdpPacketType::Syn, self.cfg.encryption);
                let syn = pkt.udp_handshake(false, marker, &token)?;

                self.queue_udp(&mut st, pkt)?;
                self.set_udp_state(Direction::Out, &conn, &mut st, UdpState::SynSend);
                st.arm_retransmit(
                    syn.bytes().to_vec(),
                    mark,
                    self.cfg.udp_retransmit_attempts,
                    Moment::now(),
                    self.cfg.retransmit_interval(),
                );
                drop(st);

                // Without the source-port entry the SYN-ACK cannot be
                // matched, so the handshake is abandoned.
                if let Err(e) = self
                    .udp
                    .source_port
                    .add_or_update(flow.source_port_key(Direction::Out), conn.clone())
                {
                    self.udp.app_orig.remove_if_same(&flow, &conn);
                    conn.expire();
                    return Err(e.into());
                }
                self.register_retransmit(&conn);
                self.send_handshake(flow, syn.bytes(), mark);
                Self::drop_pkt(DropReason::Queued)
            }

            UdpAction::Queue => {
                self.queue_udp(&mut st, pkt)?;
                Self::drop_pkt(DropReason::Queued)
            }

            UdpAction::Forward => {
                drop(st);
                self.accept(pkt, false)
            }

            action => {
                drop(st);
                self.udp_invalid(&pkt, action)
            }
        }
    }

    pub(super) fn process_net_udp(
        &self,
        pkt: Packet,
    ) -> Result<ProcessResult, ProcessError> {
        let Some(marker) = pkt.udp_marker() else {
            return self.net_udp_data(pkt);
        };

        match marker.kind {
            UdpPacketType::Syn => self.net_udp_syn(pkt),
            UdpPacketType::SynAck => self.net_udp_synack(pkt),
            UdpPacketType::Ack => self.net_udp_ack(pkt),
            UdpPacketType::Rst => self.net_udp_rst(pkt),
        }
    }

    /// The connection an application packet belongs to, whichever
    /// side started it. A connection only found through the network
    /// trackers is tracked on the application side again.
    fn udp_app_conn(
        &self,
        flow: FlowId,
    ) -> Result<Option<Arc<UdpConnection>>, TrackerError> {
        let udp = &self.udp;
        if let Some(conn) = udp.app_reply.get(&flow).or_else(|| udp.app_orig.get(&flow)) {
            return Ok(Some(conn));
        }

        let mirror = flow.mirror();
        if let Some(conn) = udp.net_reply.get(&mirror) {
            udp.app_orig.add_or_update(flow, conn.clone())?;
            return Ok(Some(conn));
        }

        if let Some(conn) = udp.net_orig.get(&mirror) {
            udp.app_reply.add_or_update(flow, conn.clone())?;
            return Ok(Some(conn));
        }

        Ok(None)
    }

    /// The network-side counterpart of [`Self::udp_app_conn`].
    fn udp_net_conn(
        &self,
        flow: FlowId,
    ) -> Result<Option<Arc<UdpConnection>>, TrackerError> {
        let udp = &self.udp;
        if let Some(conn) = udp.net_reply.get(&flow).or_else(|| udp.net_orig.get(&flow)) {
            return Ok(Some(conn));
        }

        let mirror = flow.mirror();
        if let Some(conn) = udp.app_orig.get(&mirror) {
            udp.net_reply.add_or_update(flow, conn.clone())?;
            return Ok(Some(conn));
        }

        if let Some(conn) = udp.app_reply.get(&mirror) {
            udp.net_orig.add_or_update(flow, conn.clone())?;
            return Ok(Some(conn));
        }

        Ok(None)
    }

    fn set_udp_state(
        &self,
        dir: Direction,
        conn: &UdpConnection,
        st: &mut UdpConnState,
        next: UdpState,
    ) {
        let prev = st.state();
        st.set_state(next);
        self.udp_state_probe(dir, conn.flow(), prev, next);
    }

    fn queue_udp(
        &self,
        st: &mut UdpConnState,
        pkt: Packet,
    ) -> Result<(), ProcessError> {
        let mark = pkt.mark();
        if let Err(e) = st.queue_packet(pkt.into_bytes(), mark) {
            self.stats.udp_queue_full.incr(1);
            return Err(e.into());
        }
        self.stats.udp_queued.incr(1);
        Ok(())
    }

    /// A lost handshake packet is covered by its retransmission, so a
    /// failed write is only logged.
    fn send_handshake(&self, flow: FlowId, pkt: &[u8], mark: u32) {
        self.stats.udp_handshake_sent.incr(1);
        if let Err(e) = self.write_packet(pkt, mark) {
            self.log.log(
                LogLevel::Warn,
                &format!("{flow} handshake write failed: {e}"),
            );
        }
    }

    /// Write out the packets held during the handshake, in order.
    fn flush_queue(&self, flow: FlowId, queued: Vec<(Vec<u8>, u32)>) {
        let n = queued.len();
        for (pkt, mark) in queued {
            if let Err(e) = self.write_packet(&pkt, mark) {
                self.log.log(
                    LogLevel::Warn,
                    &format!("{flow} queued packet write failed: {e}"),
                );
            }
        }

        if n > 0 {
            self.log.log(LogLevel::Debug, &format!("{flow} released {n} packets"));
        }
    }

    fn udp_invalid(
        &self,
        pkt: &Packet,
        action: UdpAction,
    ) -> Result<ProcessResult, ProcessError> {
        let reason = match action {
            UdpAction::Reject(r) => r,
            _ => RejectReason::InvalidState,
        };
        self.log.log(
            LogLevel::Debug,
            &format!("{} {} dropped: {reason} ({action:?})", pkt.dir(), pkt.flow()),
        );
        Self::drop_pkt(DropReason::Reject(reason))
    }

    fn net_udp_syn(&self, pkt: Packet) -> Result<ProcessResult, ProcessError> {
        let Some(ctx) = self.resolve_context(&pkt) else {
            return Self::drop_pkt(DropReason::NoContext);
        };

        let flow = pkt.flow();
        let limit = self.cfg.udp_queue_len;
        loop {
            let (conn, created) = self.udp.net_orig.get_or_insert_with(flow, || {
                Arc::new(UdpConnection::new(flow, ctx.id(), limit))
            })?;

            let mut st = conn.lock();
            if st.discarded {
                continue;
            }

            let fresh = created && st.state() == UdpState::Start;
            let res = match st.state().next_action(UdpEvent::NetSyn) {
                UdpAction::VerifySyn => {
                    self.verify_udp_syn(&ctx, &conn, &mut st, &pkt)
                }
                UdpAction::Reject(r) => Err(HandshakeError::Reject(r)),
                _ => Err(HandshakeError::Reject(RejectReason::InvalidState)),
            };

            let e = match res {
                Ok(synack) => {
                    drop(st);
                    self.udp.app_reply.add_or_update(flow.mirror(), conn.clone())?;
                    self.register_retransmit(&conn);
                    self.send_handshake(flow, synack.bytes(), pkt.mark());
                    return Self::drop_pkt(DropReason::Consumed);
                }
                Err(e) => e,
            };

            if fresh {
                st.discarded = true;
                self.udp.net_orig.remove_if_same(&flow, &conn);
            }

            return match e {
                HandshakeError::Reject(reason) => {
                    let rec = flow_record(
                        flow,
                        ctx.id(),
                        (remote_id(&st.auth.remote_context_id), ctx.id()),
                        FlowAction::Reject,
                        Some(reason),
                        (st.report.as_ref(), st.policy.as_ref()),
                    );
                    drop(st);
                    self.report_flow(rec);
                    Self::drop_pkt(DropReason::Reject(reason))
                }

                HandshakeError::Fatal(e) => {
                    drop(st);
                    Err(e)
                }
            };
        }
    }

    /// Verify the peer's SYN and build the SYN-ACK answering it.
    fn verify_udp_syn(
        &self,
        ctx: &PuContext,
        conn: &UdpConnection,
        st: &mut UdpConnState,
        pkt: &Packet,
    ) -> HandshakeResult<Packet> {
        let flow = pkt.flow();
        let (claims, _) = self
            .tokens
            .parse_token(&mut st.auth, handshake_token(pkt))
            .map_err(|e| self.token_reject(flow, RejectReason::InvalidToken, e))?;

        let mut tags = claims.policy_tags();
        tags.append_key_value(PORT_TAG_KEY, &flow.dst_port.to_string());
        let (report, policy) = ctx.search_rcv_rules(&tags);
        let rejected = policy.rejected();
        st.report = Some(report);
        st.policy = Some(policy);
        if rejected {
            return Err(HandshakeError::Reject(RejectReason::PolicyDrop));
        }
        self.set_udp_state(Direction::In, conn, st, UdpState::SynReceived);

        let token = self.tokens.create_synack_token(ctx, &mut st.auth)?;
        let marker = UdpMarker::new(UdpPacketType::SynAck, self.cfg.encryption);
        let synack = pkt.udp_handshake(true, marker, &token)?;

        self.set_udp_state(Direction::In, conn, st, UdpState::SynAckSent);
        st.arm_retransmit(
            synack.bytes().to_vec(),
            pkt.mark(),
            self.cfg.udp_retransmit_attempts,
            Moment::now(),
            self.cfg.retransmit_interval(),
        );
        Ok(synack)
    }

    fn net_udp_synack(&self, pkt: Packet) -> Result<ProcessResult, ProcessError> {
        let flow = pkt.flow();
        let conn = match self.udp.net_reply.get(&flow) {
            Some(conn) => conn,
            None => match self.udp.source_port.get(&pkt.source_port_key()) {
                Some(conn) => conn,
                None => {
                    self.log.log(
                        LogLevel::Debug,
                        &format!("{flow} SYN-ACK without a SYN, passed"),
                    );
                    return self.accept(pkt, false);
                }
            },
        };

        let Some(ctx) = self.contexts.get(conn.context_id()) else {
            return Self::drop_pkt(DropReason::NoContext);
        };

        let mut st = conn.lock();
        let res = match st.state().next_action(UdpEvent::NetSynAck) {
            UdpAction::VerifySynAck => {
                self.verify_udp_synack(&ctx, &conn, &mut st, &pkt)
            }
            UdpAction::Reject(r) => Err(HandshakeError::Reject(r)),
            _ => Err(HandshakeError::Reject(RejectReason::InvalidState)),
        };

        let remote = remote_id(&st.auth.remote_context_id);
        match res {
            Ok(ack) => {
                let rec = (!st.reported).then(|| {
                    flow_record(
                        conn.flow(),
                        ctx.id(),
                        (ctx.id(), remote),
                        FlowAction::Accept,
                        None,
                        (st.report.as_ref(), st.policy.as_ref()),
                    )
                });
                st.reported = true;
                let queued = st.drain_queue();
                drop(st);

                self.udp.net_reply.add_or_update(flow, conn.clone())?;
                // The ACK goes out before the data it unblocks.
                self.send_handshake(flow, ack.bytes(), pkt.mark());
                self.flush_queue(conn.flow(), queued);
                if let Some(rec) = rec {
                    self.report_flow(rec);
                }
                Self::drop_pkt(DropReason::Consumed)
            }

            Err(HandshakeError::Reject(reason)) => {
                let rec = flow_record(
                    conn.flow(),
                    ctx.id(),
                    (ctx.id(), remote),
                    FlowAction::Reject,
                    Some(reason),
                    (st.report.as_ref(), st.policy.as_ref()),
                );
                let dropped = st.drop_queue();
                drop(st);

                if dropped > 0 {
                    self.log.log(
                        LogLevel::Debug,
                        &format!("{flow} {dropped} queued packets dropped"),
                    );
                }
                self.report_flow(rec);
                Self::drop_pkt(DropReason::Reject(reason))
            }

            Err(HandshakeError::Fatal(e)) => Err(e),
        }
    }

    /// Verify the peer's SYN-ACK and build the ACK answering it.
    fn verify_udp_synack(
        &self,
        ctx: &PuContext,
        conn: &UdpConnection,
        st: &mut UdpConnState,
        pkt: &Packet,
    ) -> HandshakeResult<Packet> {
        let flow = pkt.flow();
        let (claims, _) = self
            .tokens
            .parse_token(&mut st.auth, handshake_token(pkt))
            .map_err(|e| {
                let reason = match e {
                    TokenError::NonceMismatch => RejectReason::InvalidToken,
                    _ => RejectReason::MissingToken,
                };
                self.token_reject(flow, reason, e)
            })?;

        if claims.id.is_empty() {
            return Err(HandshakeError::Reject(RejectReason::InvalidContext));
        }

        let (report, policy) = ctx.search_txt_rules(
            &claims.policy_tags(),
            self.cfg.mutual_authorization,
        );
        let rejected = policy.rejected();
        st.report = Some(report);
        st.policy = Some(policy);
        if rejected {
            return Err(HandshakeError::Reject(RejectReason::PolicyDrop));
        }
        self.set_udp_state(Direction::In, conn, st, UdpState::SynAckReceived);

        let token = self.tokens.create_ack_token(&st.auth)?;
        let marker = UdpMarker::new(UdpPacketType::Ack, self.cfg.encryption);
        let ack = pkt.udp_handshake(true, marker, &token)?;
        self.set_udp_state(Direction::In, conn, st, UdpState::AckProcessed);
        Ok(ack)
    }

    fn net_udp_ack(&self, pkt: Packet) -> Result<ProcessResult, ProcessError> {
        let flow = pkt.flow();
        let Some(conn) = self.udp_net_conn(flow)? else {
            self.log.log(LogLevel::Debug, &format!("{flow} ACK without a SYN"));
            return Self::drop_pkt(DropReason::NoConnection);
        };

        let Some(ctx) = self.contexts.get(conn.context_id()) else {
            return Self::drop_pkt(DropReason::NoContext);
        };

        let mut st = conn.lock();
        let res = match st.state().next_action(UdpEvent::NetAck) {
            UdpAction::VerifyAck => {
                let token = handshake_token(&pkt);
                match self.tokens.parse_ack_token(&st.auth, token) {
                    Ok(()) => {
                        self.set_udp_state(
                            Direction::In,
                            &conn,
                            &mut st,
                            UdpState::AckReceived,
                        );
                        Ok(())
                    }
                    Err(e) => Err(self.token_reject(flow, RejectReason::PolicyDrop, e)),
                }
            }
            UdpAction::Reject(r) => Err(HandshakeError::Reject(r)),
            _ => Err(HandshakeError::Reject(RejectReason::InvalidState)),
        };

        let remote = remote_id(&st.auth.remote_context_id);
        match res {
            Ok(()) => {
                let rec = (!st.reported).then(|| {
                    flow_record(
                        conn.flow(),
                        ctx.id(),
                        (remote, ctx.id()),
                        FlowAction::Accept,
                        None,
                        (st.report.as_ref(), st.policy.as_ref()),
                    )
                });
                st.reported = true;
                let queued = st.drain_queue();
                drop(st);

                self.flush_queue(flow.mirror(), queued);
                if let Some(rec) = rec {
                    self.report_flow(rec);
                }
                Self::drop_pkt(DropReason::Consumed)
            }

            Err(HandshakeError::Reject(reason)) => {
                let rec = flow_record(
                    conn.flow(),
                    ctx.id(),
                    (remote, ctx.id()),
                    FlowAction::Reject,
                    Some(reason),
                    (st.report.as_ref(), st.policy.as_ref()),
                );
                drop(st);
                self.report_flow(rec);
                Self::drop_pkt(DropReason::Reject(reason))
            }

            Err(HandshakeError::Fatal(e)) => Err(e),
        }
    }

    fn net_udp_rst(&self, pkt: Packet) -> Result<ProcessResult, ProcessError> {
        let flow = pkt.flow();
        let conn = match self.udp_net_conn(flow)? {
            Some(conn) => Some(conn),
            None => self.udp.source_port.get(&pkt.source_port_key()),
        };

        if let Some(conn) = conn {
            let mut st = conn.lock();
            match st.state().next_action(UdpEvent::NetRst) {
                UdpAction::Teardown => {
                    st.drop_queue();
                    self.set_udp_state(Direction::In, &conn, &mut st, UdpState::Rst);
                    drop(st);
                    self.udp.forget(&conn, conn.flow());
                    self.retransmits.lock().remove(&conn.id());
                }
                action => {
                    drop(st);
                    return self.udp_invalid(&pkt, action);
                }
            }
        }

        Self::drop_pkt(DropReason::Consumed)
    }

    fn net_udp_data(&self, pkt: Packet) -> Result<ProcessResult, ProcessError> {
        let flow = pkt.flow();
        let Some(conn) = self.udp_net_conn(flow)? else {
            return Self::drop_pkt(DropReason::NoConnection);
        };

        let st = conn.lock();
        match st.state().next_action(UdpEvent::NetData) {
            UdpAction::Forward => {
                drop(st);
                self.accept(pkt, false)
            }

            action => {
                drop(st);
                self.udp_invalid(&pkt, action)
            }
        }
    }

    /// The state of the UDP connection tracked for `flow`, whichever
    /// side created it.
    #[cfg(any(test, feature = "test-help"))]
    pub fn udp_state(&self, flow: &FlowId) -> Option<UdpState> {
        self.udp
            .flow_trackers()
            .into_iter()
            .find_map(|t| t.get(flow).or_else(|| t.get(&flow.mirror())))
            .map(|c| c.state())
    }

    /// The number of packets queued on the UDP connection of `flow`.
    #[cfg(any(test, feature = "test-help"))]
    pub fn udp_queue_len(&self, flow: &FlowId) -> Option<usize> {
        self.udp
            .flow_trackers()
            .into_iter()
            .find_map(|t| t.get(flow).or_else(|| t.get(&flow.mirror())))
            .map(|c| c.lock().queue_len())
    }
}
