// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! TCP: tokens ride on the three handshake segments.
//!
//! The sender prepends the token to the payload, appends the
//! authentication option and moves its sequence numbers back by the
//! bytes it injected, so that after the receiver strips the token and
//! moves them forward again both stacks see the numbers they chose.
//! The adjustment covers the ACK token on the SYN and the SYN-ACK as
//! well, because the ACK is the segment the receiving stack measures
//! the first data byte against.
//!
//! | segment | seq        | ack |
//! |---------|------------|-----|
//! | SYN     | SYN token + ACK token | 0 |
//! | SYN-ACK | SYN-ACK token | ACK token |
//! | ACK     | ACK token  | 0   |

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
use crate::api::RejectReason;
use crate::engine::connection::TcpAction;
use crate::engine::connection::TcpConnState;
use crate::engine::connection::TcpConnection;
use crate::engine::connection::TcpEvent;
use crate::engine::connection::TcpState;
use crate::engine::packet::Packet;
use crate::engine::packet::PacketError;
use crate::engine::pucontext::PuContext;
use crate::engine::tags::PORT_TAG_KEY;
use crate::engine::tcp::Segment;
use crate::engine::token::TokenError;
use crate::engine::tracker::Tracked;
use crate::provider::LogLevel;
use alloc::string::ToString;
use alloc::sync::Arc;

/// Put `token` in front of the payload, mark the segment with the
/// option and hide the injected bytes from the sequence space.
fn attach_token(
    pkt: &mut Packet,
    token: &[u8],
    seq: usize,
    ack: usize,
) -> Result<(), PacketError> {
    pkt.append_auth_option()?;
    pkt.insert_payload(0, token)?;
    pkt.adjust_for_injected_bytes(seq as u32, ack as u32);
    Ok(())
}

fn strip_token(
    pkt: &mut Packet,
    len: usize,
    seq: usize,
    ack: usize,
) -> Result<(), PacketError> {
    pkt.remove_payload(0, len)?;
    pkt.remove_auth_option()?;
    pkt.undo_injected_bytes(seq as u32, ack as u32);
    Ok(())
}

impl Datapath {
    pub(super) fn process_app_tcp(
        &self,
        pkt: Packet,
    ) -> Result<ProcessResult, ProcessError> {
        match pkt.tcp_flags().segment() {
            Segment::Syn => self.app_tcp_syn(pkt),
            Segment::SynAck => self.app_tcp_synack(pkt),
            Segment::Ack => self.app_tcp_ack(pkt),
            Segment::Teardown => {
                self.tcp_teardown(&pkt);
                self.accept(pkt, false)
            }
            Segment::Other => self.accept(pkt, false),
        }
    }

    pub(super) fn process_net_tcp(
        &self,
        pkt: Packet,
    ) -> Result<ProcessResult, ProcessError> {
        match pkt.tcp_flags().segment() {
            Segment::Syn => self.net_tcp_syn(pkt),
            Segment::SynAck => self.net_tcp_synack(pkt),
            Segment::Ack => self.net_tcp_ack(pkt),
            Segment::Teardown => {
                self.tcp_teardown(&pkt);
                self.accept(pkt, false)
            }
            Segment::Other => self.accept(pkt, false),
        }
    }

    fn set_tcp_state(
        &self,
        dir: Direction,
        conn: &TcpConnection,
        st: &mut TcpConnState,
        next: TcpState,
    ) {
        let prev = st.state;
        st.state = next;
        self.tcp_state_probe(dir, conn.flow(), prev, next);
    }

    /// Drop a packet the connection state does not allow.
    fn tcp_invalid(
        &self,
        pkt: &Packet,
        action: TcpAction,
    ) -> Result<ProcessResult, ProcessError> {
        let reason = match action {
            TcpAction::Reject(r) => r,
            _ => RejectReason::InvalidState,
        };
        self.log.log(
            LogLevel::Debug,
            &format!(
                "{} {} [{}] dropped: {reason} ({action:?})",
                pkt.dir(),
                pkt.flow(),
                pkt.tcp_flags()
            ),
        );
        Self::drop_pkt(DropReason::Reject(reason))
    }

    fn app_tcp_syn(&self, mut pkt: Packet) -> Result<ProcessResult, ProcessError> {
        let Some(ctx) = self.resolve_context(&pkt) else {
            return Self::drop_pkt(DropReason::NoContext);
        };

        let flow = pkt.flow();
        let (conn, created) = self.tcp.app_orig.get_or_insert_with(flow, || {
            Arc::new(TcpConnection::new(flow, ctx.id()))
        })?;
        if let Err(e) =
            self.tcp.source_port.add_or_update(pkt.source_port_key(), conn.clone())
        {
            if created {
                self.tcp.app_orig.remove_if_same(&flow, &conn);
            }
            return Err(e.into());
        }

        let mut st = conn.lock();
        match st.state.next_action(TcpEvent::AppSyn) {
            TcpAction::AttachSyn => {
                let token = self.tokens.create_syn_token(&ctx, &mut st.auth)?;
                let seq = token.len() + self.tokens.ack_size();
                attach_token(&mut pkt, &token, seq, 0)?;
                self.set_tcp_state(Direction::Out, &conn, &mut st, TcpState::SynSend);
                drop(st);
                self.accept(pkt, true)
            }

            action => {
                drop(st);
                self.tcp_invalid(&pkt, action)
            }
        }
    }

    fn app_tcp_synack(
        &self,
        mut pkt: Packet,
    ) -> Result<ProcessResult, ProcessError> {
        let flow = pkt.flow();
        let conn = match self.tcp.app_reply.get(&flow) {
            Some(conn) => conn,
            None => match self.tcp.net_orig.get(&flow.mirror()) {
                Some(conn) => {
                    self.tcp.app_reply.add_or_update(flow, conn.clone())?;
                    conn
                }
                None => return Self::drop_pkt(DropReason::NoConnection),
            },
        };

        let Some(ctx) = self.contexts.get(conn.context_id()) else {
            return Self::drop_pkt(DropReason::NoContext);
        };

        let mut st = conn.lock();
        match st.state.next_action(TcpEvent::AppSynAck) {
            TcpAction::AttachSynAck => {
                let token = self.tokens.create_synack_token(&ctx, &mut st.auth)?;
                let (seq, ack) = (token.len(), self.tokens.ack_size());
                attach_token(&mut pkt, &token, seq, ack)?;
                self.set_tcp_state(Direction::Out, &conn, &mut st, TcpState::SynAckSend);
                drop(st);
                self.accept(pkt, true)
            }

            TcpAction::Forward => {
                drop(st);
                self.accept(pkt, false)
            }

            action => {
                drop(st);
                self.tcp_invalid(&pkt, action)
            }
        }
    }

    fn app_tcp_ack(&self, mut pkt: Packet) -> Result<ProcessResult, ProcessError> {
        let flow = pkt.flow();

        // Established flows have left the trackers.
        let Some(conn) = self.tcp.app_orig.get(&flow) else {
            return self.accept(pkt, false);
        };

        let mut st = conn.lock();
        match st.state.next_action(TcpEvent::AppAck) {
            TcpAction::AttachAck if st.auth.remote_nonce.is_some() => {
                let token = self.tokens.create_ack_token(&st.auth)?;
                attach_token(&mut pkt, &token, token.len(), 0)?;
                self.set_tcp_state(Direction::Out, &conn, &mut st, TcpState::AckSend);
                drop(st);
                self.accept(pkt, true)
            }

            TcpAction::Establish => {
                self.set_tcp_state(Direction::Out, &conn, &mut st, TcpState::Data);
                drop(st);
                self.tcp.app_orig.remove_if_same(&flow, &conn);
                self.tcp.net_reply.remove_if_same(&flow.mirror(), &conn);
                self.tcp
                    .source_port
                    .remove_if_same(&pkt.source_port_key(), &conn);
                self.accept(pkt, false)
            }

            TcpAction::Forward => {
                drop(st);
                self.accept(pkt, false)
            }

            // Also an ACK before any SYN-ACK was verified.
            action => {
                drop(st);
                self.tcp_invalid(&pkt, action)
            }
        }
    }

    fn net_tcp_syn(&self, mut pkt: Packet) -> Result<ProcessResult, ProcessError> {
        let Some(ctx) = self.resolve_context(&pkt) else {
            return Self::drop_pkt(DropReason::NoContext);
        };

        let flow = pkt.flow();
        loop {
            let (conn, created) = self.tcp.net_orig.get_or_insert_with(flow, || {
                Arc::new(TcpConnection::new(flow, ctx.id()))
            })?;

            let mut st = conn.lock();
            if st.discarded {
                continue;
            }

            // Only what this worker did to the connection is undone
            // on failure.
            let fresh = created && st.state == TcpState::Unknown;
            let action = st.state.next_action(TcpEvent::NetSyn);
            let res = match action {
                TcpAction::VerifySyn => {
                    self.verify_tcp_syn(&ctx, &conn, &mut st, &mut pkt)
                }
                _ => Err(HandshakeError::Reject(RejectReason::InvalidState)),
            };

            let e = match res {
                Ok(()) => {
                    drop(st);
                    return self.accept(pkt, true);
                }
                Err(e) => e,
            };

            // An unauthenticated SYN leaves nothing behind.
            if fresh {
                st.discarded = true;
                self.tcp.net_orig.remove_if_same(&flow, &conn);
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

    fn verify_tcp_syn(
        &self,
        ctx: &PuContext,
        conn: &TcpConnection,
        st: &mut TcpConnState,
        pkt: &mut Packet,
    ) -> HandshakeResult<()> {
        let flow = pkt.flow();
        let (claims, len) = self
            .tokens
            .parse_token(&mut st.auth, pkt.payload())
            .map_err(|e| self.token_reject(flow, RejectReason::InvalidToken, e))?;

        if !pkt.has_auth_option() {
            return Err(HandshakeError::Reject(RejectReason::InvalidFormat));
        }

        strip_token(pkt, len, len + self.tokens.ack_size(), 0)?;

        let mut tags = claims.policy_tags();
        tags.append_key_value(PORT_TAG_KEY, &flow.dst_port.to_string());
        let (report, policy) = ctx.search_rcv_rules(&tags);
        let rejected = policy.rejected();
        st.report = Some(report);
        st.policy = Some(policy);
        if rejected {
            return Err(HandshakeError::Reject(RejectReason::PolicyDrop));
        }

        self.set_tcp_state(Direction::In, conn, st, TcpState::SynReceived);
        Ok(())
    }

    fn net_tcp_synack(
        &self,
        mut pkt: Packet,
    ) -> Result<ProcessResult, ProcessError> {
        let flow = pkt.flow();
        let conn = match self.tcp.net_reply.get(&flow) {
            Some(conn) => conn,
            None => match self.tcp.source_port.get(&pkt.source_port_key()) {
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
        let res = match st.state.next_action(TcpEvent::NetSynAck) {
            TcpAction::VerifySynAck => {
                self.verify_tcp_synack(&ctx, &conn, &mut st, &mut pkt)
            }

            TcpAction::Forward => {
                drop(st);
                return self.accept(pkt, false);
            }

            TcpAction::Reject(r) => Err(HandshakeError::Reject(r)),
            _ => Err(HandshakeError::Reject(RejectReason::InvalidState)),
        };

        let remote = remote_id(&st.auth.remote_context_id);
        match res {
            Ok(()) => {
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
                drop(st);

                self.tcp.net_reply.add_or_update(flow, conn.clone())?;
                if let Some(rec) = rec {
                    self.report_flow(rec);
                }
                self.accept(pkt, true)
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
                drop(st);
                self.report_flow(rec);
                Self::drop_pkt(DropReason::Reject(reason))
            }

            Err(HandshakeError::Fatal(e)) => Err(e),
        }
    }

    fn verify_tcp_synack(
        &self,
        ctx: &PuContext,
        conn: &TcpConnection,
        st: &mut TcpConnState,
        pkt: &mut Packet,
    ) -> HandshakeResult<()> {
        let flow = pkt.flow();
        if pkt.payload_len() == 0 {
            return Err(HandshakeError::Reject(RejectReason::MissingToken));
        }

        let (claims, len) = self
            .tokens
            .parse_token(&mut st.auth, pkt.payload())
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

        if !pkt.has_auth_option() {
            return Err(HandshakeError::Reject(RejectReason::InvalidFormat));
        }

        strip_token(pkt, len, len, self.tokens.ack_size())?;

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

        self.set_tcp_state(Direction::In, conn, st, TcpState::SynAckReceived);
        Ok(())
    }

    fn net_tcp_ack(&self, mut pkt: Packet) -> Result<ProcessResult, ProcessError> {
        let flow = pkt.flow();

        // Only flows a peer initiated wait for an ACK token.
        let Some(conn) = self.tcp.net_orig.get(&flow) else {
            return self.accept(pkt, false);
        };

        let Some(ctx) = self.contexts.get(conn.context_id()) else {
            return Self::drop_pkt(DropReason::NoContext);
        };

        let mut st = conn.lock();
        let res = match st.state.next_action(TcpEvent::NetAck) {
            TcpAction::VerifyAck => self.verify_tcp_ack(&conn, &mut st, &mut pkt),

            TcpAction::Forward => {
                drop(st);
                return self.accept(pkt, false);
            }

            TcpAction::Reject(r) => Err(HandshakeError::Reject(r)),
            _ => Err(HandshakeError::Reject(RejectReason::InvalidState)),
        };

        let remote = remote_id(&st.auth.remote_context_id);
        match res {
            Ok(()) => {
                let rec = (!st.reported).then(|| {
                    flow_record(
                        flow,
                        ctx.id(),
                        (remote, ctx.id()),
                        FlowAction::Accept,
                        None,
                        (st.report.as_ref(), st.policy.as_ref()),
                    )
                });
                st.reported = true;
                drop(st);

                self.tcp.net_orig.remove_if_same(&flow, &conn);
                self.tcp.app_reply.remove_if_same(&flow.mirror(), &conn);
                if let Some(rec) = rec {
                    self.report_flow(rec);
                }
                self.accept(pkt, true)
            }

            Err(HandshakeError::Reject(reason)) => {
                let rec = flow_record(
                    flow,
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

    fn verify_tcp_ack(
        &self,
        conn: &TcpConnection,
        st: &mut TcpConnState,
        pkt: &mut Packet,
    ) -> HandshakeResult<()> {
        if !pkt.has_auth_option() {
            return Err(HandshakeError::Reject(RejectReason::InvalidFormat));
        }

        let size = self.tokens.ack_size();
        if pkt.payload_len() < size {
            return Err(HandshakeError::Reject(RejectReason::MissingToken));
        }

        let flow = pkt.flow();
        self.tokens
            .parse_ack_token(&st.auth, pkt.payload())
            .map_err(|e| self.token_reject(flow, RejectReason::InvalidToken, e))?;

        strip_token(pkt, size, size, 0)?;
        self.set_tcp_state(Direction::In, conn, st, TcpState::AckProcessed);
        Ok(())
    }

    /// A FIN or RST ends the handshake bookkeeping of its flow, in
    /// both directions.
    fn tcp_teardown(&self, pkt: &Packet) {
        let flow = pkt.flow();
        let mut conns = vec![];
        for t in self.tcp.flow_trackers() {
            for key in [flow, flow.mirror()] {
                if let Some(conn) = t.remove(&key) {
                    conns.push(conn);
                }
            }
        }

        for conn in conns {
            self.tcp.forget(&conn, conn.flow());
        }
    }

    /// The handshake state of the TCP connection tracked for `flow`,
    /// whichever side created it.
    #[cfg(any(test, feature = "test-help"))]
    pub fn tcp_state(&self, flow: &crate::api::FlowId) -> Option<TcpState> {
        self.tcp
            .flow_trackers()
            .into_iter()
            .find_map(|t| t.get(flow).or_else(|| t.get(&flow.mirror())))
            .map(|c| c.state())
    }
}
