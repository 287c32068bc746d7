// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The datapath.
//!
//! A [`Datapath`] receives every intercepted packet of the enforced
//! processing units, one at a time, from any number of queue workers.
//! Packets arriving from the network are [`Direction::In`], packets
//! emitted by a PU are [`Direction::Out`].
//!
//! TCP flows are authenticated in band: the SYN, SYN-ACK and first
//! ACK of a flow carry a token in the payload and an authentication
//! option in the TCP header. Both are removed again before the peer's
//! stack sees the packet, with sequence numbers adjusted so neither
//! stack notices. UDP has no handshake of its own, so the datapath
//! runs one with packets it originates, queueing application packets
//! until it completes.
//!
//! Per-flow state lives in [`TcpConnection`] and [`UdpConnection`]
//! objects shared by five trackers per protocol:
//!
//! * `app_orig`: flows initiated by a local PU, keyed by the
//!   application-side 5-tuple.
//! * `app_reply`: flows initiated by a peer, keyed by the 5-tuple of
//!   the local PU's replies.
//! * `net_orig`: flows initiated by a peer, keyed by the network-side
//!   5-tuple.
//! * `net_reply`: flows initiated by a local PU, keyed by the 5-tuple
//!   of the peer's replies.
//! * `source_port`: flows initiated by a local PU, keyed by the local
//!   endpoint alone. This is how a SYN-ACK is matched to its SYN when
//!   the peer's address was rewritten on the way.
//!
//! Lock order is connection, then tracker shard, then the retransmit
//! registry. A tracker shard lock is never held while a connection is
//! locked by the tracker itself.

mod tcp;
mod udp;

use super::collector::EventCollector;
use super::connection::ExpiredIn;
use super::connection::QueueError;
use super::connection::RetransmitDue;
use super::connection::TcpConnection;
use super::connection::TcpState;
use super::connection::UdpConnection;
use super::connection::UdpState;
use super::packet::Packet;
use super::packet::PacketError;
use super::packet::ParseError;
use super::processor::NullProcessor;
use super::processor::PacketProcessor;
use super::processor::ProcessorError;
use super::pucontext::ContextStore;
use super::pucontext::PuContext;
use super::secrets::Secrets;
use super::token::TokenEngine;
use super::token::TokenError;
use super::tracker::ConnectionTracker;
use super::tracker::Tracked;
use super::tracker::TrackerError;
use super::tracker::Ttl;
use super::writer::PacketWriter;
use super::writer::WriteError;
use crate::api::DEFAULT_ENDPOINT;
use crate::api::DatapathConfig;
use crate::api::Direction;
use crate::api::FlowAction;
use crate::api::FlowId;
use crate::api::FlowPolicy;
use crate::api::FlowRecord;
use crate::api::PacketReport;
use crate::api::PacketStage;
use crate::api::Protocol;
use crate::api::PuPolicy;
use crate::api::RejectReason;
use crate::api::SourcePortKey;
use crate::api::Verdict;
use crate::config::ConfigError;
use crate::config::DatapathConfigExt;
use crate::config::validate;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use crate::provider::Providers;
use crate::stat::StatProvider;
use crate::stat::StatU64;
use crate::sync::KMutex;
use crate::time::Moment;
use crate::time::Periodic;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use core::num::NonZeroU32;

/// Why the datapath dropped a packet without an error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DropReason {
    /// The handshake this packet belongs to was rejected.
    Reject(RejectReason),
    /// No enforced context owns the local endpoint.
    NoContext,
    /// The packet needs a connection and there is none.
    NoConnection,
    /// Held until the UDP handshake completes. The datapath writes it
    /// out itself afterwards.
    Queued,
    /// A UDP handshake packet, fully handled by the datapath.
    Consumed,
}

impl Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Reject(r) => write!(f, "rejected: {r}"),
            Self::NoContext => write!(f, "no context"),
            Self::NoConnection => write!(f, "no connection"),
            Self::Queued => write!(f, "queued"),
            Self::Consumed => write!(f, "consumed"),
        }
    }
}

/// The outcome of processing one packet.
#[derive(Debug)]
pub enum ProcessResult {
    /// Accept the packet as it was handed in.
    Bypass,
    Drop {
        reason: DropReason,
    },
    /// Accept this packet in place of the one handed in.
    Modified(Packet),
}

impl ProcessResult {
    pub fn verdict(&self) -> Verdict {
        match self {
            Self::Bypass | Self::Modified(_) => Verdict::Accept,
            Self::Drop { .. } => Verdict::Drop,
        }
    }
}

/// A packet the datapath could not process. The packet is dropped.
#[derive(Debug)]
pub enum ProcessError {
    Parse(ParseError),
    Packet(PacketError),
    Token(TokenError),
    Tracker(TrackerError),
    Queue(QueueError),
    Processor(ProcessorError),
    Write(WriteError),
}

impl Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "parse: {e}"),
            Self::Packet(e) => write!(f, "packet: {e}"),
            Self::Token(e) => write!(f, "token: {e}"),
            Self::Tracker(e) => write!(f, "tracker: {e}"),
            Self::Queue(e) => write!(f, "queue: {e}"),
            Self::Processor(e) => write!(f, "{e}"),
            Self::Write(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<ParseError> for ProcessError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<PacketError> for ProcessError {
    fn from(e: PacketError) -> Self {
        Self::Packet(e)
    }
}

impl From<TokenError> for ProcessError {
    fn from(e: TokenError) -> Self {
        Self::Token(e)
    }
}

impl From<TrackerError> for ProcessError {
    fn from(e: TrackerError) -> Self {
        Self::Tracker(e)
    }
}

impl From<QueueError> for ProcessError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

impl From<WriteError> for ProcessError {
    fn from(e: WriteError) -> Self {
        Self::Write(e)
    }
}

/// How a handshake step failed: a verdict on the flow, or an error
/// processing the packet.
#[derive(Debug)]
enum HandshakeError {
    Reject(RejectReason),
    Fatal(ProcessError),
}

macro_rules! fatal_from {
    ($($err:ty),*) => {
        $(
            impl From<$err> for HandshakeError {
                fn from(e: $err) -> Self {
                    Self::Fatal(e.into())
                }
            }
        )*
    };
}

fatal_from!(
    ProcessError,
    PacketError,
    TokenError,
    TrackerError,
    QueueError,
    WriteError
);

type HandshakeResult<T> = Result<T, HandshakeError>;

#[derive(StatProvider)]
pub struct DatapathStats {
    /// TCP packets from the application, by outcome.
    app_tcp_in: StatU64,
    app_tcp_out: StatU64,
    app_tcp_drop: StatU64,

    /// TCP packets from the network, by outcome.
    net_tcp_in: StatU64,
    net_tcp_out: StatU64,
    net_tcp_drop: StatU64,

    app_udp_in: StatU64,
    app_udp_out: StatU64,
    app_udp_drop: StatU64,

    net_udp_in: StatU64,
    net_udp_out: StatU64,
    net_udp_drop: StatU64,

    /// Packets that failed to parse.
    parse_err: StatU64,

    /// Packets that are neither TCP nor UDP, passed through.
    other_proto: StatU64,

    /// Packets dropped by the packet processor hooks.
    service_pre_drop: StatU64,
    service_post_drop: StatU64,

    flows_accepted: StatU64,
    flows_rejected: StatU64,

    udp_queued: StatU64,
    udp_queue_full: StatU64,

    /// UDP handshake packets written by the datapath, retransmissions
    /// included.
    udp_handshake_sent: StatU64,
    udp_retransmits: StatU64,
    udp_handshake_timeout: StatU64,

    expired_in_handshake: StatU64,
    expired_established: StatU64,
}

/// The five trackers of one protocol.
struct Trackers<V> {
    app_orig: ConnectionTracker<FlowId, V>,
    app_reply: ConnectionTracker<FlowId, V>,
    net_orig: ConnectionTracker<FlowId, V>,
    net_reply: ConnectionTracker<FlowId, V>,
    source_port: ConnectionTracker<SourcePortKey, V>,
    /// Drained connections a worker was still holding. They are
    /// reaped once the worker lets go, unless it tracked them again.
    held: KMutex<Vec<Arc<V>>>,
}

impl<V: Tracked> Trackers<V> {
    fn new(proto: &str, limit: NonZeroU32, ttl: Ttl, shards: u32) -> Self {
        let name = |t: &str| format!("{proto}-{t}");
        Self {
            app_orig: ConnectionTracker::new(&name("app-orig"), limit, ttl, shards),
            app_reply: ConnectionTracker::new(&name("app-reply"), limit, ttl, shards),
            net_orig: ConnectionTracker::new(&name("net-orig"), limit, ttl, shards),
            net_reply: ConnectionTracker::new(&name("net-reply"), limit, ttl, shards),
            source_port: ConnectionTracker::new(
                &name("source-port"),
                limit,
                ttl,
                shards,
            ),
            held: KMutex::new(Vec::new()),
        }
    }

    fn flow_trackers(&self) -> [&ConnectionTracker<FlowId, V>; 4] {
        [&self.app_orig, &self.app_reply, &self.net_orig, &self.net_reply]
    }

    /// Remove every entry for `conn`, whose creating flow is `flow`.
    fn forget(&self, conn: &Arc<V>, flow: FlowId) {
        let mirror = flow.mirror();
        for t in self.flow_trackers() {
            t.remove_if_same(&flow, conn);
            t.remove_if_same(&mirror, conn);
        }
        self.source_port
            .remove_if_same(&flow.source_port_key(Direction::Out), conn);
        self.source_port
            .remove_if_same(&mirror.source_port_key(Direction::Out), conn);
    }

    /// Whether any tracker still maps a key of `conn` to it.
    fn tracks(&self, conn: &Arc<V>) -> bool {
        let flow = conn.flow();
        let mirror = flow.mirror();
        self.flow_trackers()
            .into_iter()
            .any(|t| t.holds(&flow, conn) || t.holds(&mirror, conn))
            || [flow, mirror].iter().any(|f| {
                self.source_port.holds(&f.source_port_key(Direction::Out), conn)
            })
    }

    /// Drain every entry matched by `f` and return the distinct
    /// connections that nothing references anymore. Held connections
    /// matched by `h` are looked at again.
    fn drain<F, G, H>(&self, f: F, g: G, h: H) -> Vec<Arc<V>>
    where
        F: Fn(&ConnectionTracker<FlowId, V>) -> Vec<(FlowId, Arc<V>)>,
        G: Fn(&ConnectionTracker<SourcePortKey, V>) -> Vec<(SourcePortKey, Arc<V>)>,
        H: Fn(&V) -> bool,
    {
        let mut conns: Vec<Arc<V>> = self
            .flow_trackers()
            .into_iter()
            .flat_map(|t| f(t).into_iter().map(|(_, c)| c))
            .chain(g(&self.source_port).into_iter().map(|(_, c)| c))
            .collect();

        let held = core::mem::take(&mut *self.held.lock());
        let (again, rest): (Vec<_>, Vec<_>) = held.into_iter().partition(|c| h(c.as_ref()));
        self.held.lock().extend(rest);
        conns.extend(again);

        conns.sort_by_key(|c| Arc::as_ptr(c) as *const () as usize);
        conns.dedup_by(|a, b| Arc::ptr_eq(a, b));

        // A connection still reachable through a live entry is not
        // dead yet, and its last entry brings it back here. One only
        // a worker holds waits for the worker.
        let (dead, live): (Vec<_>, Vec<_>) =
            conns.into_iter().partition(|c| Arc::strong_count(c) == 1);
        let held: Vec<_> = live.into_iter().filter(|c| !self.tracks(c)).collect();
        self.held.lock().extend(held);
        dead
    }

    fn clear(&self) {
        for t in self.flow_trackers() {
            t.clear();
        }
        self.source_port.clear();
        self.held.lock().clear();
    }

    fn expire_at(&self, now: Moment) -> Vec<Arc<V>> {
        self.drain(|t| t.expire_at(now), |t| t.expire_at(now), |_| true)
    }

    fn purge_context(&self, id: &str) -> Vec<Arc<V>> {
        self.drain(
            |t| t.purge_context(id),
            |t| t.purge_context(id),
            |c| c.context_id() == id,
        )
    }

    fn entries(&self, out: &mut Vec<(String, u32)>) {
        for t in self.flow_trackers() {
            out.push((t.name().to_string(), t.num_entries()));
        }
        out.push((
            self.source_port.name().to_string(),
            self.source_port.num_entries(),
        ));
    }
}

pub struct Datapath {
    cfg: DatapathConfig,
    log: Box<dyn LogProvider>,
    tokens: TokenEngine,
    contexts: ContextStore,
    collector: Arc<dyn EventCollector>,
    processor: Arc<dyn PacketProcessor>,
    writer: Arc<dyn PacketWriter>,
    tcp: Trackers<TcpConnection>,
    udp: Trackers<UdpConnection>,
    retransmits: KMutex<BTreeMap<u64, Weak<UdpConnection>>>,
    stats: DatapathStats,
    maintenance: KMutex<Option<Periodic>>,
}

impl Datapath {
    pub fn new(
        cfg: DatapathConfig,
        secrets: Arc<dyn Secrets>,
        collector: Arc<dyn EventCollector>,
        writer: Arc<dyn PacketWriter>,
        providers: Providers,
    ) -> Result<Self, ConfigError> {
        validate(&cfg)?;

        let tokens = TokenEngine::new(
            secrets,
            cfg.token_validity_secs,
            cfg.compression,
            cfg.encryption,
        );
        let limit = cfg.tracker_limit();
        let tcp = Trackers::new("tcp", limit, cfg.tcp_ttl(), cfg.tracker_shards);
        let udp = Trackers::new("udp", limit, cfg.udp_ttl(), cfg.tracker_shards);

        Ok(Self {
            cfg,
            log: providers.log,
            tokens,
            contexts: ContextStore::new(),
            collector,
            processor: Arc::new(NullProcessor),
            writer,
            tcp,
            udp,
            retransmits: KMutex::new(BTreeMap::new()),
            stats: DatapathStats::new(),
            maintenance: KMutex::new(None),
        })
    }

    /// Install a packet processor in place of the default no-op one.
    pub fn with_processor(mut self, processor: Arc<dyn PacketProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn config(&self) -> &DatapathConfig {
        &self.cfg
    }

    /// Log through the datapath's provider.
    pub fn log(&self, level: LogLevel, msg: &str) {
        self.log.log(level, msg);
    }

    pub fn tokens(&self) -> &TokenEngine {
        &self.tokens
    }

    pub fn stats(&self) -> DatapathStatsSnap {
        self.stats.snapshot()
    }

    /// Visit every counter by name.
    pub fn for_each_stat(&self, f: &mut dyn FnMut(&'static str, u64)) {
        self.stats.for_each(f);
    }

    /// Start enforcing `policy`, or replace the policy of a context
    /// already enforced. Connections in progress keep the decision
    /// they were given.
    pub fn enforce(&self, policy: &PuPolicy) {
        let ctx = PuContext::new(policy);
        let id = ctx.id().to_string();
        let verb = match self.contexts.enforce(ctx) {
            Some(_) => "updated",
            None => "enforcing",
        };
        self.log.log(LogLevel::Note, &format!("{verb} context {id}"));
    }

    /// Stop enforcing the context `id` and forget its connections.
    /// Returns false if `id` was not enforced.
    pub fn unenforce(&self, id: &str) -> bool {
        if self.contexts.unenforce(id).is_none() {
            return false;
        }

        for conn in self.tcp.purge_context(id) {
            conn.expire();
        }

        for conn in self.udp.purge_context(id) {
            conn.expire();
            self.retransmits.lock().remove(&conn.id());
        }

        self.log.log(LogLevel::Note, &format!("unenforced context {id}"));
        true
    }

    pub fn context_ids(&self) -> Vec<String> {
        self.contexts.ids()
    }

    /// `(tracker name, entries)` for every tracker.
    pub fn tracker_entries(&self) -> Vec<(String, u32)> {
        let mut out = vec![];
        self.tcp.entries(&mut out);
        self.udp.entries(&mut out);
        out
    }

    pub fn process_application_packet(
        &self,
        buf: &[u8],
        mark: u32,
    ) -> Result<ProcessResult, ProcessError> {
        self.process(Direction::Out, buf, mark)
    }

    pub fn process_network_packet(
        &self,
        buf: &[u8],
        mark: u32,
    ) -> Result<ProcessResult, ProcessError> {
        self.process(Direction::In, buf, mark)
    }

    /// Process one intercepted IPv4 packet.
    ///
    /// Packets of other transport protocols are passed through.
    /// Malformed packets are an error, and an error means drop.
    pub fn process(
        &self,
        dir: Direction,
        buf: &[u8],
        mark: u32,
    ) -> Result<ProcessResult, ProcessError> {
        let pkt = match Packet::parse(buf.to_vec(), dir) {
            Ok(pkt) => pkt.with_mark(mark),

            Err(ParseError::UnsupportedProtocol(_)) => {
                self.stats.other_proto.incr(1);
                return Ok(ProcessResult::Bypass);
            }

            Err(e) => {
                self.stats.parse_err.incr(1);
                self.log.log(LogLevel::Debug, &format!("{dir} parse error: {e}"));
                return Err(e.into());
            }
        };

        let trace = self.cfg.packet_tracing.then(|| PacketReport {
            dir,
            flow: pkt.flow(),
            tcp_flags: match pkt.proto() {
                Protocol::TCP => pkt.tcp_flags().to_string(),
                _ => String::new(),
            },
            mark,
            length: pkt.len(),
            stage: PacketStage::Incoming,
            dropped: false,
            error: None,
        });

        let proto = pkt.proto();
        let flow = pkt.flow();
        let res = self.dispatch(pkt);
        self.count(dir, proto, &res);

        if let Err(e) = &res {
            self.log.log(LogLevel::Debug, &format!("{dir} {flow} dropped: {e}"));
        }

        if let Some(mut report) = trace {
            match &res {
                Ok(ProcessResult::Drop { .. }) => {
                    report.stage = PacketStage::Auth;
                    report.dropped = true;
                }
                Ok(_) => report.stage = PacketStage::Outgoing,
                Err(e) => {
                    if let ProcessError::Processor(_) = e {
                        report.stage = PacketStage::Service;
                    }
                    report.dropped = true;
                    report.error = Some(e.to_string());
                }
            }
            self.collector.collect_packet_event(report);
        }

        res
    }

    fn dispatch(&self, pkt: Packet) -> Result<ProcessResult, ProcessError> {
        if let Err(e) = self.processor.pre_process(&pkt) {
            self.stats.service_pre_drop.incr(1);
            return Err(ProcessError::Processor(e));
        }

        match (pkt.proto(), pkt.dir()) {
            (Protocol::TCP, Direction::Out) => self.process_app_tcp(pkt),
            (Protocol::TCP, Direction::In) => self.process_net_tcp(pkt),
            (Protocol::UDP, Direction::Out) => self.process_app_udp(pkt),
            (Protocol::UDP, Direction::In) => self.process_net_udp(pkt),
            _ => Ok(ProcessResult::Bypass),
        }
    }

    fn count(
        &self,
        dir: Direction,
        proto: Protocol,
        res: &Result<ProcessResult, ProcessError>,
    ) {
        let s = &self.stats;
        let (pkts_in, pkts_out, pkts_drop) = match (dir, proto) {
            (Direction::Out, Protocol::TCP) => {
                (&s.app_tcp_in, &s.app_tcp_out, &s.app_tcp_drop)
            }
            (Direction::In, Protocol::TCP) => {
                (&s.net_tcp_in, &s.net_tcp_out, &s.net_tcp_drop)
            }
            (Direction::Out, _) => {
                (&s.app_udp_in, &s.app_udp_out, &s.app_udp_drop)
            }
            (Direction::In, _) => {
                (&s.net_udp_in, &s.net_udp_out, &s.net_udp_drop)
            }
        };

        pkts_in.incr(1);
        match res {
            Ok(r) if r.verdict() == Verdict::Accept => pkts_out.incr(1),
            _ => pkts_drop.incr(1),
        }
    }

    /// The context owning the local end of `pkt`.
    fn resolve_context(&self, pkt: &Packet) -> Option<Arc<PuContext>> {
        let (ip, port) = pkt.flow().local_endpoint(pkt.dir());
        self.contexts.resolve(pkt.mark(), ip, port)
    }

    /// Hand an accepted packet back, through the post-process hook.
    fn accept(
        &self,
        mut pkt: Packet,
        modified: bool,
    ) -> Result<ProcessResult, ProcessError> {
        let changed = self.processor.post_process(&mut pkt).map_err(|e| {
            self.stats.service_post_drop.incr(1);
            ProcessError::Processor(e)
        })?;

        if modified || changed {
            pkt.update_checksums();
            Ok(ProcessResult::Modified(pkt))
        } else {
            Ok(ProcessResult::Bypass)
        }
    }

    fn drop_pkt(reason: DropReason) -> Result<ProcessResult, ProcessError> {
        Ok(ProcessResult::Drop { reason })
    }

    fn write_packet(&self, pkt: &[u8], mark: u32) -> Result<(), WriteError> {
        self.writer.write_packet(pkt, mark)
    }

    fn report_flow(&self, rec: FlowRecord) {
        match rec.action {
            FlowAction::Accept => self.stats.flows_accepted.incr(1),
            FlowAction::Reject => {
                self.stats.flows_rejected.incr(1);
                self.handshake_reject_probe(rec.flow, rec.reason);
            }
        }
        self.log.log(LogLevel::Debug, &rec.to_string());
        self.collector.collect_flow_event(rec);
    }

    /// Log a token that failed verification and turn it into a
    /// verdict.
    fn token_reject(
        &self,
        flow: FlowId,
        reason: RejectReason,
        err: TokenError,
    ) -> HandshakeError {
        self.log.log(LogLevel::Debug, &format!("{flow} {reason}: {err}"));
        HandshakeError::Reject(reason)
    }

    /// Run expiry: every connection idle past its TTL is removed.
    pub fn expire_at(&self, now: Moment) {
        for conn in self.tcp.expire_at(now) {
            let state = conn.state();
            if let Some(died) = conn.expire() {
                self.count_expired(died);
                self.conn_expired_probe("tcp", conn.flow(), &state.to_string());
            }
        }

        for conn in self.udp.expire_at(now) {
            let state = conn.state();
            if let Some(died) = conn.expire() {
                self.count_expired(died);
                self.conn_expired_probe("udp", conn.flow(), &state.to_string());
            }
            self.retransmits.lock().remove(&conn.id());
        }
    }

    fn count_expired(&self, died: ExpiredIn) {
        match died {
            ExpiredIn::Handshake => self.stats.expired_in_handshake.incr(1),
            ExpiredIn::Established => self.stats.expired_established.incr(1),
        }
    }

    fn register_retransmit(&self, conn: &Arc<UdpConnection>) {
        self.retransmits.lock().insert(conn.id(), Arc::downgrade(conn));
    }

    /// Resend every UDP handshake packet that went unanswered for the
    /// retransmit interval. A handshake out of attempts is torn down.
    pub fn retransmit_at(&self, now: Moment) {
        let pending: Vec<(u64, Weak<UdpConnection>)> = self
            .retransmits
            .lock()
            .iter()
            .map(|(id, w)| (*id, w.clone()))
            .collect();

        let interval = self.cfg.retransmit_interval();
        let mut done = vec![];

        for (id, weak) in pending {
            let Some(conn) = weak.upgrade() else {
                done.push(id);
                continue;
            };

            let mut st = conn.lock();
            match st.check_retransmit(now, interval) {
                RetransmitDue::NotYet => {
                    if !st.retransmit_pending() {
                        done.push(id);
                    }
                }

                RetransmitDue::Send { packet, mark } => {
                    drop(st);
                    self.stats.udp_retransmits.incr(1);
                    self.stats.udp_handshake_sent.incr(1);
                    if let Err(e) = self.write_packet(&packet, mark) {
                        self.log.log(
                            LogLevel::Warn,
                            &format!("{} retransmit failed: {e}", conn.flow()),
                        );
                    }
                }

                RetransmitDue::Exhausted => {
                    let state = st.state();
                    let dropped = st.drop_queue();
                    st.set_state(UdpState::Rst);
                    drop(st);

                    self.udp.forget(&conn, conn.flow());
                    self.stats.udp_handshake_timeout.incr(1);
                    self.log.log(
                        LogLevel::Note,
                        &format!(
                            "{} handshake timed out in {state}, \
                             {dropped} queued packets dropped",
                            conn.flow()
                        ),
                    );
                    done.push(id);
                }
            }
        }

        if !done.is_empty() {
            let mut reg = self.retransmits.lock();
            for id in done {
                reg.remove(&id);
            }
        }
    }

    /// The number of UDP connections with a handshake packet awaiting
    /// an answer.
    pub fn pending_retransmits(&self) -> usize {
        self.retransmits.lock().len()
    }

    /// Start the background thread running expiry and retransmission
    /// every expiry interval.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let weak = Arc::downgrade(self);
        let periodic = Periodic::spawn(
            "trireme-maintenance",
            self.cfg.expiry_interval(),
            move |now| {
                if let Some(dp) = weak.upgrade() {
                    dp.expire_at(now);
                    dp.retransmit_at(now);
                }
            },
        )?;

        if let Some(old) = self.maintenance.lock().replace(periodic) {
            old.stop();
        }
        Ok(())
    }

    pub fn stop(&self) {
        let periodic = self.maintenance.lock().take();
        if let Some(p) = periodic {
            p.stop();
        }
    }

    /// Drop all connection state, for every context.
    pub fn clear(&self) {
        self.tcp.clear();
        self.udp.clear();
        self.retransmits.lock().clear();
    }

    fn tcp_state_probe(
        &self,
        dir: Direction,
        flow: FlowId,
        prev: TcpState,
        next: TcpState,
    ) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let flow_s = flow.to_string();
                let prev_s = prev.to_string();
                let next_s = next.to_string();
                crate::trireme_provider::tcp__flow__state!(
                    || (dir, flow_s, prev_s, next_s)
                );
            } else {
                let (..) = (dir, flow, prev, next);
            }
        }
    }

    fn udp_state_probe(
        &self,
        dir: Direction,
        flow: FlowId,
        prev: UdpState,
        next: UdpState,
    ) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let flow_s = flow.to_string();
                let prev_s = prev.to_string();
                let next_s = next.to_string();
                crate::trireme_provider::udp__flow__state!(
                    || (dir, flow_s, prev_s, next_s)
                );
            } else {
                let (..) = (dir, flow, prev, next);
            }
        }
    }

    fn conn_expired_probe(&self, tracker: &str, flow: FlowId, state: &str) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let flow_s = flow.to_string();
                crate::trireme_provider::conn__expired!(
                    || (tracker, flow_s, state)
                );
            } else {
                let (..) = (tracker, flow, state);
            }
        }
    }

    fn handshake_reject_probe(&self, flow: FlowId, reason: Option<RejectReason>) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let flow_s = flow.to_string();
                let reason_s = reason.map(|r| r.to_string()).unwrap_or_default();
                crate::trireme_provider::handshake__reject!(
                    || (Direction::In, flow_s, reason_s)
                );
            } else {
                let (..) = (flow, reason);
            }
        }
    }
}

impl Drop for Datapath {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `(source, destination)` context IDs of a flow record.
type Peers<'a> = (&'a str, &'a str);

/// `(report, policy)`: the observed and the enforced decision.
type Decision<'a> = (Option<&'a FlowPolicy>, Option<&'a FlowPolicy>);

fn flow_record(
    flow: FlowId,
    ctx: &str,
    (source, destination): Peers<'_>,
    action: FlowAction,
    reason: Option<RejectReason>,
    (report, policy): Decision<'_>,
) -> FlowRecord {
    let observed = match (report, policy) {
        (Some(r), Some(p)) if r != p => Some(r.clone()),
        _ => None,
    };

    FlowRecord {
        flow,
        source_id: source.to_string(),
        destination_id: destination.to_string(),
        context_id: ctx.to_string(),
        action,
        reason,
        policy: policy.cloned(),
        observed,
        count: 1,
    }
}

/// The context ID learned from the peer, or the placeholder when the
/// peer never identified itself.
fn remote_id(id: &Option<String>) -> &str {
    id.as_deref().unwrap_or(DEFAULT_ENDPOINT)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Protocol;
    use crate::api::PuPolicy;
    use crate::engine::collector::NullCollector;
    use crate::engine::secrets::PskSecrets;
    use crate::engine::writer::NullWriter;
    use core::net::Ipv4Addr;
    use core::time::Duration;

    const LATER: Duration = Duration::from_secs(3600);

    // 10.0.0.1:40000 -> 10.0.0.2:80, SYN, seq 1000.
    #[rustfmt::skip]
    const SYN: [u8; 40] = [
        0x45, 0x00, 0x00, 0x28, 0x00, 0x01, 0x40, 0x00,
        0x40, 0x06, 0x00, 0x00, 10, 0, 0, 1, 10, 0, 0, 2,
        0x9c, 0x40, 0x00, 0x50, 0x00, 0x00, 0x03, 0xe8,
        0x00, 0x00, 0x00, 0x00, 0x50, 0x02, 0xff, 0xff,
        0x00, 0x00, 0x00, 0x00,
    ];

    fn flow(port: u16) -> FlowId {
        FlowId {
            proto: Protocol::TCP,
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            src_port: port,
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            dst_port: 80,
        }
    }

    fn datapath(cfg: DatapathConfig) -> Datapath {
        let dp = Datapath::new(
            cfg,
            Arc::new(PskSecrets::new(b"test-secret").unwrap()),
            Arc::new(NullCollector),
            Arc::new(NullWriter),
            Providers::silent(),
        )
        .unwrap();
        dp.enforce(&PuPolicy {
            management_id: "web".into(),
            ips: vec![Ipv4Addr::new(10, 0, 0, 1)],
            ..Default::default()
        });
        dp
    }

    fn conn(port: u16, ctx: &str) -> Arc<TcpConnection> {
        Arc::new(TcpConnection::new(flow(port), ctx))
    }

    #[test]
    fn expiry_waits_for_the_worker() {
        let dp = datapath(DatapathConfig::default());
        let c = conn(40000, "web");
        dp.tcp.app_orig.add_or_update(flow(40000), c.clone()).unwrap();

        // A worker still has the connection when its entry goes.
        dp.expire_at(Moment::now() + LATER);
        assert_eq!(dp.tcp.app_orig.num_entries(), 0);
        assert_eq!(dp.stats().expired_in_handshake, 0);

        drop(c);
        dp.expire_at(Moment::now());
        assert_eq!(dp.stats().expired_in_handshake, 1);
        assert!(dp.tcp.held.lock().is_empty());
    }

    #[test]
    fn retracked_connection_is_not_reaped() {
        let dp = datapath(DatapathConfig::default());
        let t = &dp.tcp;
        let c = conn(40000, "web");
        t.app_orig.add_or_update(flow(40000), c.clone()).unwrap();
        assert!(t.expire_at(Moment::now() + LATER).is_empty());

        // The worker tracks it again before letting go.
        t.net_reply.add_or_update(flow(40000).mirror(), c.clone()).unwrap();
        drop(c);
        assert!(t.expire_at(Moment::now()).is_empty());
        assert!(t.held.lock().is_empty());

        let dead = t.expire_at(Moment::now() + LATER);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].flow(), flow(40000));
    }

    #[test]
    fn purge_skips_held_connections_of_other_contexts() {
        let dp = datapath(DatapathConfig::default());
        let t = &dp.tcp;
        let c = conn(40000, "web");
        t.app_orig.add_or_update(flow(40000), c.clone()).unwrap();
        assert!(t.expire_at(Moment::now() + LATER).is_empty());
        drop(c);

        assert!(t.purge_context("db").is_empty());
        assert_eq!(t.purge_context("web").len(), 1);
    }

    #[test]
    fn syn_without_source_port_room_leaves_nothing() {
        let cfg = DatapathConfig { max_connections: 1, ..Default::default() };
        let dp = datapath(cfg);
        dp.tcp
            .source_port
            .add_or_update(flow(1).source_port_key(Direction::Out), conn(1, "web"))
            .unwrap();

        assert!(matches!(
            dp.process_application_packet(&SYN, 0),
            Err(ProcessError::Tracker(TrackerError::MaxCapacity { .. }))
        ));
        assert_eq!(dp.tcp.app_orig.num_entries(), 0);
        assert!(!dp.tcp.source_port.contains(&flow(40000).source_port_key(Direction::Out)));
    }
}
