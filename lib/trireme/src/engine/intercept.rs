// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The intercept queues.
//!
//! Intercepted packets arrive on numbered queues: the application
//! queues carry packets emitted by the PUs, the network queues those
//! headed to them. Every queue gets one worker thread feeding the
//! [`Datapath`], so packets of one queue are processed in order and
//! the queues run in parallel. Each packet is answered with exactly
//! one [`VerdictMessage`].

use super::datapath::Datapath;
use super::datapath::ProcessResult;
use crate::api::Direction;
use crate::api::Verdict;
use crate::provider::LogLevel;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::TrySendError;
use std::thread;
use std::thread::JoinHandle;

/// The number of packets a queue holds before [`QueueSet::submit`]
/// refuses more.
pub const DEF_QUEUE_DEPTH: usize = 1024;

/// A packet handed over by the intercept subsystem.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueuedPacket {
    /// The intercept subsystem's packet ID, echoed in the verdict.
    pub id: u32,
    pub queue: u16,
    pub mark: u32,
    pub data: Vec<u8>,
}

/// The verdict on one packet. An accepted packet carries the bytes
/// to forward, which differ from the original when the datapath
/// modified it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerdictMessage {
    pub id: u32,
    pub queue: u16,
    pub verdict: Verdict,
    pub mark: u32,
    pub data: Vec<u8>,
}

/// Where verdicts go.
pub trait VerdictSink: Send + Sync {
    fn set_verdict(&self, msg: VerdictMessage);
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InterceptError {
    UnknownQueue(u16),
    QueueFull(u16),
    Closed,
}

impl Display for InterceptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownQueue(q) => write!(f, "no such queue: {q}"),
            Self::QueueFull(q) => write!(f, "queue {q} is full"),
            Self::Closed => write!(f, "queue set is shut down"),
        }
    }
}

impl std::error::Error for InterceptError {}

/// Run one packet through the datapath and build its verdict.
pub fn process_queued(
    dp: &Datapath,
    dir: Direction,
    pkt: QueuedPacket,
) -> VerdictMessage {
    let QueuedPacket { id, queue, mark, data } = pkt;
    let (verdict, data) = match dp.process(dir, &data, mark) {
        Ok(ProcessResult::Bypass) => (Verdict::Accept, data),
        Ok(ProcessResult::Modified(pkt)) => (Verdict::Accept, pkt.into_bytes()),
        Ok(ProcessResult::Drop { .. }) | Err(_) => (Verdict::Drop, data),
    };

    VerdictMessage { id, queue, verdict, mark, data }
}

fn worker(
    dp: Arc<Datapath>,
    dir: Direction,
    rx: Receiver<QueuedPacket>,
    sink: Arc<dyn VerdictSink>,
) {
    // Ends when every sender is gone.
    for pkt in rx.iter() {
        sink.set_verdict(process_queued(&dp, dir, pkt));
    }
}

/// The running workers of every configured queue.
pub struct QueueSet {
    dp: Arc<Datapath>,
    senders: BTreeMap<u16, Sender<QueuedPacket>>,
    workers: Vec<JoinHandle<()>>,
}

impl QueueSet {
    /// Spawn a worker for every application and network queue in the
    /// datapath's configuration.
    pub fn start(
        dp: Arc<Datapath>,
        sink: Arc<dyn VerdictSink>,
        depth: usize,
    ) -> std::io::Result<Self> {
        let cfg = dp.config();
        let queues: Vec<(u16, Direction)> = cfg
            .application_queues
            .iter()
            .map(|q| (*q, Direction::Out))
            .chain(cfg.network_queues.iter().map(|q| (*q, Direction::In)))
            .collect();

        let mut set =
            Self { dp: dp.clone(), senders: BTreeMap::new(), workers: vec![] };
        for (queue, dir) in queues {
            let (tx, rx) = crossbeam_channel::bounded(depth.max(1));
            let name = match dir {
                Direction::Out => format!("trireme-app-q{queue}"),
                Direction::In => format!("trireme-net-q{queue}"),
            };

            let dp = dp.clone();
            let sink = sink.clone();
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker(dp, dir, rx, sink))?;

            set.senders.insert(queue, tx);
            set.workers.push(handle);
        }

        Ok(set)
    }

    /// Hand `pkt` to the worker of its queue without blocking.
    pub fn submit(&self, pkt: QueuedPacket) -> Result<(), InterceptError> {
        let queue = pkt.queue;
        let tx = self
            .senders
            .get(&queue)
            .ok_or(InterceptError::UnknownQueue(queue))?;

        tx.try_send(pkt).map_err(|e| match e {
            TrySendError::Full(_) => InterceptError::QueueFull(queue),
            TrySendError::Disconnected(_) => InterceptError::Closed,
        })
    }

    pub fn queues(&self) -> Vec<u16> {
        self.senders.keys().copied().collect()
    }

    /// Close every queue and wait for the workers to drain them.
    /// Returns the number of workers that panicked.
    pub fn shutdown(mut self) -> usize {
        self.close()
    }

    fn close(&mut self) -> usize {
        self.senders.clear();
        let mut panicked = 0;
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if let Err(e) = handle.join() {
                let why = e
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| e.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                self.dp.log(LogLevel::Error, &format!("{name} panicked: {why}"));
                panicked += 1;
            }
        }
        panicked
    }
}

impl Drop for QueueSet {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::DatapathConfig;
    use crate::engine::collector::NullCollector;
    use crate::engine::secrets::PskSecrets;
    use crate::engine::writer::NullWriter;
    use crate::provider::LogProvider;
    use crate::provider::Providers;
    use crate::sync::KMutex;
    use core::time::Duration;

    #[derive(Default)]
    struct Collect(KMutex<Vec<VerdictMessage>>);

    impl VerdictSink for Collect {
        fn set_verdict(&self, msg: VerdictMessage) {
            self.0.lock().push(msg);
        }
    }

    fn datapath() -> Arc<Datapath> {
        let cfg = DatapathConfig {
            application_queues: vec![0],
            network_queues: vec![1],
            ..Default::default()
        };
        let secrets = Arc::new(PskSecrets::new(b"test-secret").unwrap());
        Arc::new(
            Datapath::new(
                cfg,
                secrets,
                Arc::new(NullCollector),
                Arc::new(NullWriter),
                Providers::silent(),
            )
            .unwrap(),
        )
    }

    // 10.0.0.1 -> 10.0.0.2, ICMP echo request with no body.
    #[rustfmt::skip]
    const ICMP: [u8; 28] = [
        0x45, 0x00, 0x00, 0x1c, 0x00, 0x01, 0x00, 0x00,
        0x40, 0x01, 0x00, 0x00, 10, 0, 0, 1, 10, 0, 0, 2,
        0x08, 0x00, 0xf7, 0xff, 0x00, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn every_packet_gets_one_verdict() {
        let sink = Arc::new(Collect::default());
        let set = QueueSet::start(datapath(), sink.clone(), 16).unwrap();
        assert_eq!(set.queues(), vec![0, 1]);

        set.submit(QueuedPacket { id: 1, queue: 1, mark: 0, data: ICMP.to_vec() })
            .unwrap();
        set.submit(QueuedPacket { id: 2, queue: 0, mark: 7, data: vec![0x45, 0] })
            .unwrap();
        assert_eq!(
            set.submit(QueuedPacket { id: 3, queue: 9, mark: 0, data: vec![] }),
            Err(InterceptError::UnknownQueue(9))
        );

        set.shutdown();

        let mut got = sink.0.lock().clone();
        got.sort_by_key(|m| m.id);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].verdict, Verdict::Accept);
        assert_eq!(got[0].data, ICMP.to_vec());
        assert_eq!(got[1].verdict, Verdict::Drop);
        assert_eq!(got[1].mark, 7);
    }

    #[test]
    fn full_queue_refuses() {
        struct Slow;
        impl VerdictSink for Slow {
            fn set_verdict(&self, _msg: VerdictMessage) {
                thread::sleep(Duration::from_millis(50));
            }
        }

        let set = QueueSet::start(datapath(), Arc::new(Slow), 1).unwrap();
        let pkt = |id| QueuedPacket { id, queue: 0, mark: 0, data: ICMP.to_vec() };

        let refused = (0..10)
            .map(|id| set.submit(pkt(id)))
            .filter(|r| *r == Err(InterceptError::QueueFull(0)))
            .count();
        assert!(refused > 0);
    }

    #[derive(Clone, Default)]
    struct Lines(Arc<KMutex<Vec<String>>>);

    impl LogProvider for Lines {
        fn log(&self, level: LogLevel, msg: &str) {
            self.0.lock().push(format!("{level} {msg}"));
        }
    }

    #[test]
    fn worker_panic_is_logged() {
        struct Broken;
        impl VerdictSink for Broken {
            fn set_verdict(&self, _msg: VerdictMessage) {
                panic!("sink gone");
            }
        }

        let lines = Lines::default();
        let cfg = DatapathConfig {
            application_queues: vec![0],
            network_queues: vec![1],
            ..Default::default()
        };
        let dp = Datapath::new(
            cfg,
            Arc::new(PskSecrets::new(b"test-secret").unwrap()),
            Arc::new(NullCollector),
            Arc::new(NullWriter),
            Providers { log: Box::new(lines.clone()) },
        )
        .unwrap();

        let set = QueueSet::start(Arc::new(dp), Arc::new(Broken), 4).unwrap();
        set.submit(QueuedPacket { id: 1, queue: 0, mark: 0, data: ICMP.to_vec() })
            .unwrap();
        assert_eq!(set.shutdown(), 1);

        let lines = lines.0.lock();
        assert!(
            lines.iter().any(|l| l == "[ERROR] trireme-app-q0 panicked: sink gone"),
            "{lines:?}"
        );
    }
}
