// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments, periodics, etc.

use core::ops::Add;
use core::time::Duration;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use std::io;
use std::thread;
use std::thread::JoinHandle;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;
/// The number of nanoseconds in a second.
pub const NANOS: u64 = 1_000_000_000;
/// The conversion from nanoseconds to milliseconds.
pub const NANOS_TO_MILLIS: u64 = NANOS / MILLIS;

/// A moment in time, from a monotonic clock.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment {
    inner: Instant,
}

impl Add<Duration> for Moment {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Moment { inner: self.inner + rhs }
    }
}

impl Moment {
    /// Compute the delta between `self - earlier` and return as
    /// milliseconds. A moment before `earlier` yields zero.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        let delta = self.inner.saturating_duration_since(earlier.inner);
        delta.as_secs() * MILLIS + u64::from(delta.subsec_millis())
    }

    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }
}

/// Seconds since the Unix epoch, from the wall clock.
///
/// Token expiry is expressed in wall-clock time because it is
/// compared across hosts.
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A background thread that calls a function at a fixed interval
/// until stopped.
pub struct Periodic {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Periodic {
    pub fn spawn<F>(name: &str, interval: Duration, mut f: F) -> io::Result<Self>
    where
        F: FnMut(Moment) + Send + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new().name(name.to_string()).spawn(
            move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => f(Moment::now()),
                    // Either an explicit stop or the owner went away.
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            },
        )?;

        Ok(Self { stop: Some(stop_tx), handle: Some(handle) })
    }

    /// Stop the periodic and wait for an in-progress call to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            // The callback may drop the last owner of the periodic.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    #[test]
    fn moment_delta() {
        let now = Moment::now();
        let later = now + Duration::from_millis(1500);
        assert_eq!(later.delta_as_millis(now), 1500);
        assert_eq!(now.delta_as_millis(later), 0);
    }

    #[test]
    fn periodic_runs_and_stops() {
        let hits = Arc::new(AtomicU32::new(0));
        let h2 = hits.clone();
        let p = Periodic::spawn("test-periodic", Duration::from_millis(5), move |_| {
            h2.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        while hits.load(Ordering::Relaxed) < 2 {
            thread::sleep(Duration::from_millis(5));
        }

        p.stop();
        let after = hits.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::Relaxed), after);
    }
}
