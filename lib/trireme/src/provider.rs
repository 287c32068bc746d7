// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Providers allow the datapath to run in different contexts by
//! allowing implementations of core services to be plugged into the
//! engine. Logging is the only provider today: the admin tool routes
//! it into its structured logger while unit tests print to stdout.
//! If a service doesn't have at least two obvious implementations,
//! then it probably doesn't need to be a provider.

use core::fmt;
use core::fmt::Display;

/// The set of all platform-specific providers required by a datapath.
pub struct Providers {
    pub log: Box<dyn LogProvider>,
}

impl Providers {
    pub fn println() -> Self {
        Self { log: Box::new(PrintlnLog) }
    }

    pub fn silent() -> Self {
        Self { log: Box::new(NullLog) }
    }
}

/// A logging provider provides the means to log messages to some
/// destination based on the context in which the datapath is running.
///
/// Logging levels are provided by [`LogLevel`]. These levels will map
/// to the underlying provider with varying degrees of success.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Debug,
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Debug => "[DEBUG]",
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{level_s}")
    }
}

#[derive(Clone, Copy)]
pub struct PrintlnLog;

impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("{level} {msg}");
    }
}

/// Discards everything.
#[derive(Clone, Copy)]
pub struct NullLog;

impl LogProvider for NullLog {
    fn log(&self, _level: LogLevel, _msg: &str) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    struct Capture(Arc<Mutex<Vec<String>>>);

    impl LogProvider for Capture {
        fn log(&self, level: LogLevel, msg: &str) {
            self.0.lock().unwrap().push(format!("{level} {msg}"));
        }
    }

    #[test]
    fn levels_render_and_order() {
        let lines = Arc::new(Mutex::new(vec![]));
        let p = Providers { log: Box::new(Capture(lines.clone())) };
        p.log.log(LogLevel::Warn, "tracker full");
        assert_eq!(lines.lock().unwrap()[0], "[WARN] tracker full");
        assert!(LogLevel::Debug < LogLevel::Note);
        assert!(LogLevel::Warn < LogLevel::Error);
    }
}
