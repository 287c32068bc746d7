// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Types shared between the Trireme datapath engine and its
//! consumers: flow identifiers, policy input, telemetry records and
//! the datapath configuration.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod config;
pub mod flow;
pub mod policy;
pub mod record;

pub use config::*;
pub use flow::*;
pub use policy::*;
pub use record::*;

/// The version of the datapath wire protocol spoken by this build.
///
/// This value is carried in the claims header of every token. Peers
/// currently accept any version; it exists so that a future format
/// change can be detected.
pub const DATAPATH_VERSION: u8 = 1;

/// Where a packet came from.
///
/// `In` packets arrived from the network and are headed to a
/// processing unit. `Out` packets were emitted by a processing unit
/// and are headed to the network.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum Direction {
    In = 1,
    Out = 2,
}

impl Direction {
    pub fn is_network(&self) -> bool {
        *self == Self::In
    }

    pub fn is_application(&self) -> bool {
        *self == Self::Out
    }
}

impl core::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" | "net" | "network" => Ok(Direction::In),
            "out" | "app" | "application" => Ok(Direction::Out),
            _ => Err(format!("invalid direction: {}", s)),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dirstr = match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        };

        write!(f, "{}", dirstr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn direction_parse() {
        assert_eq!("net".parse::<Direction>(), Ok(Direction::In));
        assert_eq!("OUT".parse::<Direction>(), Ok(Direction::Out));
        assert!("sideways".parse::<Direction>().is_err());
        assert!(Direction::In.is_network());
        assert!(Direction::Out.is_application());
    }
}
