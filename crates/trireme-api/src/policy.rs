// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Policy input consumed by the datapath.
//!
//! A [`PuPolicy`] is produced by an external policy resolver for
//! every processing unit (PU) and handed to the datapath when the PU
//! is enforced. The datapath never mutates it; a policy update is a
//! new `PuPolicy`.

use alloc::string::String;
use alloc::string::ToString;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use core::net::Ipv4Addr;
use serde::Deserialize;
use serde::Serialize;

/// The policy ID attached to decisions made without a matching rule.
pub const DEFAULT_POLICY_ID: &str = "default";

bitflags! {
    /// The action of a matched rule.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
    pub struct ActionType: u32 {
        const ACCEPT = 1 << 0;
        const REJECT = 1 << 1;
        const ENCRYPT = 1 << 2;
        const LOG = 1 << 3;
    }
}

impl ActionType {
    pub fn accepted(&self) -> bool {
        self.contains(Self::ACCEPT)
    }

    pub fn rejected(&self) -> bool {
        self.contains(Self::REJECT)
    }
}

impl Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.rejected() {
            write!(f, "reject")
        } else if self.accepted() {
            write!(f, "accept")
        } else {
            write!(f, "none")
        }
    }
}

/// How a rule participates in observation (shadow policy).
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ObserveAction {
    /// A regular enforcing rule.
    #[default]
    None,
    /// Only reported; never changes the verdict.
    Continue,
    /// Reported and enforced.
    Apply,
}

impl ObserveAction {
    pub fn observed(&self) -> bool {
        *self != Self::None
    }

    pub fn enforced(&self) -> bool {
        *self != Self::Continue
    }
}

/// The decision attached to a rule and reported with every flow.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowPolicy {
    pub action: ActionType,
    #[serde(default)]
    pub observe: ObserveAction,
    #[serde(default)]
    pub policy_id: String,
    #[serde(default)]
    pub service_id: String,
}

impl FlowPolicy {
    pub fn new(action: ActionType, policy_id: &str) -> Self {
        Self {
            action,
            observe: ObserveAction::None,
            policy_id: policy_id.to_string(),
            service_id: String::new(),
        }
    }

    /// The decision when no rule matched.
    pub fn default_reject() -> Self {
        Self::new(ActionType::REJECT, DEFAULT_POLICY_ID)
    }

    /// The decision when no rule matched but the lookup is permissive.
    pub fn default_accept() -> Self {
        Self::new(ActionType::ACCEPT, DEFAULT_POLICY_ID)
    }

    pub fn accepted(&self) -> bool {
        self.action.accepted()
    }

    pub fn rejected(&self) -> bool {
        self.action.rejected()
    }

    pub fn is_default(&self) -> bool {
        self.policy_id == DEFAULT_POLICY_ID
    }
}

impl Display for FlowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} policy={}", self.action, self.policy_id)?;
        if !self.service_id.is_empty() {
            write!(f, " service={}", self.service_id)?;
        }
        Ok(())
    }
}

/// The operator of a single tag clause.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// The key has one of the values. A value ending in `*` matches
    /// by prefix.
    Equal,
    /// The key is absent or has none of the values.
    NotEqual,
    KeyExists,
    KeyNotExists,
}

impl Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::KeyExists => "exists",
            Self::KeyNotExists => "!exists",
        };
        write!(f, "{s}")
    }
}

/// One `key <op> values` clause of a [`TagSelector`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyValueOperator {
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
    pub operator: Operator,
}

impl KeyValueOperator {
    pub fn equal(key: &str, values: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
            operator: Operator::Equal,
        }
    }

    pub fn not_equal(key: &str, values: &[&str]) -> Self {
        Self { operator: Operator::NotEqual, ..Self::equal(key, values) }
    }

    pub fn exists(key: &str) -> Self {
        Self {
            key: key.to_string(),
            values: Vec::new(),
            operator: Operator::KeyExists,
        }
    }

    pub fn not_exists(key: &str) -> Self {
        Self { operator: Operator::KeyNotExists, ..Self::exists(key) }
    }
}

impl Display for KeyValueOperator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.operator {
            Operator::KeyExists | Operator::KeyNotExists => {
                write!(f, "{} {}", self.key, self.operator)
            }

            _ => write!(
                f,
                "{} {} [{}]",
                self.key,
                self.operator,
                self.values.join(",")
            ),
        }
    }
}

/// A rule: every clause must hold for the policy to apply.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TagSelector {
    pub clauses: Vec<KeyValueOperator>,
    pub policy: FlowPolicy,
}

impl TagSelector {
    pub fn new(clauses: Vec<KeyValueOperator>, policy: FlowPolicy) -> Self {
        Self { clauses, policy }
    }
}

/// Everything the datapath needs to know about one processing unit.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PuPolicy {
    /// The stable identifier of the PU, carried in tokens as the
    /// source PU identifier.
    pub management_id: String,
    /// Identity tags (`key=value`) sent to peers in claims.
    pub identity: Vec<String>,
    /// Annotation tags; local only, never sent.
    pub annotations: Vec<String>,
    /// Pre-compressed identity tags, sent when tag compression is on.
    pub compressed_tags: Vec<String>,
    /// Rules evaluated against the claims of the peer we connect to.
    pub transmitter_rules: Vec<TagSelector>,
    /// Rules evaluated against the claims of a peer connecting to us.
    pub receiver_rules: Vec<TagSelector>,
    /// Local addresses owned by the PU.
    pub ips: Vec<Ipv4Addr>,
    /// Packet marks identifying traffic of the PU.
    pub marks: Vec<u32>,
    /// Local ports owned by the PU (host services).
    pub ports: Vec<u16>,
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn default_decisions() {
        let rej = FlowPolicy::default_reject();
        assert!(rej.rejected());
        assert!(!rej.accepted());
        assert!(rej.is_default());
        assert_eq!(rej.to_string(), "reject policy=default");

        let acc = FlowPolicy::default_accept();
        assert!(acc.accepted());
    }

    #[test]
    fn clause_display() {
        assert_eq!(
            KeyValueOperator::equal("app", &["web", "api"]).to_string(),
            "app = [web,api]"
        );
        assert_eq!(KeyValueOperator::exists("env").to_string(), "env exists");
    }

    #[test]
    fn observe_flags() {
        assert!(!ObserveAction::None.observed());
        assert!(ObserveAction::None.enforced());
        assert!(ObserveAction::Continue.observed());
        assert!(!ObserveAction::Continue.enforced());
        assert!(ObserveAction::Apply.observed());
        assert!(ObserveAction::Apply.enforced());
    }
}
