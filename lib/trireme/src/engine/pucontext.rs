// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Processing unit contexts.
//!
//! A [`PuContext`] is the compiled form of a [`PuPolicy`]: identity
//! tags plus accept/reject rule tables for the transmit and receive
//! directions. Contexts are immutable; a policy update builds a new
//! context and swaps it into the [`ContextStore`], so a packet
//! handler holding an `Arc<PuContext>` never sees a partial update.

use super::policy::PolicyDb;
use super::tags::TagStore;
use crate::api::ActionType;
use crate::api::FlowPolicy;
use crate::api::PuPolicy;
use crate::api::TagSelector;
use crate::sync::KRwLock;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::net::Ipv4Addr;

/// The four tables of one direction. Observe tables only decide what
/// is reported.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    accept: PolicyDb,
    reject: PolicyDb,
    observe_accept: PolicyDb,
    observe_reject: PolicyDb,
}

impl RuleSet {
    fn new(rules: &[TagSelector]) -> Self {
        let mut set = Self::default();
        for rule in rules {
            let action = rule.policy.action;
            let observe = rule.policy.observe;

            let (enforce, observe_db) = if action.contains(ActionType::REJECT) {
                (&mut set.reject, &mut set.observe_reject)
            } else if action.contains(ActionType::ACCEPT) {
                (&mut set.accept, &mut set.observe_accept)
            } else {
                continue;
            };

            if observe.enforced() {
                enforce.add_rule(rule);
            }

            if observe.observed() {
                observe_db.add_rule(rule);
            }
        }
        set
    }

    /// Returns `(report, packet)`: the decision reported for the flow
    /// and the one enforced on the packet. `permissive` picks the
    /// decision when nothing matches.
    fn search(&self, tags: &TagStore, permissive: bool) -> (FlowPolicy, FlowPolicy) {
        let mut report = self.observe_reject.search(tags).cloned();

        if let Some(p) = self.reject.search(tags) {
            return (report.unwrap_or_else(|| p.clone()), p.clone());
        }

        if report.is_none() {
            report = self.observe_accept.search(tags).cloned();
        }

        let packet = match self.accept.search(tags) {
            Some(p) => p.clone(),
            None if permissive => FlowPolicy::default_accept(),
            None => FlowPolicy::default_reject(),
        };

        (report.unwrap_or_else(|| packet.clone()), packet)
    }

    pub fn is_empty(&self) -> bool {
        self.accept.is_empty()
            && self.reject.is_empty()
            && self.observe_accept.is_empty()
            && self.observe_reject.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct PuContext {
    id: String,
    identity: TagStore,
    annotations: TagStore,
    compressed_tags: TagStore,
    txt: RuleSet,
    rcv: RuleSet,
    ips: Vec<Ipv4Addr>,
    marks: Vec<u32>,
    ports: Vec<u16>,
}

impl PuContext {
    pub fn new(policy: &PuPolicy) -> Self {
        Self {
            id: policy.management_id.clone(),
            identity: TagStore::from(policy.identity.clone()),
            annotations: TagStore::from(policy.annotations.clone()),
            compressed_tags: TagStore::from(policy.compressed_tags.clone()),
            txt: RuleSet::new(&policy.transmitter_rules),
            rcv: RuleSet::new(&policy.receiver_rules),
            ips: policy.ips.clone(),
            marks: policy.marks.clone(),
            ports: policy.ports.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &TagStore {
        &self.identity
    }

    pub fn annotations(&self) -> &TagStore {
        &self.annotations
    }

    pub fn compressed_tags(&self) -> &TagStore {
        &self.compressed_tags
    }

    /// Match the claims of a peer connecting to us. Nothing matching
    /// is a reject.
    pub fn search_rcv_rules(&self, tags: &TagStore) -> (FlowPolicy, FlowPolicy) {
        self.rcv.search(tags, false)
    }

    /// Match the claims of the peer we connected to. With
    /// `mutual_auth` off, only an explicit reject rejects.
    pub fn search_txt_rules(
        &self,
        tags: &TagStore,
        mutual_auth: bool,
    ) -> (FlowPolicy, FlowPolicy) {
        self.txt.search(tags, !mutual_auth)
    }
}

#[derive(Default)]
struct StoreInner {
    contexts: BTreeMap<String, Arc<PuContext>>,
    by_mark: BTreeMap<u32, String>,
    by_ip: BTreeMap<Ipv4Addr, String>,
    by_port: BTreeMap<u16, String>,
}

impl StoreInner {
    fn unindex(&mut self, id: &str) {
        self.by_mark.retain(|_, v| v != id);
        self.by_ip.retain(|_, v| v != id);
        self.by_port.retain(|_, v| v != id);
    }
}

/// All enforced contexts, indexed for per-packet resolution.
#[derive(Default)]
pub struct ContextStore {
    inner: KRwLock<StoreInner>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `ctx`, replacing any context with the same ID. The
    /// previous context is returned.
    pub fn enforce(&self, ctx: PuContext) -> Option<Arc<PuContext>> {
        let id = ctx.id.clone();
        let ctx = Arc::new(ctx);
        let mut inner = self.inner.write();
        inner.unindex(&id);

        for mark in &ctx.marks {
            inner.by_mark.insert(*mark, id.clone());
        }
        for ip in &ctx.ips {
            inner.by_ip.insert(*ip, id.clone());
        }
        for port in &ctx.ports {
            inner.by_port.insert(*port, id.clone());
        }

        inner.contexts.insert(id, ctx)
    }

    pub fn unenforce(&self, id: &str) -> Option<Arc<PuContext>> {
        let mut inner = self.inner.write();
        inner.unindex(id);
        inner.contexts.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<PuContext>> {
        self.inner.read().contexts.get(id).cloned()
    }

    /// Find the context owning a local endpoint: by packet mark, then
    /// by local address, then by local port.
    pub fn resolve(
        &self,
        mark: u32,
        ip: Ipv4Addr,
        port: u16,
    ) -> Option<Arc<PuContext>> {
        let inner = self.inner.read();
        let id = inner
            .by_mark
            .get(&mark)
            .or_else(|| inner.by_ip.get(&ip))
            .or_else(|| inner.by_port.get(&port))?;
        inner.contexts.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().contexts.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.read().contexts.keys().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::KeyValueOperator;
    use crate::api::ObserveAction;

    fn rule(key: &str, val: &str, action: ActionType, id: &str) -> TagSelector {
        TagSelector::new(
            vec![KeyValueOperator::equal(key, &[val])],
            FlowPolicy::new(action, id),
        )
    }

    fn tags(t: &[&str]) -> TagStore {
        TagStore::from(t)
    }

    #[test]
    fn empty_context_denies_both_ways() {
        let ctx = PuContext::new(&PuPolicy::default());
        for t in [tags(&[]), tags(&["app=web"]), tags(&["a", "b=c"])] {
            let (report, packet) = ctx.search_rcv_rules(&t);
            assert!(packet.rejected() && report.rejected());
            assert!(packet.is_default());

            let (_, packet) = ctx.search_txt_rules(&t, true);
            assert!(packet.rejected());
        }
    }

    #[test]
    fn reject_beats_accept() {
        let ctx = PuContext::new(&PuPolicy {
            receiver_rules: vec![
                rule("app", "web", ActionType::ACCEPT, "allow-web"),
                rule("env", "dev", ActionType::REJECT, "no-dev"),
            ],
            ..Default::default()
        });

        let (_, p) = ctx.search_rcv_rules(&tags(&["app=web", "env=prod"]));
        assert_eq!(p.policy_id, "allow-web");
        let (_, p) = ctx.search_rcv_rules(&tags(&["app=web", "env=dev"]));
        assert_eq!(p.policy_id, "no-dev");
        assert!(p.rejected());
    }

    #[test]
    fn mutual_auth_off_accepts_unmatched() {
        let ctx = PuContext::new(&PuPolicy {
            transmitter_rules: vec![rule("app", "bad", ActionType::REJECT, "r")],
            ..Default::default()
        });

        let (_, p) = ctx.search_txt_rules(&tags(&["app=db"]), false);
        assert!(p.accepted());
        let (_, p) = ctx.search_txt_rules(&tags(&["app=db"]), true);
        assert!(p.rejected());
        let (_, p) = ctx.search_txt_rules(&tags(&["app=bad"]), false);
        assert!(p.rejected());
    }

    #[test]
    fn observed_rules_only_report() {
        let mut shadow = rule("app", "web", ActionType::REJECT, "shadow");
        shadow.policy.observe = ObserveAction::Continue;
        let ctx = PuContext::new(&PuPolicy {
            receiver_rules: vec![
                shadow,
                rule("app", "web", ActionType::ACCEPT, "allow"),
            ],
            ..Default::default()
        });

        let (report, packet) = ctx.search_rcv_rules(&tags(&["app=web"]));
        assert_eq!(report.policy_id, "shadow");
        assert_eq!(packet.policy_id, "allow");
        assert!(packet.accepted());
    }

    #[test]
    fn applied_observation_enforces() {
        let mut applied = rule("app", "web", ActionType::REJECT, "applied");
        applied.policy.observe = ObserveAction::Apply;
        let ctx = PuContext::new(&PuPolicy {
            receiver_rules: vec![applied],
            ..Default::default()
        });

        let (report, packet) = ctx.search_rcv_rules(&tags(&["app=web"]));
        assert_eq!(report.policy_id, "applied");
        assert!(packet.rejected());
    }

    #[test]
    fn store_resolution_order() {
        let store = ContextStore::new();
        store.enforce(PuContext::new(&PuPolicy {
            management_id: "by-ip".into(),
            ips: vec!["10.0.0.1".parse().unwrap()],
            ..Default::default()
        }));
        store.enforce(PuContext::new(&PuPolicy {
            management_id: "by-mark".into(),
            marks: vec![100],
            ports: vec![22],
            ..Default::default()
        }));

        let ip = "10.0.0.1".parse().unwrap();
        let other = "10.0.0.9".parse().unwrap();
        assert_eq!(store.resolve(100, ip, 80).unwrap().id(), "by-mark");
        assert_eq!(store.resolve(0, ip, 80).unwrap().id(), "by-ip");
        assert_eq!(store.resolve(0, other, 22).unwrap().id(), "by-mark");
        assert!(store.resolve(0, other, 80).is_none());
    }

    #[test]
    fn enforce_replaces_wholesale() {
        let store = ContextStore::new();
        let policy = |ip: &str| PuPolicy {
            management_id: "pu".into(),
            ips: vec![ip.parse().unwrap()],
            ..Default::default()
        };

        assert!(store.enforce(PuContext::new(&policy("10.0.0.1"))).is_none());
        let held = store.get("pu").unwrap();
        assert!(store.enforce(PuContext::new(&policy("10.0.0.2"))).is_some());

        // Readers keep the context they resolved.
        assert_eq!(held.ips, vec!["10.0.0.1".parse::<Ipv4Addr>().unwrap()]);
        assert!(store.resolve(0, "10.0.0.1".parse().unwrap(), 0).is_none());
        assert!(store.resolve(0, "10.0.0.2".parse().unwrap(), 0).is_some());

        assert!(store.unenforce("pu").is_some());
        assert_eq!(store.len(), 0);
    }
}
