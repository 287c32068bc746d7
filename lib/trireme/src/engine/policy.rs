// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Tag-selector rule tables.
//!
//! A [`PolicyDb`] holds an ordered list of rules, each a conjunction
//! of `key <op> values` clauses. Searching a tag set returns the
//! policy of the most specific matching rule, the one with the most
//! clauses; among equally specific rules the first one added wins.
//!
//! Equality clauses are indexed by key and value so that a search
//! only visits the rules the tags can actually satisfy. Prefix values
//! (`"web*"`) and the other operators are evaluated directly.

use super::tags::TagStore;
use crate::api::FlowPolicy;
use crate::api::KeyValueOperator;
use crate::api::Operator;
use crate::api::TagSelector;
use alloc::collections::BTreeMap;
use itertools::Itertools;

/// The index of a clause: (rule, clause within the rule).
type ClauseRef = (usize, usize);

#[derive(Clone, Debug)]
struct Rule {
    clauses: Vec<KeyValueOperator>,
    policy: FlowPolicy,
    /// Where this rule's clauses start in the flat match vector.
    base: usize,
}

#[derive(Clone, Debug, Default)]
pub struct PolicyDb {
    rules: Vec<Rule>,
    num_clauses: usize,
    equal: BTreeMap<String, BTreeMap<String, Vec<ClauseRef>>>,
    prefix: Vec<(String, String, ClauseRef)>,
}

impl PolicyDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, sel: &TagSelector) {
        let idx = self.rules.len();
        for (c, clause) in sel.clauses.iter().enumerate() {
            if clause.operator != Operator::Equal {
                continue;
            }

            for value in &clause.values {
                match value.strip_suffix('*') {
                    Some(prefix) => self.prefix.push((
                        clause.key.clone(),
                        prefix.into(),
                        (idx, c),
                    )),

                    None => self
                        .equal
                        .entry(clause.key.clone())
                        .or_default()
                        .entry(value.clone())
                        .or_default()
                        .push((idx, c)),
                }
            }
        }

        self.rules.push(Rule {
            clauses: sel.clauses.clone(),
            policy: sel.policy.clone(),
            base: self.num_clauses,
        });
        self.num_clauses += sel.clauses.len();
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The policy of the most specific rule matching `tags`.
    pub fn search(&self, tags: &TagStore) -> Option<&FlowPolicy> {
        if self.rules.is_empty() {
            return None;
        }

        let mut matched = vec![false; self.num_clauses];
        let mut mark = |(r, c): ClauseRef| matched[self.rules[r].base + c] = true;

        for (key, value) in tags.pairs() {
            if let Some(refs) = self.equal.get(key).and_then(|v| v.get(value)) {
                refs.iter().copied().for_each(&mut mark);
            }

            self.prefix
                .iter()
                .filter(|(k, p, _)| k == key && value.starts_with(p.as_str()))
                .for_each(|(_, _, cref)| mark(*cref));
        }

        self.rules
            .iter()
            .filter(|rule| {
                rule.clauses.iter().enumerate().all(|(c, clause)| {
                    clause_holds(clause, matched[rule.base + c], tags)
                })
            })
            // `max_by_key` keeps the last maximum; reverse so the
            // earliest rule wins ties.
            .rev()
            .max_by_key(|rule| rule.clauses.len())
            .map(|rule| &rule.policy)
    }

    /// A printable form of every rule, for diagnostics.
    pub fn describe(&self) -> Vec<String> {
        self.rules
            .iter()
            .map(|r| {
                format!("{} => {}", r.clauses.iter().join(" && "), r.policy)
            })
            .collect()
    }
}

fn clause_holds(clause: &KeyValueOperator, indexed: bool, tags: &TagStore) -> bool {
    match clause.operator {
        Operator::Equal => indexed,

        Operator::NotEqual => !tags.pairs().any(|(k, v)| {
            k == clause.key && clause.values.iter().any(|cv| value_matches(cv, v))
        }),

        Operator::KeyExists => tags.contains_key(&clause.key),

        Operator::KeyNotExists => !tags.contains_key(&clause.key),
    }
}

fn value_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}
