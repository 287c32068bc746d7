// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Identity tags.
//!
//! A tag is a `key=value` string. Tags without `=` are keys with an
//! empty value.

use serde::Deserialize;
use serde::Serialize;

/// The synthetic tag key carrying the destination port of a flow.
pub const PORT_TAG_KEY: &str = "@port";

pub fn split_tag(tag: &str) -> (&str, &str) {
    tag.split_once('=').unwrap_or((tag, ""))
}

/// An ordered list of identity tags.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[serde(transparent)]
pub struct TagStore {
    tags: Vec<String>,
}

impl TagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, tag: &str) {
        self.tags.push(tag.into());
    }

    pub fn append_key_value(&mut self, key: &str, value: &str) {
        self.tags.push(format!("{key}={value}"));
    }

    /// The value of the first tag with `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|t| split_tag(t))
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// A copy of these tags followed by those of `other`.
    pub fn merged(&self, other: &TagStore) -> TagStore {
        let mut tags = self.tags.clone();
        tags.extend(other.tags.iter().cloned());
        Self { tags }
    }
}

impl From<Vec<String>> for TagStore {
    fn from(tags: Vec<String>) -> Self {
        Self { tags }
    }
}

impl From<&[&str]> for TagStore {
    fn from(tags: &[&str]) -> Self {
        Self { tags: tags.iter().map(|t| (*t).into()).collect() }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup() {
        let mut ts = TagStore::from(&["app=web", "env=prod", "debug"][..]);
        ts.append_key_value(PORT_TAG_KEY, "80");
        assert_eq!(ts.get("app"), Some("web"));
        assert_eq!(ts.get("debug"), Some(""));
        assert_eq!(ts.get(PORT_TAG_KEY), Some("80"));
        assert!(!ts.contains_key("team"));
        assert_eq!(ts.len(), 4);
    }

    #[test]
    fn value_may_contain_equals() {
        assert_eq!(split_tag("expr=a=b"), ("expr", "a=b"));
    }
}
