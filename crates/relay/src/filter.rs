//! Subscription filters in relay wire form.

use serde::{Deserialize, Serialize};

use tenex_domain::event::Event;

/// One relay subscription filter. Conditions are AND-ed; list entries
/// within a condition are OR-ed, matching relay query semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub authors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub kinds: Vec<u16>,
    #[serde(rename = "#e", skip_serializing_if = "Vec::is_empty", default)]
    pub e_tags: Vec<String>,
    #[serde(rename = "#p", skip_serializing_if = "Vec::is_empty", default)]
    pub p_tags: Vec<String>,
    #[serde(rename = "#a", skip_serializing_if = "Vec::is_empty", default)]
    pub a_tags: Vec<String>,
    #[serde(rename = "#K", skip_serializing_if = "Vec::is_empty", default)]
    pub k_tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<u32>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn authors<I: IntoIterator<Item = S>, S: Into<String>>(mut self, authors: I) -> Self {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn kinds<I: IntoIterator<Item = u16>>(mut self, kinds: I) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn e_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.e_tags = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn p_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.p_tags = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn a_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.a_tags = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn k_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.k_tags = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Local evaluation of the filter, mirroring relay-side matching.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| *id == event.id) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.iter().any(|a| *a == event.pubkey) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        let tag_match = |label: &str, wanted: &[String]| {
            wanted.is_empty()
                || event
                    .tag_values(label)
                    .any(|v| wanted.iter().any(|w| w == v))
        };
        tag_match("e", &self.e_tags)
            && tag_match("p", &self.p_tags)
            && tag_match("a", &self.a_tags)
            && tag_match("K", &self.k_tags)
    }
}
