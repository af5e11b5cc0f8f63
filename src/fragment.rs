// SPDX-License-Identifier: AGPL-3.0-or-later
//! Published configuration fragments
//!
//! A fragment is one tagged assertion a node exports into the catalog. It is
//! keyed by `(kind, title)` and never changes after it has been built; a new
//! value for the same key is a new fragment that replaces the old one.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{RelayError, Result};

/// Attribute names whose values must never reach logs or terminal output
pub const SECRET_ATTRIBUTES: &[&str] = &["secret"];

/// Attribute map; `None` means "explicitly unset"
pub type Attributes = BTreeMap<String, Option<String>>;

/// Kinds of resources a node can export
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FragmentKind {
    /// A database server the backup host must register
    ServerBinding,
    /// A periodic backup job
    ScheduleEntry,
    /// A credentials-file line for the backup user
    CredentialLine,
    /// An SSH public key the receiving side must trust
    TrustedKey,
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FragmentKind::ServerBinding => write!(formatter, "ServerBinding"),
            FragmentKind::ScheduleEntry => write!(formatter, "ScheduleEntry"),
            FragmentKind::CredentialLine => write!(formatter, "CredentialLine"),
            FragmentKind::TrustedKey => write!(formatter, "TrustedKey"),
        }
    }
}

/// Catalog key of a fragment
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragmentKey {
    pub kind: FragmentKind,
    pub title: String,
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}[{}]", self.kind, self.title)
    }
}

/// An immutable, tagged configuration assertion
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FragmentRepr")]
pub struct Fragment {
    kind: FragmentKind,
    title: String,
    origin: String,
    tags: BTreeSet<String>,
    attributes: Attributes,
}

impl Fragment {
    /// Start building a fragment published by `origin`
    pub fn builder(
        kind: FragmentKind,
        title: impl Into<String>,
        origin: impl Into<String>,
    ) -> FragmentBuilder {
        FragmentBuilder {
            kind,
            title: title.into(),
            origin: origin.into(),
            tags: BTreeSet::new(),
            attributes: Attributes::new(),
        }
    }

    pub fn kind(&self) -> FragmentKind {
        self.kind
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn key(&self) -> FragmentKey {
        FragmentKey {
            kind: self.kind,
            title: self.title.clone(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Value of a set attribute; absent and unset both yield `None`
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|value| value.as_deref())
    }

    /// Attributes with secret values masked, for logs and listings
    pub fn redacted_attributes(&self) -> Attributes {
        redact(&self.attributes)
    }
}

impl fmt::Debug for Fragment {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Fragment")
            .field("kind", &self.kind)
            .field("title", &self.title)
            .field("origin", &self.origin)
            .field("tags", &self.tags)
            .field("attributes", &self.redacted_attributes())
            .finish()
    }
}

/// Mask secret attribute values
pub fn redact(attributes: &Attributes) -> Attributes {
    attributes
        .iter()
        .map(|(name, value)| {
            if SECRET_ATTRIBUTES.contains(&name.as_str()) && value.is_some() {
                (name.clone(), Some("********".to_string()))
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

/// Builder for [`Fragment`]
pub struct FragmentBuilder {
    kind: FragmentKind,
    title: String,
    origin: String,
    tags: BTreeSet<String>,
    attributes: Attributes,
}

impl FragmentBuilder {
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), Some(value.into()));
        self
    }

    /// Record an attribute that may be explicitly unset
    pub fn maybe_attr(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Finish the fragment; fails when no tag was given
    pub fn build(self) -> Result<Fragment> {
        if self.tags.is_empty() {
            return Err(RelayError::UntaggedFragment {
                kind: self.kind,
                title: self.title,
            });
        }

        Ok(Fragment {
            kind: self.kind,
            title: self.title,
            origin: self.origin,
            tags: self.tags,
            attributes: self.attributes,
        })
    }
}

// Serialized form; goes through the builder so stored fragments obey the same invariants
#[derive(Deserialize)]
struct FragmentRepr {
    kind: FragmentKind,
    title: String,
    origin: String,
    tags: BTreeSet<String>,
    #[serde(default)]
    attributes: Attributes,
}

impl TryFrom<FragmentRepr> for Fragment {
    type Error = RelayError;

    fn try_from(repr: FragmentRepr) -> Result<Self> {
        let mut builder = Fragment::builder(repr.kind, repr.title, repr.origin);
        builder.tags = repr.tags;
        builder.attributes = repr.attributes;
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Fragment {
        Fragment::builder(FragmentKind::CredentialLine, "pgpass-pg1", "pg1")
            .tag("barman-db")
            .attr("host", "pg1")
            .attr("secret", "hunter2")
            .maybe_attr("comment", None)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_tag() {
        let result = Fragment::builder(FragmentKind::ServerBinding, "pg1", "pg1").build();
        assert!(matches!(result, Err(RelayError::UntaggedFragment { .. })));
    }

    #[test]
    fn test_attribute_lookup() {
        let fragment = credential();
        assert_eq!(fragment.attribute("host"), Some("pg1"));
        assert_eq!(fragment.attribute("comment"), None);
        assert!(fragment.attributes().contains_key("comment"));
        assert_eq!(fragment.attribute("missing"), None);
    }

    #[test]
    fn test_debug_hides_secret() {
        let rendered = format!("{:?}", credential());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("********"));
    }

    #[test]
    fn test_deserialize_rejects_empty_tags() {
        let json = r#"{"kind":"TrustedKey","title":"k","origin":"pg1","tags":[],"attributes":{}}"#;
        assert!(serde_json::from_str::<Fragment>(json).is_err());
    }

    #[test]
    fn test_serde_keeps_unset_attributes() {
        let fragment = credential();
        let json = serde_json::to_string(&fragment).unwrap();
        let back: Fragment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fragment);
        assert_eq!(back.attributes().get("comment"), Some(&None));
    }
}
