// SPDX-License-Identifier: AGPL-3.0-or-later
//! Catalog of exported fragments
//!
//! The catalog is the only channel between publishing and collecting nodes.
//! It is a map keyed by `(kind, title)` plus a filtered scan; nothing is ever
//! consumed by a query.

mod file;
mod memory;

pub use file::FileCatalog;
pub use memory::MemoryCatalog;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::fragment::{Fragment, FragmentKey};
use crate::predicate::TagPredicate;

/// What to do when a different origin publishes an existing `(kind, title)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Replace the entry and log a warning
    #[default]
    LastWriteWins,
    /// Keep the existing entry and fail the put
    Reject,
}

/// Effect of a single put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    Updated,
    Unchanged,
}

impl fmt::Display for PutOutcome {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutOutcome::Created => write!(formatter, "created"),
            PutOutcome::Updated => write!(formatter, "updated"),
            PutOutcome::Unchanged => write!(formatter, "unchanged"),
        }
    }
}

/// Storage contract shared by every catalog backend
pub trait CatalogStore: Send + Sync {
    /// Upsert a fragment by `(kind, title)`
    fn put(&self, fragment: Fragment) -> Result<PutOutcome>;

    /// All fragments whose tags satisfy `predicate`, ordered by `(kind, title)`
    fn query(&self, predicate: &TagPredicate) -> Result<Vec<Fragment>>;

    /// Every stored fragment, ordered by `(kind, title)`
    fn all(&self) -> Result<Vec<Fragment>>;

    /// Drop every fragment published by `origin`; returns how many were removed
    fn purge_origin(&self, origin: &str) -> Result<usize>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

pub(crate) type Entries = BTreeMap<FragmentKey, Fragment>;

/// Upsert shared by the backends; the caller holds the write lock
pub(crate) fn upsert(
    entries: &mut Entries,
    fragment: Fragment,
    policy: ConflictPolicy,
) -> Result<PutOutcome> {
    let key = fragment.key();

    let outcome = match entries.get(&key) {
        None => PutOutcome::Created,
        Some(existing) if *existing == fragment => return Ok(PutOutcome::Unchanged),
        Some(existing) if existing.origin() != fragment.origin() => match policy {
            ConflictPolicy::LastWriteWins => {
                warn!(
                    fragment = %key,
                    existing = %existing.origin(),
                    incoming = %fragment.origin(),
                    "Duplicate title from another origin, last write wins"
                );
                PutOutcome::Updated
            }
            ConflictPolicy::Reject => {
                return Err(RelayError::DuplicateTitleConflict {
                    kind: key.kind,
                    title: key.title,
                    existing: existing.origin().to_string(),
                    incoming: fragment.origin().to_string(),
                });
            }
        },
        Some(_) => PutOutcome::Updated,
    };

    debug!(fragment = %key, outcome = %outcome, "Catalog put");
    entries.insert(key, fragment);
    Ok(outcome)
}

pub(crate) fn select(entries: &Entries, predicate: &TagPredicate) -> Vec<Fragment> {
    entries
        .values()
        .filter(|fragment| predicate.matches(fragment))
        .cloned()
        .collect()
}

pub(crate) fn remove_origin(entries: &mut Entries, origin: &str) -> usize {
    let before = entries.len();
    entries.retain(|_, fragment| fragment.origin() != origin);
    before - entries.len()
}
