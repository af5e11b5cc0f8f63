// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup-side collection
//!
//! A collector selects fragments from the catalog with a tag predicate,
//! merges its local overrides over each fragment's attributes and realizes
//! the result into [`LocalState`]. The catalog entry itself is never touched.

mod output;
mod state;

pub use output::{remove_stale, render, write_rendered, RenderedFiles};
pub use state::{
    Change, CredentialEntry, CredentialKey, LocalState, ScheduleEntry, ServerEntry, TrustedKeyEntry,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::catalog::CatalogStore;
use crate::error::{RelayError, Result};
use crate::fragment::{Attributes, Fragment, FragmentKey};
use crate::predicate::TagPredicate;

/// Marker that injects the publishing node identity
pub const ORIGIN_MARKER: &str = "@origin";

/// Value a collector forces onto an attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OverrideValue {
    Literal(String),
    /// The matched fragment's origin
    Origin,
}

impl From<String> for OverrideValue {
    fn from(value: String) -> Self {
        if value == ORIGIN_MARKER {
            OverrideValue::Origin
        } else {
            OverrideValue::Literal(value)
        }
    }
}

impl From<OverrideValue> for String {
    fn from(value: OverrideValue) -> Self {
        match value {
            OverrideValue::Literal(value) => value,
            OverrideValue::Origin => ORIGIN_MARKER.to_string(),
        }
    }
}

/// Attribute name to forced value
pub type OverrideSpec = BTreeMap<String, OverrideValue>;

/// Attributes of `fragment` with `overrides` applied on top
pub fn merge_overrides(fragment: &Fragment, overrides: &OverrideSpec) -> Attributes {
    let mut attributes = fragment.attributes().clone();
    for (name, value) in overrides {
        let resolved = match value {
            OverrideValue::Literal(value) => value.clone(),
            OverrideValue::Origin => fragment.origin().to_string(),
        };
        attributes.insert(name.clone(), Some(resolved));
    }
    attributes
}

/// Result of one collector pass
#[derive(Debug, Default)]
pub struct CollectReport {
    pub predicate: String,
    /// Every fragment the query returned, realized or not
    pub matched: Vec<FragmentKey>,
    pub realized: Vec<(FragmentKey, Change)>,
    pub failures: Vec<RelayError>,
}

impl CollectReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn changed(&self) -> usize {
        self.realized
            .iter()
            .filter(|(_, change)| *change != Change::Unchanged)
            .count()
    }
}

/// Pulls matching fragments and realizes them locally
#[derive(Debug, Clone)]
pub struct Collector {
    predicate: TagPredicate,
    overrides: OverrideSpec,
}

impl Collector {
    pub fn new(predicate: TagPredicate, overrides: OverrideSpec) -> Self {
        Self {
            predicate,
            overrides,
        }
    }

    pub fn predicate(&self) -> &TagPredicate {
        &self.predicate
    }

    pub fn overrides(&self) -> &OverrideSpec {
        &self.overrides
    }

    /// Query the catalog and realize every match into `state`
    ///
    /// A failing query is returned as an error; a failing fragment is
    /// recorded in the report and the rest still converge.
    pub fn collect(
        &self,
        catalog: &dyn CatalogStore,
        state: &mut LocalState,
    ) -> Result<CollectReport> {
        let fragments = catalog.query(&self.predicate)?;
        debug!(predicate = %self.predicate, matched = fragments.len(), "Catalog query");

        let mut report = CollectReport {
            predicate: self.predicate.to_string(),
            ..CollectReport::default()
        };

        for fragment in &fragments {
            let key = fragment.key();
            report.matched.push(key.clone());
            let attributes = merge_overrides(fragment, &self.overrides);

            match state.realize(fragment.kind(), fragment.title(), fragment.origin(), &attributes) {
                Ok(change) => {
                    debug!(fragment = %key, change = %change, "Realized");
                    report.realized.push((key, change));
                }
                Err(e) => {
                    warn!(fragment = %key, error = %e, "Realization failed");
                    report.failures.push(e);
                }
            }
        }

        info!(
            predicate = %self.predicate,
            realized = report.realized.len(),
            changed = report.changed(),
            failed = report.failures.len(),
            "Collect completed"
        );
        Ok(report)
    }
}

impl fmt::Display for Collector {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "collect({})", self.predicate)
    }
}
