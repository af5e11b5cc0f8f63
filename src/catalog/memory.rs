// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process catalog

use parking_lot::RwLock;

use super::{remove_origin, select, upsert, CatalogStore, ConflictPolicy, Entries, PutOutcome};
use crate::error::Result;
use crate::fragment::Fragment;
use crate::predicate::TagPredicate;

/// Catalog held in memory behind a reader/writer lock
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: RwLock<Entries>,
    policy: ConflictPolicy,
}

impl MemoryCatalog {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            entries: RwLock::new(Entries::new()),
            policy,
        }
    }

    /// Seed a catalog from existing fragments, e.g. a snapshot of a file catalog
    pub fn with_fragments(policy: ConflictPolicy, fragments: Vec<Fragment>) -> Self {
        let entries = fragments
            .into_iter()
            .map(|fragment| (fragment.key(), fragment))
            .collect();
        Self {
            entries: RwLock::new(entries),
            policy,
        }
    }
}

impl CatalogStore for MemoryCatalog {
    fn put(&self, fragment: Fragment) -> Result<PutOutcome> {
        upsert(&mut self.entries.write(), fragment, self.policy)
    }

    fn query(&self, predicate: &TagPredicate) -> Result<Vec<Fragment>> {
        Ok(select(&self.entries.read(), predicate))
    }

    fn all(&self) -> Result<Vec<Fragment>> {
        Ok(self.entries.read().values().cloned().collect())
    }

    fn purge_origin(&self, origin: &str) -> Result<usize> {
        Ok(remove_origin(&mut self.entries.write(), origin))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::fragment::FragmentKind;

    fn server(origin: &str, group: &str, host: &str) -> Fragment {
        Fragment::builder(FragmentKind::ServerBinding, origin, origin)
            .tag(format!("barman-{}", group))
            .attr("host", host)
            .build()
            .unwrap()
    }

    #[test]
    fn test_put_is_idempotent() {
        let catalog = MemoryCatalog::default();
        let fragment = server("pg1", "db", "pg1.local");

        assert_eq!(catalog.put(fragment.clone()).unwrap(), PutOutcome::Created);
        let after_first = catalog.all().unwrap();
        assert_eq!(catalog.put(fragment).unwrap(), PutOutcome::Unchanged);
        assert_eq!(catalog.all().unwrap(), after_first);
        assert_eq!(catalog.len().unwrap(), 1);
    }

    #[test]
    fn test_put_upserts_by_key() {
        let catalog = MemoryCatalog::default();
        catalog.put(server("pg1", "db", "old.local")).unwrap();
        let outcome = catalog.put(server("pg1", "db", "new.local")).unwrap();

        assert_eq!(outcome, PutOutcome::Updated);
        let found = catalog.query(&TagPredicate::tag("barman-db")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].attribute("host"), Some("new.local"));
    }

    #[test]
    fn test_query_isolates_groups() {
        let catalog = MemoryCatalog::default();
        catalog.put(server("pg1", "db", "pg1")).unwrap();
        catalog.put(server("pg2", "web", "pg2")).unwrap();

        let db = catalog.query(&TagPredicate::tag("barman-db")).unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(db[0].origin(), "pg1");

        let none = catalog.query(&TagPredicate::tag("barman-other")).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_query_orders_by_title() {
        let catalog = MemoryCatalog::default();
        for origin in ["pg3", "pg1", "pg2"] {
            catalog.put(server(origin, "db", origin)).unwrap();
        }
        let titles: Vec<_> = catalog
            .query(&TagPredicate::tag("barman-db"))
            .unwrap()
            .iter()
            .map(|fragment| fragment.title().to_string())
            .collect();
        assert_eq!(titles, vec!["pg1", "pg2", "pg3"]);
    }

    fn foreign(origin: &str) -> Fragment {
        Fragment::builder(FragmentKind::ServerBinding, "shared", origin)
            .tag("barman-db")
            .build()
            .unwrap()
    }

    #[test]
    fn test_cross_origin_last_write_wins() {
        let catalog = MemoryCatalog::new(ConflictPolicy::LastWriteWins);
        catalog.put(foreign("pg1")).unwrap();
        assert_eq!(catalog.put(foreign("pg2")).unwrap(), PutOutcome::Updated);
        assert_eq!(catalog.all().unwrap()[0].origin(), "pg2");
    }

    #[test]
    fn test_cross_origin_reject() {
        let catalog = MemoryCatalog::new(ConflictPolicy::Reject);
        catalog.put(foreign("pg1")).unwrap();
        let err = catalog.put(foreign("pg2")).unwrap_err();
        assert!(matches!(err, RelayError::DuplicateTitleConflict { .. }));
        assert_eq!(catalog.all().unwrap()[0].origin(), "pg1");
    }

    #[test]
    fn test_purge_origin() {
        let catalog = MemoryCatalog::default();
        catalog.put(server("pg1", "db", "pg1")).unwrap();
        catalog.put(server("pg2", "db", "pg2")).unwrap();

        assert_eq!(catalog.purge_origin("pg1").unwrap(), 1);
        assert_eq!(catalog.purge_origin("pg1").unwrap(), 0);
        assert_eq!(catalog.len().unwrap(), 1);
    }
}
