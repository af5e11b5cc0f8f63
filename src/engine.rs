// SPDX-License-Identifier: AGPL-3.0-or-later
//! Convergence engine
//!
//! One run is `Idle -> Publishing -> Collecting -> Idle`. Prerequisite
//! failures abort before anything is published; per-fragment failures are
//! reported and the rest of the run still converges. Nothing is rolled back.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogStore;
use crate::collector::{
    remove_stale, render, write_rendered, CollectReport, Collector, LocalState,
};
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::publisher::{PublishReport, Publisher};

/// Where the engine currently is within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Publishing,
    Collecting,
}

impl fmt::Display for Phase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(formatter, "idle"),
            Phase::Publishing => write!(formatter, "publishing"),
            Phase::Collecting => write!(formatter, "collecting"),
        }
    }
}

/// External capability a run depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prerequisite {
    Directory { path: PathBuf, purpose: String },
    File { path: PathBuf, purpose: String },
}

impl Prerequisite {
    fn check(&self) -> Result<()> {
        let (present, path, purpose) = match self {
            Prerequisite::Directory { path, purpose } => (path.is_dir(), path, purpose),
            Prerequisite::File { path, purpose } => (path.is_file(), path, purpose),
        };
        if present {
            Ok(())
        } else {
            Err(RelayError::MissingPrerequisite {
                what: format!("{} ({})", purpose, path.display()),
            })
        }
    }
}

/// Outcome of a complete run
#[derive(Debug, Default)]
pub struct RunReport {
    pub publish: Option<PublishReport>,
    pub collect: Vec<CollectReport>,
    /// Step-level failures outside a single fragment (query, persistence)
    pub failures: Vec<RelayError>,
    /// Files rewritten by the renderer
    pub rendered: Vec<PathBuf>,
    /// Realized entries no collector matched any more
    pub pruned: usize,
    /// Rendered files deleted along with pruned entries
    pub removed: Vec<PathBuf>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
            && self.publish.as_ref().map_or(true, PublishReport::success)
            && self.collect.iter().all(CollectReport::success)
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
            + self.publish.as_ref().map_or(0, |report| report.failures.len())
            + self
                .collect
                .iter()
                .map(|report| report.failures.len())
                .sum::<usize>()
    }
}

/// Drives publish-then-collect runs for one node
pub struct ConvergenceEngine {
    catalog: Arc<dyn CatalogStore>,
    publisher: Option<Publisher>,
    collectors: Vec<Collector>,
    state: LocalState,
    state_dir: Option<PathBuf>,
    prerequisites: Vec<Prerequisite>,
    dry_run: bool,
    phase: Phase,
    history: Vec<Phase>,
}

impl ConvergenceEngine {
    /// Engine with neither publisher nor collectors
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self {
            catalog,
            publisher: None,
            collectors: Vec::new(),
            state: LocalState::default(),
            state_dir: None,
            prerequisites: Vec::new(),
            dry_run: false,
            phase: Phase::Idle,
            history: vec![Phase::Idle],
        }
    }

    /// Engine wired from a node configuration
    pub fn from_config(config: &Config, catalog: Arc<dyn CatalogStore>) -> Result<Self> {
        let prerequisites = config.prerequisites();
        for prerequisite in &prerequisites {
            prerequisite.check()?;
        }

        let mut engine = Self::new(catalog)
            .with_collectors(config.collectors())
            .with_prerequisites(prerequisites);
        if let Some(profile) = config.node_profile()? {
            engine = engine.with_publisher(Publisher::new(profile));
        }
        if let Some(collect) = &config.collect {
            engine = engine.with_state_dir(collect.state_dir.clone());
        }
        Ok(engine)
    }

    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_collectors(mut self, collectors: Vec<Collector>) -> Self {
        self.collectors = collectors;
        self
    }

    /// Persist realized state and rendered files under `dir`
    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = Some(dir);
        self
    }

    pub fn with_prerequisites(mut self, prerequisites: Vec<Prerequisite>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    /// Compute changes without persisting local state or rendered files
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Phases entered since the last `run`, `publish` or `collect` began
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = %self.phase, to = %phase, "Phase change");
            self.phase = phase;
            self.history.push(phase);
        }
    }

    pub fn state(&self) -> &LocalState {
        &self.state
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    /// Publish then collect
    pub fn run(&mut self) -> Result<RunReport> {
        let start_time = Instant::now();
        self.history = vec![self.phase];

        for prerequisite in &self.prerequisites {
            if let Err(e) = prerequisite.check() {
                error!(error = %e, "Aborting run");
                return Err(e);
            }
        }

        let mut report = RunReport {
            publish: self.publish_step(),
            ..RunReport::default()
        };
        self.collect_step(&mut report);
        self.enter(Phase::Idle);

        report.duration_ms = start_time.elapsed().as_millis() as u64;
        info!(
            success = report.success(),
            failures = report.failure_count(),
            duration_ms = report.duration_ms,
            "Convergence run completed"
        );
        Ok(report)
    }

    /// Only the publishing half of a run
    pub fn publish(&mut self) -> Option<PublishReport> {
        self.history = vec![self.phase];
        let report = self.publish_step();
        self.enter(Phase::Idle);
        report
    }

    /// Only the collecting half of a run; results are appended to `report`
    pub fn collect(&mut self, report: &mut RunReport) {
        self.history = vec![self.phase];
        self.collect_step(report);
        self.enter(Phase::Idle);
    }

    fn publish_step(&mut self) -> Option<PublishReport> {
        self.publisher.as_ref()?;
        self.enter(Phase::Publishing);
        let publisher = self.publisher.as_ref()?;
        Some(publisher.publish(self.catalog.as_ref()))
    }

    fn collect_step(&mut self, report: &mut RunReport) {
        if self.collectors.is_empty() {
            return;
        }
        self.enter(Phase::Collecting);

        if let Some(dir) = &self.state_dir {
            match LocalState::load(dir) {
                Ok(state) => self.state = state,
                Err(e) => {
                    // Unreadable state is rebuilt from the catalog
                    warn!(error = %e, "Discarding unreadable local state");
                    self.state = LocalState::default();
                }
            }
        }

        let mut matched = BTreeSet::new();
        let mut complete = true;
        for collector in &self.collectors {
            match collector.collect(self.catalog.as_ref(), &mut self.state) {
                Ok(collected) => {
                    matched.extend(collected.matched.iter().cloned());
                    report.collect.push(collected);
                }
                Err(e) => {
                    error!(collector = %collector, error = %e, "Collect step failed");
                    report.failures.push(e);
                    complete = false;
                }
            }
        }

        // A failed query says nothing about what is gone, so keep everything
        if complete {
            report.pruned = self.state.retain_fragments(&matched);
            if report.pruned > 0 {
                info!(pruned = report.pruned, "Dropped entries no longer in the catalog");
            }
        }

        if let (Some(dir), false) = (&self.state_dir, self.dry_run) {
            if let Err(e) = self.state.save(dir) {
                error!(error = %e, "Saving local state failed");
                report.failures.push(e);
            }
            let files = render(&self.state);
            match write_rendered(dir, &files) {
                Ok(written) => report.rendered = written,
                Err(e) => {
                    error!(error = %e, "Rendering failed");
                    report.failures.push(e);
                }
            }
            match remove_stale(dir, &files) {
                Ok(removed) => report.removed = removed,
                Err(e) => {
                    error!(error = %e, "Removing stale files failed");
                    report.failures.push(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::collector::OverrideSpec;
    use crate::predicate::TagPredicate;
    use crate::publisher::{NodeProfile, Schedule};
    use tempfile::tempdir;

    fn profile(node: &str) -> NodeProfile {
        NodeProfile {
            node: node.to_string(),
            namespace: "barman".to_string(),
            group: "db".to_string(),
            db_host: node.to_string(),
            db_name: "postgres".to_string(),
            db_user: "barman".to_string(),
            ssh_user: "postgres".to_string(),
            secret: String::new(),
            secret_salt: "salt".to_string(),
            schedule: Schedule {
                hour: Some(4),
                minute: Some(0),
                ..Schedule::default()
            },
            key_material: Some("ssh-rsa AAAA".to_string()),
            trust_user: "barman".to_string(),
        }
    }

    fn collectors() -> Vec<Collector> {
        vec![
            Collector::new(TagPredicate::tag("barman-db"), OverrideSpec::new()),
            Collector::new(TagPredicate::tag("barman-db-barman"), OverrideSpec::new()),
        ]
    }

    #[test]
    fn test_missing_prerequisite_aborts_before_publish() {
        let catalog: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::default());
        let mut engine = ConvergenceEngine::new(catalog.clone())
            .with_publisher(Publisher::new(profile("pg1")))
            .with_prerequisites(vec![Prerequisite::Directory {
                path: PathBuf::from("/nonexistent/shared"),
                purpose: "shared catalog directory".to_string(),
            }]);

        let err = engine.run().unwrap_err();
        assert!(matches!(err, RelayError::MissingPrerequisite { .. }));
        assert!(catalog.is_empty().unwrap());
        assert_eq!(engine.phase(), Phase::Idle);
    }

    #[test]
    fn test_two_nodes_converge_through_catalog() {
        let catalog: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::default());
        let mut db = ConvergenceEngine::new(catalog.clone())
            .with_publisher(Publisher::new(profile("pg1")));
        let mut backup = ConvergenceEngine::new(catalog.clone()).with_collectors(collectors());

        // Backup host runs first: nothing to collect yet
        let early = backup.run().unwrap();
        assert!(early.success());
        assert!(backup.state().is_empty());

        db.run().unwrap();
        let report = backup.run().unwrap();
        assert!(report.success());
        assert_eq!(backup.state().len(), 4);

        let again = backup.run().unwrap();
        assert!(again.collect.iter().all(|collected| collected.changed() == 0));
    }

    #[test]
    fn test_state_dir_persists_and_renders() {
        let temp_dir = tempdir().unwrap();
        let catalog: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::default());
        Publisher::new(profile("pg1")).publish(catalog.as_ref());

        let mut backup = ConvergenceEngine::new(catalog.clone())
            .with_collectors(collectors())
            .with_state_dir(temp_dir.path().to_path_buf());
        let report = backup.run().unwrap();

        assert!(report.success());
        assert!(temp_dir.path().join("state.json").exists());
        assert!(temp_dir.path().join("barman.d/pg1.conf").exists());
        assert!(!report.rendered.is_empty());

        let again = backup.run().unwrap();
        assert!(again.rendered.is_empty());
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let temp_dir = tempdir().unwrap();
        let catalog: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::default());
        Publisher::new(profile("pg1")).publish(catalog.as_ref());

        let mut backup = ConvergenceEngine::new(catalog)
            .with_collectors(collectors())
            .with_state_dir(temp_dir.path().join("state"))
            .dry_run(true);
        let report = backup.run().unwrap();

        assert!(report.success());
        assert_eq!(backup.state().len(), 4);
        assert!(!temp_dir.path().join("state").exists());
    }

    #[test]
    fn test_run_walks_phases_in_order() {
        let catalog: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::default());
        let mut engine = ConvergenceEngine::new(catalog)
            .with_publisher(Publisher::new(profile("pg1")))
            .with_collectors(collectors());

        engine.run().unwrap();
        assert_eq!(
            engine.history(),
            [Phase::Idle, Phase::Publishing, Phase::Collecting, Phase::Idle]
        );
    }

    #[test]
    fn test_purged_node_is_dropped_locally() {
        let temp_dir = tempdir().unwrap();
        let catalog: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::default());
        Publisher::new(profile("pg1")).publish(catalog.as_ref());
        Publisher::new(profile("pg2")).publish(catalog.as_ref());

        let mut backup = ConvergenceEngine::new(catalog.clone())
            .with_collectors(collectors())
            .with_state_dir(temp_dir.path().to_path_buf());
        backup.run().unwrap();
        assert!(temp_dir.path().join("barman.d/pg1.conf").exists());

        assert_eq!(catalog.purge_origin("pg1").unwrap(), 4);
        let report = backup.run().unwrap();

        assert_eq!(report.pruned, 4);
        let servers: Vec<_> = backup.state().servers.keys().cloned().collect();
        assert_eq!(servers, vec!["pg2"]);
        assert!(!temp_dir.path().join("barman.d/pg1.conf").exists());
        assert!(temp_dir.path().join("barman.d/pg2.conf").exists());

        let pgpass = std::fs::read_to_string(temp_dir.path().join("pgpass")).unwrap();
        assert!(!pgpass.contains("pg1:"));
        assert!(pgpass.contains("pg2:"));
        let crontab = std::fs::read_to_string(temp_dir.path().join("crontab")).unwrap();
        assert!(!crontab.contains("barman backup pg1"));
    }
}
