// SPDX-License-Identifier: AGPL-3.0-or-later
//! barman-relay: export/collect catalog for Barman backup wiring
//!
//! Database hosts publish tagged fragments (server binding, backup schedule,
//! credentials line, trusted SSH key) into a shared catalog. The backup host
//! later selects them by tag and realizes them locally. The two sides never
//! talk to each other directly.
//!
//! # Features
//!
//! * **Catalog:** upsert by `(kind, title)`, filtered scans, manual purge
//! * **Tag predicates:** `tag == "..."` with `and` / `or` / `not`
//! * **Overrides:** collector-side attribute overrides merged at realization
//! * **Convergence:** idempotent publish-then-collect runs

pub mod catalog;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod predicate;
pub mod publisher;

pub use catalog::{CatalogStore, ConflictPolicy, FileCatalog, MemoryCatalog, PutOutcome};
pub use collector::{Collector, LocalState, OverrideSpec, OverrideValue};
pub use config::Config;
pub use engine::{ConvergenceEngine, Phase, RunReport};
pub use error::{RelayError, Result};
pub use fragment::{Fragment, FragmentKind};
pub use predicate::TagPredicate;
pub use publisher::{derive_secret, NodeProfile, Publisher};
