// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database-side publisher
//!
//! Turns the local node profile into the fragments a backup host needs:
//! a server binding, a backup schedule, a credentials line and, when the node
//! has a public key, a trusted key scoped under its own sub-tag.

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::catalog::{CatalogStore, PutOutcome};
use crate::error::{RelayError, Result};
use crate::fragment::{Fragment, FragmentKey, FragmentKind};

/// Length of derived credentials
pub const SECRET_LENGTH: usize = 30;

const SECRET_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Schedule fields in scheduler order; `None` is "every"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Schedule {
    pub monthday: Option<u8>,
    pub weekday: Option<u8>,
    pub hour: Option<u8>,
    pub minute: Option<u8>,
}

/// Everything a publisher knows about its node
#[derive(Clone)]
pub struct NodeProfile {
    pub node: String,
    pub namespace: String,
    pub group: String,
    pub db_host: String,
    pub db_name: String,
    pub db_user: String,
    pub ssh_user: String,
    /// Empty means derive one
    pub secret: String,
    pub secret_salt: String,
    pub schedule: Schedule,
    /// Raw `type blob [comment]` string
    pub key_material: Option<String>,
    pub trust_user: String,
}

impl std::fmt::Debug for NodeProfile {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("NodeProfile")
            .field("node", &self.node)
            .field("group", &self.group)
            .field("db_host", &self.db_host)
            .field("db_name", &self.db_name)
            .field("db_user", &self.db_user)
            .field("schedule", &self.schedule)
            .field("has_secret", &!self.secret.is_empty())
            .field("has_key", &self.key_material.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of one publish pass
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Fragments accepted by the catalog
    pub published: Vec<(FragmentKey, PutOutcome)>,
    /// Fragments that could not be built or stored
    pub failures: Vec<RelayError>,
}

impl PublishReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of puts that changed the catalog
    pub fn changed(&self) -> usize {
        self.published
            .iter()
            .filter(|(_, outcome)| *outcome != PutOutcome::Unchanged)
            .count()
    }
}

/// Builds and exports the fragments of one node
#[derive(Debug, Clone)]
pub struct Publisher {
    profile: NodeProfile,
}

impl Publisher {
    pub fn new(profile: NodeProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &NodeProfile {
        &self.profile
    }

    fn group_tag(&self) -> String {
        format!("{}-{}", self.profile.namespace, self.profile.group)
    }

    fn key_tag(&self) -> String {
        format!(
            "{}-{}-{}",
            self.profile.namespace, self.profile.group, self.profile.namespace
        )
    }

    pub fn server_binding(&self) -> Result<Fragment> {
        let p = &self.profile;
        Fragment::builder(FragmentKind::ServerBinding, p.node.as_str(), p.node.as_str())
            .tag(self.group_tag())
            .attr("user", p.db_user.as_str())
            .attr("dbname", p.db_name.as_str())
            .attr("host", p.db_host.as_str())
            .attr("ssh_command", format!("ssh {}@{}", p.ssh_user, p.db_host))
            .build()
    }

    pub fn schedule_entry(&self) -> Result<Fragment> {
        let p = &self.profile;
        let field = |value: Option<u8>| value.map(|v| v.to_string());
        Fragment::builder(
            FragmentKind::ScheduleEntry,
            format!("barman-backup-{}", p.node),
            p.node.as_str(),
        )
        .tag(self.group_tag())
        .attr("command", format!("barman backup {}", p.node))
        .attr("user", "root")
        .maybe_attr("monthday", field(p.schedule.monthday))
        .maybe_attr("weekday", field(p.schedule.weekday))
        .maybe_attr("hour", field(p.schedule.hour))
        .maybe_attr("minute", field(p.schedule.minute))
        .build()
    }

    pub fn credential_line(&self) -> Result<Fragment> {
        let p = &self.profile;
        let secret = if p.secret.is_empty() {
            derive_secret(&p.node, &p.secret_salt)
        } else {
            p.secret.clone()
        };

        Fragment::builder(
            FragmentKind::CredentialLine,
            format!("barman-pgpass-{}", p.node),
            p.node.as_str(),
        )
        .tag(self.group_tag())
        .attr("host", p.db_host.as_str())
        .attr("dbname", p.db_name.as_str())
        .attr("dbuser", p.db_user.as_str())
        .attr("secret", secret)
        .build()
    }

    /// The node's public key, or `None` when it has no key material
    pub fn trusted_key(&self) -> Result<Option<Fragment>> {
        let p = &self.profile;
        let raw = p.key_material.as_deref().unwrap_or("");
        let Some(key) = split_key_material(&p.node, raw)? else {
            return Ok(None);
        };

        let fragment = Fragment::builder(
            FragmentKind::TrustedKey,
            format!("{}@{}", p.ssh_user, p.node),
            p.node.as_str(),
        )
        .tag(self.key_tag())
        .attr("type", key.key_type)
        .attr("key", key.blob)
        .attr("user", p.trust_user.as_str())
        .maybe_attr("comment", key.comment)
        .build()?;

        Ok(Some(fragment))
    }

    /// Build every fragment; a failed builder does not stop the others
    pub fn fragments(&self) -> (Vec<Fragment>, Vec<RelayError>) {
        let mut fragments = Vec::new();
        let mut failures = Vec::new();

        let required = [
            self.server_binding(),
            self.schedule_entry(),
            self.credential_line(),
        ];
        for result in required {
            match result {
                Ok(fragment) => fragments.push(fragment),
                Err(e) => failures.push(e),
            }
        }

        match self.trusted_key() {
            Ok(Some(fragment)) => fragments.push(fragment),
            Ok(None) => debug!(node = %self.profile.node, "No key material, skipping trusted key"),
            Err(e) => {
                warn!(node = %self.profile.node, error = %e, "Skipping trusted key");
                failures.push(e);
            }
        }

        (fragments, failures)
    }

    /// Put every fragment into `catalog`
    pub fn publish(&self, catalog: &dyn CatalogStore) -> PublishReport {
        let (fragments, mut failures) = self.fragments();
        let mut published = Vec::new();

        for fragment in fragments {
            let key = fragment.key();
            match catalog.put(fragment) {
                Ok(outcome) => {
                    debug!(fragment = %key, outcome = %outcome, "Published");
                    published.push((key, outcome));
                }
                Err(e) => {
                    warn!(fragment = %key, error = %e, "Publish failed");
                    failures.push(e);
                }
            }
        }

        let report = PublishReport {
            published,
            failures,
        };
        info!(
            node = %self.profile.node,
            published = report.published.len(),
            changed = report.changed(),
            failed = report.failures.len(),
            "Publish completed"
        );
        report
    }
}

/// Parsed public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key_type: String,
    pub blob: String,
    pub comment: Option<String>,
}

/// Split `type blob [comment]` on whitespace; empty input yields `None`
pub fn split_key_material(node: &str, raw: &str) -> Result<Option<KeyMaterial>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let malformed = |message: &str| RelayError::MalformedKeyMaterial {
        node: node.to_string(),
        message: message.to_string(),
    };

    let (key_type, rest) = raw
        .split_once(char::is_whitespace)
        .ok_or_else(|| malformed("expected '<type> <blob>'"))?;
    let rest = rest.trim_start();
    let (blob, comment) = match rest.split_once(char::is_whitespace) {
        Some((blob, comment)) => (blob, Some(comment.trim().to_string())),
        None => (rest, None),
    };

    if blob.is_empty() {
        return Err(malformed("key blob is empty"));
    }

    Ok(Some(KeyMaterial {
        key_type: key_type.to_string(),
        blob: blob.to_string(),
        comment: comment.filter(|c| !c.is_empty()),
    }))
}

/// Derive a stable per-node credential from `(node, salt)`
///
/// SHA-256 in counter mode, mapped onto an alphanumeric alphabet with
/// rejection sampling so every character is equally likely.
pub fn derive_secret(node: &str, salt: &str) -> String {
    let alphabet_len = SECRET_ALPHABET.len();
    // Largest multiple of the alphabet that fits in a byte
    let limit = (256 / alphabet_len) * alphabet_len;

    let mut secret = String::with_capacity(SECRET_LENGTH);
    let mut block: u32 = 0;

    while secret.len() < SECRET_LENGTH {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update([0u8]);
        hasher.update(node.as_bytes());
        hasher.update(block.to_be_bytes());

        for byte in hasher.finalize() {
            let byte = byte as usize;
            if byte < limit {
                secret.push(SECRET_ALPHABET[byte % alphabet_len] as char);
                if secret.len() == SECRET_LENGTH {
                    break;
                }
            }
        }
        block += 1;
    }

    secret
}
