// SPDX-License-Identifier: AGPL-3.0-or-later
//! Realized local state on the collecting node

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::fragment::{Attributes, FragmentKey, FragmentKind};

const STATE_FILE: &str = "state.json";

/// Effect of realizing one fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    Updated,
    Unchanged,
}

impl fmt::Display for Change {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Created => write!(formatter, "created"),
            Change::Updated => write!(formatter, "updated"),
            Change::Unchanged => write!(formatter, "unchanged"),
        }
    }
}

/// Backup target registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub origin: String,
    pub description: Option<String>,
    pub conninfo: String,
    pub ssh_command: String,
}

/// Scheduled backup job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub origin: String,
    pub monthday: Option<String>,
    pub weekday: Option<String>,
    pub hour: Option<String>,
    pub minute: Option<String>,
    pub command: String,
    pub user: String,
}

impl ScheduleEntry {
    /// Fields in scheduler order: month-day, week-day, hour, minute, command, user
    pub fn fields(&self) -> [&str; 6] {
        fn or_every(value: &Option<String>) -> &str {
            value.as_deref().unwrap_or("*")
        }
        [
            or_every(&self.monthday),
            or_every(&self.weekday),
            or_every(&self.hour),
            or_every(&self.minute),
            self.command.as_str(),
            self.user.as_str(),
        ]
    }
}

/// Key of a credentials line
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialKey {
    pub host: String,
    pub dbname: String,
    pub dbuser: String,
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:*:{}:{}", self.host, self.dbname, self.dbuser)
    }
}

/// One credentials-file line
///
/// The secret lives in memory only; `state.json` keeps a SHA-256 digest so a
/// reloaded entry still compares equal to the same line collected again.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub title: String,
    pub origin: String,
    pub key: CredentialKey,
    #[serde(skip)]
    pub secret: String,
    #[serde(default)]
    pub secret_digest: String,
}

impl CredentialEntry {
    pub fn new(title: &str, origin: &str, key: CredentialKey, secret: String) -> Self {
        Self {
            title: title.to_string(),
            origin: origin.to_string(),
            key,
            secret_digest: secret_digest(&secret),
            secret,
        }
    }

    /// False for an entry reloaded from disk and not collected again since
    pub fn has_secret(&self) -> bool {
        !self.secret.is_empty()
    }

    /// `host:*:dbname:dbuser:secret`
    pub fn line(&self) -> String {
        format!("{}:{}", self.key, self.secret)
    }
}

impl PartialEq for CredentialEntry {
    fn eq(&self, other: &Self) -> bool {
        self.title == other.title
            && self.origin == other.origin
            && self.key == other.key
            && self.secret_digest == other.secret_digest
    }
}

impl Eq for CredentialEntry {}

fn secret_digest(secret: &str) -> String {
    Sha256::digest(secret.as_bytes())
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

impl fmt::Debug for CredentialEntry {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CredentialEntry")
            .field("title", &self.title)
            .field("origin", &self.origin)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Authorized identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedKeyEntry {
    pub origin: String,
    pub key_type: String,
    pub key: String,
    pub user: String,
    pub comment: Option<String>,
}

/// Everything a collector has realized, keyed by fragment title
///
/// Credentials are keyed by their `host:*:db:user` prefix instead, so a line
/// for the same tuple is replaced rather than duplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalState {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerEntry>,
    #[serde(default)]
    pub schedule: BTreeMap<String, ScheduleEntry>,
    #[serde(default)]
    pub credentials: BTreeMap<String, CredentialEntry>,
    #[serde(default)]
    pub trusted_keys: BTreeMap<String, TrustedKeyEntry>,
}

impl LocalState {
    /// Load `state.json` from `dir`; a missing file is an empty state
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(STATE_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let path = dir.join(STATE_FILE);
        let tmp = dir.join(format!("{}.tmp", STATE_FILE));
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, &path)?;

        debug!(path = %path.display(), "State saved");
        Ok(())
    }

    /// Upsert one collected fragment, with overrides already merged
    pub fn realize(
        &mut self,
        kind: FragmentKind,
        title: &str,
        origin: &str,
        attributes: &Attributes,
    ) -> Result<Change> {
        let fields = Fields {
            kind,
            title,
            attributes,
        };

        match kind {
            FragmentKind::ServerBinding => {
                // The title names barman.d/<title>.conf
                fields.file_name("title", title)?;
                let conninfo = format!(
                    "user={} dbname={} host={}",
                    fields.required("user")?,
                    fields.required("dbname")?,
                    fields.required("host")?
                );
                let entry = ServerEntry {
                    origin: origin.to_string(),
                    description: fields.optional("description"),
                    conninfo,
                    ssh_command: fields.required("ssh_command")?,
                };
                Ok(upsert(&mut self.servers, title, entry))
            }
            FragmentKind::ScheduleEntry => {
                let entry = ScheduleEntry {
                    origin: origin.to_string(),
                    monthday: fields.optional("monthday"),
                    weekday: fields.optional("weekday"),
                    hour: fields.optional("hour"),
                    minute: fields.optional("minute"),
                    command: fields.required("command")?,
                    user: fields.required("user")?,
                };
                Ok(upsert(&mut self.schedule, title, entry))
            }
            FragmentKind::CredentialLine => {
                let key = CredentialKey {
                    host: fields.required("host")?,
                    dbname: fields.required("dbname")?,
                    dbuser: fields.required("dbuser")?,
                };
                let secret = fields.required("secret")?;
                if secret.contains(['\n', ':']) {
                    return Err(fields.failed("secret contains ':' or a newline"));
                }
                let slot = key.to_string();

                // Same title moved to a different tuple: drop the old line
                self.credentials
                    .retain(|existing_slot, entry| entry.title != title || *existing_slot == slot);

                let entry = CredentialEntry::new(title, origin, key, secret);
                Ok(upsert(&mut self.credentials, &slot, entry))
            }
            FragmentKind::TrustedKey => {
                // The user names authorized_keys/<user>
                let user = fields.required("user")?;
                fields.file_name("user", &user)?;
                let entry = TrustedKeyEntry {
                    origin: origin.to_string(),
                    key_type: fields.required("type")?,
                    key: fields.required("key")?,
                    user,
                    comment: fields.optional("comment"),
                };
                Ok(upsert(&mut self.trusted_keys, title, entry))
            }
        }
    }

    /// Drop every entry whose fragment is not in `keep`; returns how many went
    pub fn retain_fragments(&mut self, keep: &BTreeSet<FragmentKey>) -> usize {
        let before = self.len();
        let kept = |kind: FragmentKind, title: &str| {
            keep.contains(&FragmentKey {
                kind,
                title: title.to_string(),
            })
        };

        self.servers
            .retain(|title, _| kept(FragmentKind::ServerBinding, title));
        self.schedule
            .retain(|title, _| kept(FragmentKind::ScheduleEntry, title));
        self.credentials
            .retain(|_, entry| kept(FragmentKind::CredentialLine, &entry.title));
        self.trusted_keys
            .retain(|title, _| kept(FragmentKind::TrustedKey, title));

        before - self.len()
    }

    pub fn len(&self) -> usize {
        self.servers.len() + self.schedule.len() + self.credentials.len() + self.trusted_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Always stores `value`: an equal entry reloaded from disk lacks in-memory fields
fn upsert<V: PartialEq>(map: &mut BTreeMap<String, V>, key: &str, value: V) -> Change {
    let change = match map.get(key) {
        Some(existing) if *existing == value => Change::Unchanged,
        Some(_) => Change::Updated,
        None => Change::Created,
    };
    map.insert(key.to_string(), value);
    change
}

struct Fields<'a> {
    kind: FragmentKind,
    title: &'a str,
    attributes: &'a Attributes,
}

impl Fields<'_> {
    fn optional(&self, name: &str) -> Option<String> {
        self.attributes.get(name).cloned().flatten()
    }

    fn required(&self, name: &str) -> Result<String> {
        match self.optional(name) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(self.failed(&format!("missing attribute '{}'", name))),
        }
    }

    /// Reject values that would escape the output directory
    fn file_name(&self, name: &str, value: &str) -> Result<()> {
        let plain = !value.is_empty()
            && value != "."
            && value != ".."
            && !value.contains(['/', '\\', '\0', '\n']);
        if plain {
            Ok(())
        } else {
            Err(self.failed(&format!("{} {:?} is not a plain file name", name, value)))
        }
    }

    fn failed(&self, message: &str) -> RelayError {
        RelayError::RealizationFailed {
            kind: self.kind,
            title: self.title.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn attrs(pairs: &[(&str, Option<&str>)]) -> Attributes {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.map(str::to_string)))
            .collect()
    }

    fn credential(host: &str, secret: &str) -> Attributes {
        attrs(&[
            ("host", Some(host)),
            ("dbname", Some("postgres")),
            ("dbuser", Some("barman")),
            ("secret", Some(secret)),
        ])
    }

    #[test]
    fn test_schedule_field_order() {
        let mut state = LocalState::default();
        state
            .realize(
                FragmentKind::ScheduleEntry,
                "barman-backup-pg1",
                "pg1",
                &attrs(&[
                    ("command", Some("barman backup pg1")),
                    ("user", Some("root")),
                    ("monthday", None),
                    ("weekday", None),
                    ("hour", Some("4")),
                    ("minute", Some("0")),
                ]),
            )
            .unwrap();

        let entry = &state.schedule["barman-backup-pg1"];
        assert_eq!(
            entry.fields(),
            ["*", "*", "4", "0", "barman backup pg1", "root"]
        );
    }

    #[test]
    fn test_credential_line_replaced_by_tuple() {
        let mut state = LocalState::default();
        let first = state
            .realize(FragmentKind::CredentialLine, "pgpass-pg1", "pg1", &credential("pg1", "a"))
            .unwrap();
        let second = state
            .realize(FragmentKind::CredentialLine, "pgpass-pg1", "pg1", &credential("pg1", "b"))
            .unwrap();

        assert_eq!(first, Change::Created);
        assert_eq!(second, Change::Updated);
        assert_eq!(state.credentials.len(), 1);
        assert_eq!(
            state.credentials["pg1:*:postgres:barman"].line(),
            "pg1:*:postgres:barman:b"
        );
    }

    #[test]
    fn test_credential_moves_with_title() {
        let mut state = LocalState::default();
        state
            .realize(FragmentKind::CredentialLine, "pgpass-pg1", "pg1", &credential("old", "a"))
            .unwrap();
        state
            .realize(FragmentKind::CredentialLine, "pgpass-pg1", "pg1", &credential("new", "a"))
            .unwrap();

        let slots: Vec<_> = state.credentials.keys().cloned().collect();
        assert_eq!(slots, vec!["new:*:postgres:barman"]);
    }

    #[test]
    fn test_credential_rejects_separator_in_secret() {
        let mut state = LocalState::default();
        let err = state
            .realize(FragmentKind::CredentialLine, "pgpass-pg1", "pg1", &credential("pg1", "a:b"))
            .unwrap_err();
        assert!(matches!(err, RelayError::RealizationFailed { .. }));
        assert!(state.is_empty());
    }

    #[test]
    fn test_debug_hides_secret() {
        let mut state = LocalState::default();
        state
            .realize(
                FragmentKind::CredentialLine,
                "pgpass-pg1",
                "pg1",
                &credential("pg1", "hunter2"),
            )
            .unwrap();
        assert!(!format!("{:?}", state).contains("hunter2"));
    }

    #[test]
    fn test_missing_attribute_fails() {
        let mut state = LocalState::default();
        let err = state
            .realize(
                FragmentKind::TrustedKey,
                "postgres@pg1",
                "pg1",
                &attrs(&[("type", Some("ssh-rsa")), ("user", Some("barman"))]),
            )
            .unwrap_err();
        assert!(err.to_string().contains("'key'"));
    }

    #[test]
    fn test_state_file_has_no_secret() {
        let temp_dir = tempdir().unwrap();
        let mut state = LocalState::default();
        state
            .realize(
                FragmentKind::CredentialLine,
                "pgpass-pg1",
                "pg1",
                &credential("pg1", "TOPSECRETVALUE"),
            )
            .unwrap();
        state.save(temp_dir.path()).unwrap();

        let contents = std::fs::read_to_string(temp_dir.path().join(STATE_FILE)).unwrap();
        assert!(!contents.contains("TOPSECRETVALUE"));

        // Collecting the same line again after a reload is not a change
        let mut reloaded = LocalState::load(temp_dir.path()).unwrap();
        assert!(!reloaded.credentials["pg1:*:postgres:barman"].has_secret());
        let change = reloaded
            .realize(
                FragmentKind::CredentialLine,
                "pgpass-pg1",
                "pg1",
                &credential("pg1", "TOPSECRETVALUE"),
            )
            .unwrap();
        assert_eq!(change, Change::Unchanged);
        assert_eq!(
            reloaded.credentials["pg1:*:postgres:barman"].line(),
            "pg1:*:postgres:barman:TOPSECRETVALUE"
        );
    }

    #[test]
    fn test_rejects_escaping_file_names() {
        let mut state = LocalState::default();
        let err = state
            .realize(
                FragmentKind::TrustedKey,
                "postgres@pg1",
                "pg1",
                &attrs(&[
                    ("type", Some("ssh-rsa")),
                    ("key", Some("AAAA")),
                    ("user", Some("../../escaped")),
                ]),
            )
            .unwrap_err();
        assert!(matches!(err, RelayError::RealizationFailed { .. }));

        let err = state
            .realize(
                FragmentKind::ServerBinding,
                "..",
                "pg1",
                &attrs(&[
                    ("user", Some("barman")),
                    ("dbname", Some("postgres")),
                    ("host", Some("pg1")),
                    ("ssh_command", Some("ssh postgres@pg1")),
                ]),
            )
            .unwrap_err();
        assert!(matches!(err, RelayError::RealizationFailed { .. }));
        assert!(state.is_empty());
    }

    #[test]
    fn test_retain_fragments_drops_the_rest() {
        let mut state = LocalState::default();
        state
            .realize(FragmentKind::CredentialLine, "pgpass-pg1", "pg1", &credential("pg1", "a"))
            .unwrap();
        state
            .realize(FragmentKind::CredentialLine, "pgpass-pg2", "pg2", &credential("pg2", "b"))
            .unwrap();

        let keep = BTreeSet::from([FragmentKey {
            kind: FragmentKind::CredentialLine,
            title: "pgpass-pg2".to_string(),
        }]);
        assert_eq!(state.retain_fragments(&keep), 1);
        let slots: Vec<_> = state.credentials.keys().cloned().collect();
        assert_eq!(slots, vec!["pg2:*:postgres:barman"]);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let mut state = LocalState::default();
        state
            .realize(FragmentKind::CredentialLine, "pgpass-pg1", "pg1", &credential("pg1", "a"))
            .unwrap();

        state.save(temp_dir.path().join("state")).unwrap();
        let loaded = LocalState::load(temp_dir.path().join("state")).unwrap();
        assert_eq!(loaded, state);

        let empty = LocalState::load(temp_dir.path().join("missing")).unwrap();
        assert!(empty.is_empty());
    }
}
