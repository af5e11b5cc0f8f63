// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration management for barman-relay

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::catalog::ConflictPolicy;
use crate::collector::{Collector, OverrideSpec, OverrideValue};
use crate::engine::Prerequisite;
use crate::error::{RelayError, Result};
use crate::predicate::TagPredicate;
use crate::publisher::{NodeProfile, Schedule};

/// Main configuration structure for a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity of this node; embedded in every title it publishes
    pub node: String,

    /// Tag namespace shared by publishers and collectors
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Host group; publishers and collectors meet on `<namespace>-<group>`
    #[serde(default = "default_group")]
    pub group: String,

    /// Path of the shared catalog file
    #[serde(default = "default_catalog")]
    pub catalog: PathBuf,

    /// Behaviour on duplicate titles from different origins
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Present on database hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishConfig>,

    /// Present on backup hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect: Option<CollectConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings for the database side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Address the backup host connects to; defaults to the node identity
    pub db_host: Option<String>,

    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// Database role used by the backup server
    #[serde(default = "default_db_user")]
    pub db_user: String,

    /// System user the backup server logs in as over SSH
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    /// Credential for `db_user`; derived per node when empty
    #[serde(default)]
    pub secret: String,

    #[serde(default = "default_secret_salt")]
    pub secret_salt: String,

    /// Inline public key (`type blob [comment]`)
    pub ssh_key: Option<String>,

    /// Public key file, read when `ssh_key` is not set
    pub ssh_key_file: Option<PathBuf>,

    /// Account on the collecting side that trusts the key
    #[serde(default = "default_trust_user")]
    pub trust_user: String,

    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Backup schedule; `"*"` (or, for day fields, omission) means every value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default, with = "every_or_value")]
    pub monthday: Option<u8>,
    #[serde(default, with = "every_or_value")]
    pub weekday: Option<u8>,
    #[serde(default = "default_hour", with = "every_or_value")]
    pub hour: Option<u8>,
    #[serde(default = "default_minute", with = "every_or_value")]
    pub minute: Option<u8>,
}

/// TOML has no null, so an unset schedule field is spelled `"*"`
mod every_or_value {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    const EVERY: &str = "*";

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Field {
        Value(u8),
        Text(String),
    }

    pub fn serialize<S>(value: &Option<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(value) => Field::Value(*value),
            None => Field::Text(EVERY.to_string()),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Field::deserialize(deserializer)? {
            Field::Value(value) => Ok(Some(value)),
            Field::Text(text) if text == EVERY => Ok(None),
            Field::Text(text) => Err(de::Error::custom(format!(
                "expected a number or \"{}\", found \"{}\"",
                EVERY, text
            ))),
        }
    }
}

/// Settings for the backup side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectConfig {
    /// Where realized state and rendered files live
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Selection predicates; defaults to the group tag and the key sub-tag
    #[serde(default)]
    pub predicates: Vec<TagPredicate>,

    /// Attribute overrides applied at realization; `"@origin"` injects the publisher
    #[serde(default)]
    pub overrides: BTreeMap<String, OverrideValue>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            monthday: None,
            weekday: None,
            hour: default_hour(),
            minute: default_minute(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            db_host: None,
            db_name: default_db_name(),
            db_user: default_db_user(),
            ssh_user: default_ssh_user(),
            secret: String::new(),
            secret_salt: default_secret_salt(),
            ssh_key: None,
            ssh_key_file: None,
            trust_user: default_trust_user(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            predicates: Vec::new(),
            overrides: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Minimal configuration for `node`, neither publishing nor collecting
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            namespace: default_namespace(),
            group: default_group(),
            catalog: default_catalog(),
            conflict_policy: ConflictPolicy::default(),
            publish: None,
            collect: None,
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(RelayError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.trim().is_empty() {
            return Err(invalid("node identity cannot be empty"));
        }

        if self.namespace.is_empty() || self.group.is_empty() {
            return Err(invalid("namespace and group cannot be empty"));
        }

        if self.publish.is_none() && self.collect.is_none() {
            return Err(invalid(
                "node neither publishes nor collects; add a [publish] or [collect] section",
            ));
        }

        if let Some(publish) = &self.publish {
            if publish.db_name.is_empty() || publish.db_user.is_empty() {
                return Err(invalid("publish.db_name and publish.db_user cannot be empty"));
            }
            publish.schedule.validate()?;
        }

        Ok(())
    }

    /// Tag carried by server, schedule and credential fragments
    pub fn group_tag(&self) -> String {
        format!("{}-{}", self.namespace, self.group)
    }

    /// Sub-tag scoping key trust
    pub fn key_tag(&self) -> String {
        format!("{}-{}-{}", self.namespace, self.group, self.namespace)
    }

    /// Publishing profile, if this node publishes
    ///
    /// Reads `ssh_key_file` when configured, so call after the prerequisites check.
    pub fn node_profile(&self) -> Result<Option<NodeProfile>> {
        let Some(publish) = &self.publish else {
            return Ok(None);
        };

        let key_material = match (&publish.ssh_key, &publish.ssh_key_file) {
            (Some(key), _) => Some(key.clone()),
            (None, Some(path)) => Some(std::fs::read_to_string(path)?),
            (None, None) => None,
        };

        Ok(Some(NodeProfile {
            node: self.node.clone(),
            namespace: self.namespace.clone(),
            group: self.group.clone(),
            db_host: publish.db_host.clone().unwrap_or_else(|| self.node.clone()),
            db_name: publish.db_name.clone(),
            db_user: publish.db_user.clone(),
            ssh_user: publish.ssh_user.clone(),
            secret: publish.secret.clone(),
            secret_salt: publish.secret_salt.clone(),
            schedule: Schedule {
                monthday: publish.schedule.monthday,
                weekday: publish.schedule.weekday,
                hour: publish.schedule.hour,
                minute: publish.schedule.minute,
            },
            key_material,
            trust_user: publish.trust_user.clone(),
        }))
    }

    /// Collectors for this node, if it collects
    pub fn collectors(&self) -> Vec<Collector> {
        let Some(collect) = &self.collect else {
            return Vec::new();
        };

        let overrides: OverrideSpec = collect.overrides.clone();
        let predicates = if collect.predicates.is_empty() {
            vec![
                TagPredicate::tag(self.group_tag()),
                TagPredicate::tag(self.key_tag()),
            ]
        } else {
            collect.predicates.clone()
        };

        predicates
            .into_iter()
            .map(|predicate| Collector::new(predicate, overrides.clone()))
            .collect()
    }

    /// External capabilities that must exist before a run starts
    pub fn prerequisites(&self) -> Vec<Prerequisite> {
        let mut prerequisites = Vec::new();

        if let Some(parent) = self.catalog.parent() {
            if !parent.as_os_str().is_empty() {
                prerequisites.push(Prerequisite::Directory {
                    path: parent.to_path_buf(),
                    purpose: "shared catalog directory".to_string(),
                });
            }
        }

        if let Some(PublishConfig {
            ssh_key: None,
            ssh_key_file: Some(path),
            ..
        }) = &self.publish
        {
            prerequisites.push(Prerequisite::File {
                path: path.clone(),
                purpose: "SSH public key file".to_string(),
            });
        }

        prerequisites
    }
}

impl ScheduleConfig {
    fn validate(&self) -> Result<()> {
        check_range("monthday", self.monthday, 1, 31)?;
        check_range("weekday", self.weekday, 0, 7)?;
        check_range("hour", self.hour, 0, 23)?;
        check_range("minute", self.minute, 0, 59)
    }
}

fn check_range(field: &str, value: Option<u8>, min: u8, max: u8) -> Result<()> {
    match value {
        Some(value) if value < min || value > max => Err(RelayError::InvalidConfig {
            message: format!(
                "publish.schedule.{} = {} is outside {}..={}",
                field, value, min, max
            ),
        }),
        _ => Ok(()),
    }
}

fn invalid(message: &str) -> RelayError {
    RelayError::InvalidConfig {
        message: message.to_string(),
    }
}

// Default value functions

fn default_namespace() -> String {
    "barman".to_string()
}

fn default_group() -> String {
    "default".to_string()
}

fn default_catalog() -> PathBuf {
    PathBuf::from("/var/lib/barman-relay/catalog.json")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/barman-relay/state")
}

fn default_db_name() -> String {
    "postgres".to_string()
}

fn default_db_user() -> String {
    "barman".to_string()
}

fn default_ssh_user() -> String {
    "postgres".to_string()
}

fn default_trust_user() -> String {
    "barman".to_string()
}

fn default_secret_salt() -> String {
    "barman-relay-credential".to_string()
}

fn default_hour() -> Option<u8> {
    Some(4)
}

fn default_minute() -> Option<u8> {
    Some(0)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
