//! Shared types used across esgrid crates.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LaunchError, LaunchResult};

/// Role of a node in the launched cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(Role::Master),
            "worker" => Ok(Role::Worker),
            other => Err(format!("unknown role: {other} (expected master or worker)")),
        }
    }
}

/// An experiment definition document.
///
/// Only the `exp_prefix` field is interpreted; the rest of the document is
/// carried verbatim into the master's boot script. Key order is preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSpec {
    prefix: String,
    document: Value,
}

impl ExperimentSpec {
    pub const PREFIX_FIELD: &'static str = "exp_prefix";

    /// Parse an experiment document. `document_name` is only used in errors.
    pub fn parse(document_name: &str, text: &str) -> LaunchResult<Self> {
        let document: Value = serde_json::from_str(text)
            .map_err(|e| LaunchError::input(document_name, format!("invalid JSON: {e}")))?;

        let prefix = match document.get(Self::PREFIX_FIELD) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_)) => {
                return Err(LaunchError::input(
                    document_name,
                    format!("`{}` is empty", Self::PREFIX_FIELD),
                ));
            }
            Some(_) => {
                return Err(LaunchError::input(
                    document_name,
                    format!("`{}` must be a string", Self::PREFIX_FIELD),
                ));
            }
            None if !document.is_object() => {
                return Err(LaunchError::input(
                    document_name,
                    "experiment document must be a JSON object",
                ));
            }
            None => {
                return Err(LaunchError::input(
                    document_name,
                    format!("missing required field `{}`", Self::PREFIX_FIELD),
                ));
            }
        };

        Ok(Self { prefix, document })
    }

    pub fn from_file(path: &Path) -> LaunchResult<Self> {
        let name = path.display().to_string();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LaunchError::input(&name, format!("cannot read file: {e}")))?;
        Self::parse(&name, &text)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Single-line JSON, as embedded in the master boot script.
    pub fn to_compact_json(&self) -> String {
        self.document.to_string()
    }

    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(&self.document).unwrap_or_else(|_| self.to_compact_json())
    }
}

/// Where an experiment document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExperimentSource {
    File(PathBuf),
    Inline { name: String, text: String },
}

impl ExperimentSource {
    pub fn inline(name: impl Into<String>, text: impl Into<String>) -> Self {
        ExperimentSource::Inline {
            name: name.into(),
            text: text.into(),
        }
    }

    /// Display name used in progress output and errors.
    pub fn name(&self) -> String {
        match self {
            ExperimentSource::File(path) => path.display().to_string(),
            ExperimentSource::Inline { name, .. } => name.clone(),
        }
    }

    pub fn load(&self) -> LaunchResult<ExperimentSpec> {
        match self {
            ExperimentSource::File(path) => ExperimentSpec::from_file(path),
            ExperimentSource::Inline { name, text } => ExperimentSpec::parse(name, text),
        }
    }
}

/// `{experiment_prefix}_{YYYYmmdd-HHMMSS}` in UTC.
///
/// Used as the `exp_name` tag value and as the launch configuration and
/// scaling group name, so it must differ from any still-live run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunName(String);

impl RunName {
    pub const TIMESTAMP_FORMAT: &'static str = "%Y%m%d-%H%M%S";

    pub fn new(prefix: &str, at: DateTime<Utc>) -> Self {
        Self(format!("{prefix}_{}", at.format(Self::TIMESTAMP_FORMAT)))
    }

    pub fn now(prefix: &str) -> Self {
        Self::new(prefix, Utc::now())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `Name` tag for nodes of the given role, e.g. `demo_20240101-000000-master`.
    pub fn display_name(&self, role: Role) -> String {
        format!("{}-{}", self.0, role)
    }
}

impl fmt::Display for RunName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A key/value resource tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

pub const TAG_NAME: &str = "Name";
pub const TAG_ROLE: &str = "es_dist_role";
pub const TAG_PREFIX: &str = "exp_prefix";
pub const TAG_RUN: &str = "exp_name";

/// The four tags applied to the master instance and the worker group.
pub fn run_tags(run: &RunName, prefix: &str, role: Role) -> Vec<Tag> {
    vec![
        Tag::new(TAG_NAME, run.display_name(role)),
        Tag::new(TAG_ROLE, role.as_str()),
        Tag::new(TAG_PREFIX, prefix),
        Tag::new(TAG_RUN, run.as_str()),
    ]
}

/// The provisioned coordinator node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterNode {
    pub instance_id: String,
    /// Best-effort; may be absent for instances without a public interface.
    pub public_address: Option<String>,
    pub private_address: String,
}

/// The worker autoscaling group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFleet {
    pub group_name: String,
    pub launch_configuration_name: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
}

/// Result of one fully provisioned experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOutcome {
    pub run_name: RunName,
    pub experiment_prefix: String,
    pub image_id: String,
    pub master: MasterNode,
    pub fleet: WorkerFleet,
    pub console_url: String,
}

/// EC2 console URL listing instances sorted by their `Name` tag.
pub fn console_url(region: &str) -> String {
    format!("https://{region}.console.aws.amazon.com/ec2/v2/home?region={region}#Instances:sort=tag:Name")
}
