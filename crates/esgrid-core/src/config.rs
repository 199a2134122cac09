//! esgrid.toml configuration parser and environment defaults.
//!
//! Values are layered lowest to highest: built-in defaults, `esgrid.toml`,
//! environment variables, command-line flags. Every layer is expressed as a
//! `LaunchSettings` of optional fields and merged before validation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LaunchError, LaunchResult};
use crate::image::ImageResolver;
use crate::launch::LaunchConfig;

pub const ENV_ACCESS_KEY: &str = "AWS_ACCESS_KEY";
pub const ENV_ACCESS_SECRET: &str = "AWS_ACCESS_SECRET";
pub const ENV_KEY_NAME: &str = "KEY_NAME";
pub const ENV_IMAGE: &str = "AWS_AMI";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EsgridConfig {
    pub launch: LaunchSettings,
    /// Region → image id.
    pub images: BTreeMap<String, String>,
    pub spot: SpotSettings,
    pub master: MasterSettings,
    pub batch: BatchSettings,
    pub bootstrap: BootstrapSettings,
}

/// Launch parameters where every field may be left unset by a layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSettings {
    pub region: Option<String>,
    pub zone: Option<String>,
    pub security_group: Option<String>,
    pub key_name: Option<String>,
    pub master_instance_type: Option<String>,
    pub worker_instance_type: Option<String>,
    pub cluster_size: Option<u32>,
    pub spot_price: Option<String>,
    pub spot_master: Option<bool>,
    pub algorithm: Option<String>,
    pub archive_excludes: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotSettings {
    pub poll_interval: String,
    pub timeout: String,
}

impl Default for SpotSettings {
    fn default() -> Self {
        Self {
            poll_interval: "15s".to_string(),
            timeout: "10m".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterSettings {
    /// How long to wait for the master to report a private address.
    pub address_timeout: String,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            address_timeout: "5m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub continue_on_error: bool,
}

/// Overrides for the boot-script runtime user and paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    pub user: Option<String>,
    pub code_dir: Option<String>,
    pub log_file: Option<String>,
}

impl EsgridConfig {
    pub fn from_file(path: &Path) -> LaunchResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LaunchError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| LaunchError::configuration(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load `path` if given, otherwise `./esgrid.toml` if it exists,
    /// otherwise defaults.
    pub fn load(path: Option<&Path>) -> LaunchResult<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => {
                let local = Path::new("esgrid.toml");
                if local.is_file() {
                    Self::from_file(local)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn to_toml_string(&self) -> LaunchResult<String> {
        toml::to_string_pretty(self).map_err(|e| LaunchError::configuration(e.to_string()))
    }

    pub fn spot_poll_interval(&self) -> LaunchResult<Duration> {
        duration_setting("spot.poll_interval", &self.spot.poll_interval)
    }

    pub fn spot_timeout(&self) -> LaunchResult<Duration> {
        duration_setting("spot.timeout", &self.spot.timeout)
    }

    pub fn master_address_timeout(&self) -> LaunchResult<Duration> {
        duration_setting("master.address_timeout", &self.master.address_timeout)
    }

    pub fn image_resolver(&self, env: &Environment) -> ImageResolver {
        ImageResolver::new(self.images.clone(), env.default_image.clone())
    }

    /// Merge file, environment, and flag layers into a validated config.
    pub fn resolve_launch(
        &self,
        env: &Environment,
        flags: LaunchSettings,
    ) -> LaunchResult<LaunchConfig> {
        self.launch
            .clone()
            .merge(env.launch_settings())
            .merge(flags)
            .into_launch_config(self.image_resolver(env))
    }
}

impl LaunchSettings {
    /// Overlay `upper` on top of `self`; set fields in `upper` win.
    pub fn merge(self, upper: LaunchSettings) -> LaunchSettings {
        LaunchSettings {
            region: upper.region.or(self.region),
            zone: upper.zone.or(self.zone),
            security_group: upper.security_group.or(self.security_group),
            key_name: upper.key_name.or(self.key_name),
            master_instance_type: upper.master_instance_type.or(self.master_instance_type),
            worker_instance_type: upper.worker_instance_type.or(self.worker_instance_type),
            cluster_size: upper.cluster_size.or(self.cluster_size),
            spot_price: upper.spot_price.or(self.spot_price),
            spot_master: upper.spot_master.or(self.spot_master),
            algorithm: upper.algorithm.or(self.algorithm),
            archive_excludes: upper.archive_excludes.or(self.archive_excludes),
        }
    }

    pub fn into_launch_config(self, images: ImageResolver) -> LaunchResult<LaunchConfig> {
        let config = LaunchConfig {
            region: required("region", self.region)?,
            zone: required("zone", self.zone)?,
            security_group: required("security_group", self.security_group)?,
            key_name: required("key_name", self.key_name)?,
            master_instance_type: required("master_instance_type", self.master_instance_type)?,
            worker_instance_type: required("worker_instance_type", self.worker_instance_type)?,
            cluster_size: self.cluster_size.unwrap_or(1),
            spot_price: self.spot_price.filter(|p| !p.trim().is_empty()),
            spot_master: self.spot_master.unwrap_or(false),
            algorithm: required("algorithm", self.algorithm)?,
            images,
            archive_excludes: self
                .archive_excludes
                .unwrap_or_else(LaunchConfig::default_archive_excludes),
        };
        config.validate()?;
        Ok(config)
    }
}

fn required(name: &str, value: Option<String>) -> LaunchResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| LaunchError::configuration(format!("missing required parameter `{name}`")))
}

fn duration_setting(name: &str, value: &str) -> LaunchResult<Duration> {
    parse_duration(value).ok_or_else(|| {
        LaunchError::configuration(format!("{name}: invalid duration {value:?}"))
    })
}

/// Parse a duration string like "30s", "5m", "1h", or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, unit) = if let Some(v) = s.strip_suffix('s') {
        (v, 1)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3600)
    } else {
        (s, 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(unit))
        .map(Duration::from_secs)
}

/// Provider credential pair. Debug output never includes the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Environment-derived defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub key_name: Option<String>,
    pub default_image: Option<String>,
}

impl Environment {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            access_key_id: get(ENV_ACCESS_KEY),
            secret_access_key: get(ENV_ACCESS_SECRET),
            key_name: get(ENV_KEY_NAME),
            default_image: get(ENV_IMAGE),
        }
    }

    /// Both halves of the credential pair, or `None` to defer to the
    /// provider's default credential chain.
    pub fn credentials(&self) -> LaunchResult<Option<Credentials>> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) => Ok(Some(Credentials {
                access_key_id: id.clone(),
                secret_access_key: secret.clone(),
            })),
            (None, None) => Ok(None),
            (Some(_), None) => Err(LaunchError::configuration(format!(
                "{ENV_ACCESS_KEY} is set but {ENV_ACCESS_SECRET} is missing"
            ))),
            (None, Some(_)) => Err(LaunchError::configuration(format!(
                "{ENV_ACCESS_SECRET} is set but {ENV_ACCESS_KEY} is missing"
            ))),
        }
    }

    fn launch_settings(&self) -> LaunchSettings {
        LaunchSettings {
            key_name: self.key_name.clone(),
            ..LaunchSettings::default()
        }
    }
}
