//! Resolved provisioning parameters for one invocation.

use serde::Serialize;

use crate::error::{LaunchError, LaunchResult};
use crate::image::ImageResolver;
use crate::types::console_url;

/// Everything the provisioners need, built once from `esgrid.toml`,
/// environment defaults, and command-line flags. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchConfig {
    pub region: String,
    pub zone: String,
    pub security_group: String,
    pub key_name: String,
    pub master_instance_type: String,
    pub worker_instance_type: String,
    pub cluster_size: u32,
    /// Bid price as a decimal string. Required when `spot_master` is set;
    /// when present, workers are requested as spot instances too.
    pub spot_price: Option<String>,
    pub spot_master: bool,
    pub algorithm: String,
    pub images: ImageResolver,
    /// Accepted for compatibility with older launch flags; not used here.
    pub archive_excludes: Vec<String>,
}

impl LaunchConfig {
    pub fn default_archive_excludes() -> Vec<String> {
        [".git", "__pycache__", ".idea", "scratch"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Check every parameter a provider call depends on.
    pub fn validate(&self) -> LaunchResult<()> {
        let required = [
            ("region", &self.region),
            ("zone", &self.zone),
            ("security_group", &self.security_group),
            ("key_name", &self.key_name),
            ("master_instance_type", &self.master_instance_type),
            ("worker_instance_type", &self.worker_instance_type),
            ("algorithm", &self.algorithm),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(LaunchError::configuration(format!(
                    "missing required parameter `{name}`"
                )));
            }
        }

        let token = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.');
        if !self.algorithm.chars().all(token) {
            return Err(LaunchError::configuration(format!(
                "algorithm must be a plain token, got {:?}",
                self.algorithm
            )));
        }

        if self.cluster_size == 0 {
            return Err(LaunchError::configuration(
                "cluster_size must be a positive integer",
            ));
        }

        match self.spot_price.as_deref() {
            Some(price) => validate_spot_price(price)?,
            None if self.spot_master => {
                return Err(LaunchError::configuration(
                    "spot_master requires spot_price",
                ));
            }
            None => {}
        }

        Ok(())
    }

    pub fn console_url(&self) -> String {
        console_url(&self.region)
    }
}

fn validate_spot_price(price: &str) -> LaunchResult<()> {
    match price.trim().parse::<f64>() {
        Ok(p) if p.is_finite() && p > 0.0 => Ok(()),
        _ => Err(LaunchError::configuration(format!(
            "spot_price must be a positive decimal, got {price:?}"
        ))),
    }
}
