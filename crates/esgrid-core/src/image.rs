//! Machine image resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{LaunchError, LaunchResult};

/// Maps a region to a machine image id.
///
/// Lookup order is the static region table first, then the global
/// fallback image. Empty entries count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResolver {
    regions: BTreeMap<String, String>,
    fallback: Option<String>,
}

impl ImageResolver {
    pub fn new<K, V>(regions: impl IntoIterator<Item = (K, V)>, fallback: Option<String>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            regions: regions
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            fallback,
        }
    }

    pub fn with_fallback(mut self, fallback: Option<String>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn fallback(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    pub fn regions(&self) -> &BTreeMap<String, String> {
        &self.regions
    }

    pub fn resolve(&self, region: &str) -> LaunchResult<String> {
        let mapped = self.regions.get(region).map(|s| s.trim()).filter(|s| !s.is_empty());
        let fallback = self.fallback.as_deref().map(str::trim).filter(|s| !s.is_empty());

        mapped.or(fallback).map(str::to_string).ok_or_else(|| {
            LaunchError::configuration(format!(
                "no machine image for region {region}: add it under [images] or set AWS_AMI"
            ))
        })
    }
}
