//! esgrid-core — shared types for the esgrid cluster launcher.
//!
//! A launch provisions one coordinator ("master") node plus an autoscaling
//! group of workers bound to the master's private address. This crate holds
//! everything the launch pipeline agrees on:
//!
//! - `ExperimentSpec`: the opaque experiment document and its prefix
//! - `RunName`: `{prefix}_{UTC timestamp}`, shared by every tag and resource
//! - `LaunchConfig`: the validated provisioning parameters
//! - `ImageResolver`: region → machine image lookup with a global fallback
//! - `EsgridConfig`: the `esgrid.toml` file and environment defaults
//! - `LaunchError`: the configuration / provisioning / input taxonomy

pub mod config;
pub mod error;
pub mod image;
pub mod launch;
pub mod types;

pub use config::{Credentials, Environment, EsgridConfig, LaunchSettings, parse_duration};
pub use error::{LaunchError, LaunchResult, LaunchStep};
pub use image::ImageResolver;
pub use launch::LaunchConfig;
pub use types::*;
