//! Launch error types.

use std::fmt;

use thiserror::Error;

/// The provisioning step that was running when a launch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStep {
    ResolveImage,
    CreateMaster,
    RequestSpot,
    WaitSpot,
    DescribeMaster,
    MasterAddress,
    TagMaster,
    CreateLaunchConfiguration,
    CreateScalingGroup,
}

impl LaunchStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchStep::ResolveImage => "resolve-image",
            LaunchStep::CreateMaster => "create-master",
            LaunchStep::RequestSpot => "request-spot",
            LaunchStep::WaitSpot => "wait-spot",
            LaunchStep::DescribeMaster => "describe-master",
            LaunchStep::MasterAddress => "master-address",
            LaunchStep::TagMaster => "tag-master",
            LaunchStep::CreateLaunchConfiguration => "create-launch-configuration",
            LaunchStep::CreateScalingGroup => "create-scaling-group",
        }
    }
}

impl fmt::Display for LaunchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that abort the provisioning of a single experiment.
///
/// None of these are retried, and resources created before the failure
/// are left in place for the operator to inspect or clean up.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Unresolvable image id, or a missing/invalid parameter or credential.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A provider call failed, returned an unexpected cardinality or
    /// status, or an asynchronous wait timed out.
    #[error("provisioning error at {step}: {message}")]
    Provisioning { step: LaunchStep, message: String },

    /// The experiment document is unreadable, not JSON, or lacks a field.
    #[error("input error in {document}: {message}")]
    Input { document: String, message: String },
}

impl LaunchError {
    pub fn configuration(message: impl Into<String>) -> Self {
        LaunchError::Configuration(message.into())
    }

    pub fn provisioning(step: LaunchStep, message: impl fmt::Display) -> Self {
        LaunchError::Provisioning {
            step,
            message: message.to_string(),
        }
    }

    pub fn input(document: impl Into<String>, message: impl Into<String>) -> Self {
        LaunchError::Input {
            document: document.into(),
            message: message.into(),
        }
    }

    /// The failing step, for provisioning errors.
    pub fn step(&self) -> Option<LaunchStep> {
        match self {
            LaunchError::Provisioning { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Short category label used in logs and operator reports.
    pub fn kind(&self) -> &'static str {
        match self {
            LaunchError::Configuration(_) => "configuration",
            LaunchError::Provisioning { .. } => "provisioning",
            LaunchError::Input { .. } => "input",
        }
    }
}

pub type LaunchResult<T> = Result<T, LaunchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_error_names_step() {
        let err = LaunchError::provisioning(LaunchStep::WaitSpot, "timed out after 600s");
        assert_eq!(err.step(), Some(LaunchStep::WaitSpot));
        assert_eq!(
            err.to_string(),
            "provisioning error at wait-spot: timed out after 600s"
        );
    }

    #[test]
    fn kinds() {
        assert_eq!(LaunchError::configuration("x").kind(), "configuration");
        assert_eq!(LaunchError::input("exp.json", "bad").kind(), "input");
        assert!(LaunchError::configuration("x").step().is_none());
    }
}
