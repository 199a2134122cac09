//! Cloud provider capability interface.
//!
//! The provisioners only see these request/response shapes; provider SDK
//! types stay inside the implementations.

use std::future::Future;

use serde::Serialize;
use thiserror::Error;

use esgrid_core::Tag;

/// Errors returned by a provider implementation.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider refused the request (bad parameters, limits, auth).
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// The provider answered but a required field was missing.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Launch parameters shared by the on-demand and spot master paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSpec {
    pub image_id: String,
    pub key_name: String,
    pub instance_type: String,
    pub security_group: String,
    pub zone: String,
    pub ebs_optimized: bool,
    /// Plain-text boot script; implementations encode it as required.
    #[serde(skip)]
    pub user_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpotRequest {
    pub spot_price: String,
    pub instance_count: u32,
    pub instance: InstanceSpec,
}

/// A provider-side view of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceHandle {
    pub instance_id: String,
    pub public_address: Option<String>,
    pub private_address: Option<String>,
}

/// Status of a spot request as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SpotRequestState {
    /// Not yet fulfilled; `status` is the provider's status code.
    Pending { status: String },
    Fulfilled { instance_id: String },
    /// Terminal without an instance (cancelled, failed, closed).
    Failed { status: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchConfigurationRequest {
    pub name: String,
    pub image_id: String,
    pub key_name: String,
    pub instance_type: String,
    pub security_group: String,
    pub ebs_optimized: bool,
    pub spot_price: Option<String>,
    #[serde(skip)]
    pub user_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScalingGroupRequest {
    pub name: String,
    pub launch_configuration_name: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
    pub availability_zones: Vec<String>,
    pub default_cooldown: u32,
    pub tags: Vec<Tag>,
}

/// Acknowledgement of a synchronous create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub status: u16,
}

impl Ack {
    pub const OK: Ack = Ack { status: 200 };

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The provider operations the launch pipeline needs.
///
/// Every call is a single request; none of them are retried by callers.
pub trait CloudProvider: Send + Sync {
    /// Create one on-demand instance. Returns the created instances, which
    /// are usually still pending and may not have addresses yet.
    fn create_instance(
        &self,
        spec: &InstanceSpec,
    ) -> impl Future<Output = ProviderResult<Vec<InstanceHandle>>> + Send;

    /// Issue a spot request. Returns the spot request ids.
    fn request_spot_instances(
        &self,
        request: &SpotRequest,
    ) -> impl Future<Output = ProviderResult<Vec<String>>> + Send;

    fn spot_request_state(
        &self,
        request_id: &str,
    ) -> impl Future<Output = ProviderResult<SpotRequestState>> + Send;

    fn describe_instance(
        &self,
        instance_id: &str,
    ) -> impl Future<Output = ProviderResult<InstanceHandle>> + Send;

    fn create_tags(
        &self,
        instance_id: &str,
        tags: &[Tag],
    ) -> impl Future<Output = ProviderResult<()>> + Send;

    fn create_launch_configuration(
        &self,
        request: &LaunchConfigurationRequest,
    ) -> impl Future<Output = ProviderResult<Ack>> + Send;

    fn create_scaling_group(
        &self,
        request: &ScalingGroupRequest,
    ) -> impl Future<Output = ProviderResult<Ack>> + Send;
}
