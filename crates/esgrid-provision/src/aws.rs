//! EC2 and Auto Scaling implementation of [`CloudProvider`].

use std::error::Error;
use std::fmt::Debug;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_autoscaling as autoscaling;
use aws_sdk_ec2 as ec2;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    InstanceType, Placement, RequestSpotLaunchSpecification, SpotInstanceState, SpotPlacement,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::debug;

use esgrid_core::{Credentials, Tag};

use crate::provider::{
    Ack, CloudProvider, InstanceHandle, InstanceSpec, LaunchConfigurationRequest, ProviderError,
    ProviderResult, ScalingGroupRequest, SpotRequest, SpotRequestState,
};

pub struct AwsProvider {
    ec2: ec2::Client,
    autoscaling: autoscaling::Client,
}

impl AwsProvider {
    /// Build clients for `region`. Without explicit credentials the SDK's
    /// default chain (environment, profile, instance role) is used.
    pub async fn connect(region: &str, credentials: Option<Credentials>) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(c) = credentials {
            loader = loader.credentials_provider(ec2::config::Credentials::new(
                c.access_key_id,
                c.secret_access_key,
                None,
                None,
                "esgrid",
            ));
        }
        let shared = loader.load().await;
        debug!(region, "aws clients configured");

        Self {
            ec2: ec2::Client::new(&shared),
            autoscaling: autoscaling::Client::new(&shared),
        }
    }
}

fn classify<E, R>(err: SdkError<E, R>) -> ProviderError
where
    E: Error + 'static,
    R: Debug + 'static,
{
    match &err {
        SdkError::ServiceError(_) => ProviderError::Rejected(DisplayErrorContext(err).to_string()),
        _ => ProviderError::Transport(DisplayErrorContext(err).to_string()),
    }
}

/// Map "not found" service codes to `NotFound`, everything else via `classify`.
fn classify_lookup<E, R>(err: SdkError<E, R>, not_found_code: &str, id: &str) -> ProviderError
where
    E: Error + ProvideErrorMetadata + 'static,
    R: Debug + 'static,
{
    let code = err.as_service_error().and_then(|e| e.code()).map(str::to_string);
    if code.as_deref() == Some(not_found_code) {
        ProviderError::NotFound(id.to_string())
    } else {
        classify(err)
    }
}

fn instance_handle(instance: &ec2::types::Instance) -> ProviderResult<InstanceHandle> {
    let instance_id = instance
        .instance_id()
        .ok_or_else(|| ProviderError::UnexpectedResponse("instance without id".to_string()))?;
    Ok(InstanceHandle {
        instance_id: instance_id.to_string(),
        public_address: instance.public_ip_address().map(str::to_string),
        private_address: instance.private_ip_address().map(str::to_string),
    })
}

/// Map a spot request's status code and lifecycle state. A request only
/// counts as fulfilled once it names its instance.
fn spot_state(
    status_code: &str,
    state: Option<&SpotInstanceState>,
    instance_id: Option<&str>,
) -> SpotRequestState {
    if let (Some(instance_id), "fulfilled") = (instance_id, status_code) {
        return SpotRequestState::Fulfilled {
            instance_id: instance_id.to_string(),
        };
    }

    let status = status_code.to_string();
    match state {
        Some(SpotInstanceState::Cancelled | SpotInstanceState::Closed | SpotInstanceState::Failed) => {
            SpotRequestState::Failed { status }
        }
        _ => SpotRequestState::Pending { status },
    }
}

fn to_i32(name: &str, value: u32) -> ProviderResult<i32> {
    i32::try_from(value).map_err(|_| ProviderError::Rejected(format!("{name} out of range: {value}")))
}

impl CloudProvider for AwsProvider {
    async fn create_instance(&self, spec: &InstanceSpec) -> ProviderResult<Vec<InstanceHandle>> {
        let out = self
            .ec2
            .run_instances()
            .image_id(&spec.image_id)
            .key_name(&spec.key_name)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .ebs_optimized(spec.ebs_optimized)
            .security_groups(&spec.security_group)
            .placement(Placement::builder().availability_zone(&spec.zone).build())
            .min_count(1)
            .max_count(1)
            .user_data(BASE64.encode(&spec.user_data))
            .send()
            .await
            .map_err(classify)?;

        out.instances().iter().map(instance_handle).collect()
    }

    async fn request_spot_instances(&self, request: &SpotRequest) -> ProviderResult<Vec<String>> {
        let spec = &request.instance;
        let launch = RequestSpotLaunchSpecification::builder()
            .image_id(&spec.image_id)
            .key_name(&spec.key_name)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .ebs_optimized(spec.ebs_optimized)
            .security_groups(&spec.security_group)
            .placement(SpotPlacement::builder().availability_zone(&spec.zone).build())
            .user_data(BASE64.encode(&spec.user_data))
            .build();

        let out = self
            .ec2
            .request_spot_instances()
            .spot_price(&request.spot_price)
            .instance_count(to_i32("instance_count", request.instance_count)?)
            .launch_specification(launch)
            .send()
            .await
            .map_err(classify)?;

        Ok(out
            .spot_instance_requests()
            .iter()
            .filter_map(|r| r.spot_instance_request_id().map(str::to_string))
            .collect())
    }

    async fn spot_request_state(&self, request_id: &str) -> ProviderResult<SpotRequestState> {
        let out = self
            .ec2
            .describe_spot_instance_requests()
            .spot_instance_request_ids(request_id)
            .send()
            .await
            .map_err(|e| classify_lookup(e, "InvalidSpotInstanceRequestID.NotFound", request_id))?;

        let request = out
            .spot_instance_requests()
            .first()
            .ok_or_else(|| ProviderError::NotFound(request_id.to_string()))?;
        let status = request.status().and_then(|s| s.code()).unwrap_or("unknown");
        Ok(spot_state(status, request.state(), request.instance_id()))
    }

    async fn describe_instance(&self, instance_id: &str) -> ProviderResult<InstanceHandle> {
        let out = self
            .ec2
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| classify_lookup(e, "InvalidInstanceID.NotFound", instance_id))?;

        let instance = out
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
            .ok_or_else(|| ProviderError::NotFound(instance_id.to_string()))?;
        instance_handle(instance)
    }

    async fn create_tags(&self, instance_id: &str, tags: &[Tag]) -> ProviderResult<()> {
        let mut call = self.ec2.create_tags().resources(instance_id);
        for tag in tags {
            call = call.tags(
                ec2::types::Tag::builder()
                    .key(&tag.key)
                    .value(&tag.value)
                    .build(),
            );
        }
        call.send().await.map_err(classify)?;
        Ok(())
    }

    async fn create_launch_configuration(
        &self,
        request: &LaunchConfigurationRequest,
    ) -> ProviderResult<Ack> {
        self.autoscaling
            .create_launch_configuration()
            .launch_configuration_name(&request.name)
            .image_id(&request.image_id)
            .key_name(&request.key_name)
            .instance_type(&request.instance_type)
            .ebs_optimized(request.ebs_optimized)
            .security_groups(&request.security_group)
            .user_data(BASE64.encode(&request.user_data))
            .set_spot_price(request.spot_price.clone())
            .send()
            .await
            .map_err(classify)?;
        // The SDK surfaces every non-2xx response as an error.
        Ok(Ack::OK)
    }

    async fn create_scaling_group(&self, request: &ScalingGroupRequest) -> ProviderResult<Ack> {
        let mut call = self
            .autoscaling
            .create_auto_scaling_group()
            .auto_scaling_group_name(&request.name)
            .launch_configuration_name(&request.launch_configuration_name)
            .min_size(to_i32("min_size", request.min_size)?)
            .max_size(to_i32("max_size", request.max_size)?)
            .desired_capacity(to_i32("desired_capacity", request.desired_capacity)?)
            .default_cooldown(to_i32("default_cooldown", request.default_cooldown)?);

        for zone in &request.availability_zones {
            call = call.availability_zones(zone);
        }
        for tag in &request.tags {
            let tag = autoscaling::types::Tag::builder()
                .key(&tag.key)
                .value(&tag.value)
                .propagate_at_launch(true)
                .build()
                .map_err(|e| ProviderError::Rejected(e.to_string()))?;
            call = call.tags(tag);
        }

        call.send().await.map_err(classify)?;
        Ok(Ack::OK)
    }
}
