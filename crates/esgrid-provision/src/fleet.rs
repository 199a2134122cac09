//! Worker fleet provisioner — launch configuration plus autoscaling group.
//!
//! Requires a `MasterNode`, so the fleet cannot be created before the
//! master's private address is known. A failure here leaves the master
//! running; nothing is rolled back.

use tracing::info;

use esgrid_core::{
    LaunchConfig, LaunchError, LaunchResult, LaunchStep, MasterNode, Role, RunName, WorkerFleet,
    run_tags,
};

use crate::provider::{Ack, CloudProvider, LaunchConfigurationRequest, ScalingGroupRequest};

pub struct FleetProvisioner<'a, P> {
    provider: &'a P,
    config: &'a LaunchConfig,
}

impl<'a, P: CloudProvider> FleetProvisioner<'a, P> {
    pub fn new(provider: &'a P, config: &'a LaunchConfig) -> Self {
        Self { provider, config }
    }

    /// Create the launch configuration and scaling group, both named after
    /// the run. `user_data` is the worker boot script for `master`.
    pub async fn provision(
        &self,
        run: &RunName,
        prefix: &str,
        image_id: &str,
        user_data: &str,
        master: &MasterNode,
    ) -> LaunchResult<WorkerFleet> {
        if master.private_address.trim().is_empty() {
            return Err(LaunchError::provisioning(
                LaunchStep::CreateLaunchConfiguration,
                format!("master {} has no private address", master.instance_id),
            ));
        }

        let launch_configuration = LaunchConfigurationRequest {
            name: run.to_string(),
            image_id: image_id.to_string(),
            key_name: self.config.key_name.clone(),
            instance_type: self.config.worker_instance_type.clone(),
            security_group: self.config.security_group.clone(),
            ebs_optimized: true,
            spot_price: self.config.spot_price.clone(),
            user_data: user_data.to_string(),
        };
        let ack = self
            .provider
            .create_launch_configuration(&launch_configuration)
            .await
            .map_err(|e| LaunchError::provisioning(LaunchStep::CreateLaunchConfiguration, e))?;
        check_ack(LaunchStep::CreateLaunchConfiguration, ack)?;
        info!(
            run = %run,
            instance_type = %launch_configuration.instance_type,
            spot = launch_configuration.spot_price.is_some(),
            master = %master.private_address,
            "launch configuration created"
        );

        let size = self.config.cluster_size;
        let group = ScalingGroupRequest {
            name: run.to_string(),
            launch_configuration_name: launch_configuration.name.clone(),
            min_size: size,
            max_size: size,
            desired_capacity: size,
            availability_zones: vec![self.config.zone.clone()],
            default_cooldown: 0,
            tags: run_tags(run, prefix, Role::Worker),
        };
        let ack = self
            .provider
            .create_scaling_group(&group)
            .await
            .map_err(|e| LaunchError::provisioning(LaunchStep::CreateScalingGroup, e))?;
        check_ack(LaunchStep::CreateScalingGroup, ack)?;
        info!(run = %run, size, zone = %self.config.zone, "scaling group created");

        Ok(WorkerFleet {
            group_name: group.name,
            launch_configuration_name: group.launch_configuration_name,
            min_size: group.min_size,
            max_size: group.max_size,
            desired_capacity: group.desired_capacity,
        })
    }
}

fn check_ack(step: LaunchStep, ack: Ack) -> LaunchResult<()> {
    if ack.is_success() {
        Ok(())
    } else {
        Err(LaunchError::provisioning(
            step,
            format!("provider returned status {}", ack.status),
        ))
    }
}
