//! In-memory provider that records every call.
//!
//! Backs `esgrid launch --dry-run` and the provisioning tests. Instance
//! ids and addresses are synthesized from a counter; `RecordingBehavior`
//! injects delays, cardinality faults, and non-success statuses.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use esgrid_core::Tag;

use crate::provider::{
    Ack, CloudProvider, InstanceHandle, InstanceSpec, LaunchConfigurationRequest, ProviderError,
    ProviderResult, ScalingGroupRequest, SpotRequest, SpotRequestState,
};

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProviderCall {
    CreateInstance { spec: InstanceSpec },
    RequestSpotInstances { request: SpotRequest },
    SpotRequestState { request_id: String },
    DescribeInstance { instance_id: String },
    CreateTags { instance_id: String, tags: Vec<Tag> },
    CreateLaunchConfiguration { request: LaunchConfigurationRequest },
    CreateScalingGroup { request: ScalingGroupRequest },
}

impl ProviderCall {
    pub fn op(&self) -> &'static str {
        match self {
            ProviderCall::CreateInstance { .. } => "create_instance",
            ProviderCall::RequestSpotInstances { .. } => "request_spot_instances",
            ProviderCall::SpotRequestState { .. } => "spot_request_state",
            ProviderCall::DescribeInstance { .. } => "describe_instance",
            ProviderCall::CreateTags { .. } => "create_tags",
            ProviderCall::CreateLaunchConfiguration { .. } => "create_launch_configuration",
            ProviderCall::CreateScalingGroup { .. } => "create_scaling_group",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingBehavior {
    /// Number of request ids returned by a spot request.
    pub spot_request_ids: usize,
    /// State polls answered with `Pending` before a request is fulfilled.
    pub spot_pending_polls: u32,
    /// When set, spot requests end in `Failed` with this status.
    pub spot_terminal_status: Option<String>,
    /// Describe calls answered without a private address. Creation only
    /// returns an address when this is zero.
    pub address_delay: u32,
    /// Describe calls answered with `NotFound` before an instance is visible.
    pub missing_describes: u32,
    pub fail_create_instance: bool,
    pub fail_tags: bool,
    pub launch_configuration_status: u16,
    pub scaling_group_status: u16,
}

impl Default for RecordingBehavior {
    fn default() -> Self {
        Self {
            spot_request_ids: 1,
            spot_pending_polls: 0,
            spot_terminal_status: None,
            address_delay: 0,
            missing_describes: 0,
            fail_create_instance: false,
            fail_tags: false,
            launch_configuration_status: 200,
            scaling_group_status: 200,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<ProviderCall>,
    next_id: u32,
    /// instance id → (host number, describe calls so far)
    instances: HashMap<String, (u32, u32)>,
    /// request id → (state polls so far, instance once fulfilled)
    spot: HashMap<String, (u32, Option<String>)>,
}

impl State {
    fn new_instance(&mut self) -> String {
        self.next_id += 1;
        let id = format!("i-{:017x}", self.next_id);
        self.instances.insert(id.clone(), (self.next_id, 0));
        id
    }

    fn handle(&self, instance_id: &str, with_address: bool) -> ProviderResult<InstanceHandle> {
        let (host, _) = self
            .instances
            .get(instance_id)
            .ok_or_else(|| ProviderError::NotFound(instance_id.to_string()))?;
        Ok(InstanceHandle {
            instance_id: instance_id.to_string(),
            public_address: with_address.then(|| format!("203.0.113.{host}")),
            private_address: with_address.then(|| format!("10.0.0.{host}")),
        })
    }
}

#[derive(Debug, Default)]
pub struct RecordingProvider {
    behavior: RecordingBehavior,
    state: Mutex<State>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: RecordingBehavior) -> Self {
        Self {
            behavior,
            state: Mutex::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state().calls.clone()
    }

    /// Number of recorded calls for an operation name, e.g. `"create_tags"`.
    pub fn count(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn instance_specs(&self) -> Vec<InstanceSpec> {
        self.collect(|c| match c {
            ProviderCall::CreateInstance { spec } => Some(spec.clone()),
            _ => None,
        })
    }

    pub fn spot_requests(&self) -> Vec<SpotRequest> {
        self.collect(|c| match c {
            ProviderCall::RequestSpotInstances { request } => Some(request.clone()),
            _ => None,
        })
    }

    pub fn tag_calls(&self) -> Vec<(String, Vec<Tag>)> {
        self.collect(|c| match c {
            ProviderCall::CreateTags { instance_id, tags } => {
                Some((instance_id.clone(), tags.clone()))
            }
            _ => None,
        })
    }

    pub fn launch_configurations(&self) -> Vec<LaunchConfigurationRequest> {
        self.collect(|c| match c {
            ProviderCall::CreateLaunchConfiguration { request } => Some(request.clone()),
            _ => None,
        })
    }

    pub fn scaling_groups(&self) -> Vec<ScalingGroupRequest> {
        self.collect(|c| match c {
            ProviderCall::CreateScalingGroup { request } => Some(request.clone()),
            _ => None,
        })
    }

    fn collect<T>(&self, f: impl Fn(&ProviderCall) -> Option<T>) -> Vec<T> {
        self.state().calls.iter().filter_map(f).collect()
    }
}

impl CloudProvider for RecordingProvider {
    async fn create_instance(&self, spec: &InstanceSpec) -> ProviderResult<Vec<InstanceHandle>> {
        let mut state = self.state();
        state.calls.push(ProviderCall::CreateInstance { spec: spec.clone() });
        if self.behavior.fail_create_instance {
            return Err(ProviderError::Rejected("InsufficientInstanceCapacity".to_string()));
        }
        let id = state.new_instance();
        Ok(vec![state.handle(&id, self.behavior.address_delay == 0)?])
    }

    async fn request_spot_instances(&self, request: &SpotRequest) -> ProviderResult<Vec<String>> {
        let mut state = self.state();
        state.calls.push(ProviderCall::RequestSpotInstances {
            request: request.clone(),
        });
        let mut ids = Vec::with_capacity(self.behavior.spot_request_ids);
        for _ in 0..self.behavior.spot_request_ids {
            state.next_id += 1;
            let id = format!("sir-{:08x}", state.next_id);
            state.spot.insert(id.clone(), (0, None));
            ids.push(id);
        }
        Ok(ids)
    }

    async fn spot_request_state(&self, request_id: &str) -> ProviderResult<SpotRequestState> {
        let mut state = self.state();
        state.calls.push(ProviderCall::SpotRequestState {
            request_id: request_id.to_string(),
        });

        let (polls, fulfilled) = state
            .spot
            .get(request_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(request_id.to_string()))?;
        let polls = polls.saturating_add(1);

        if let Some(status) = &self.behavior.spot_terminal_status {
            state.spot.insert(request_id.to_string(), (polls, None));
            return Ok(SpotRequestState::Failed {
                status: status.clone(),
            });
        }

        if polls <= self.behavior.spot_pending_polls {
            state.spot.insert(request_id.to_string(), (polls, None));
            return Ok(SpotRequestState::Pending {
                status: "pending-fulfillment".to_string(),
            });
        }

        let instance_id = match fulfilled {
            Some(id) => id,
            None => state.new_instance(),
        };
        state
            .spot
            .insert(request_id.to_string(), (polls, Some(instance_id.clone())));
        Ok(SpotRequestState::Fulfilled { instance_id })
    }

    async fn describe_instance(&self, instance_id: &str) -> ProviderResult<InstanceHandle> {
        let mut state = self.state();
        state.calls.push(ProviderCall::DescribeInstance {
            instance_id: instance_id.to_string(),
        });
        let describes = match state.instances.get_mut(instance_id) {
            Some((_, describes)) => {
                *describes = describes.saturating_add(1);
                *describes
            }
            None => return Err(ProviderError::NotFound(instance_id.to_string())),
        };
        if describes <= self.behavior.missing_describes {
            return Err(ProviderError::NotFound(instance_id.to_string()));
        }
        state.handle(instance_id, describes > self.behavior.address_delay)
    }

    async fn create_tags(&self, instance_id: &str, tags: &[Tag]) -> ProviderResult<()> {
        let mut state = self.state();
        state.calls.push(ProviderCall::CreateTags {
            instance_id: instance_id.to_string(),
            tags: tags.to_vec(),
        });
        if self.behavior.fail_tags {
            return Err(ProviderError::Rejected("tag limit exceeded".to_string()));
        }
        Ok(())
    }

    async fn create_launch_configuration(
        &self,
        request: &LaunchConfigurationRequest,
    ) -> ProviderResult<Ack> {
        self.state().calls.push(ProviderCall::CreateLaunchConfiguration {
            request: request.clone(),
        });
        Ok(Ack {
            status: self.behavior.launch_configuration_status,
        })
    }

    async fn create_scaling_group(&self, request: &ScalingGroupRequest) -> ProviderResult<Ack> {
        self.state().calls.push(ProviderCall::CreateScalingGroup {
            request: request.clone(),
        });
        Ok(Ack {
            status: self.behavior.scaling_group_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> InstanceSpec {
        InstanceSpec {
            image_id: "ami-1".to_string(),
            key_name: "k".to_string(),
            instance_type: "t3.small".to_string(),
            security_group: "sg".to_string(),
            zone: "us-east-2a".to_string(),
            ebs_optimized: true,
            user_data: "#!/bin/bash\n".to_string(),
        }
    }

    #[tokio::test]
    async fn synthesized_addresses_are_distinct() {
        let provider = RecordingProvider::new();
        let a = provider.create_instance(&spec()).await.unwrap().remove(0);
        let b = provider.create_instance(&spec()).await.unwrap().remove(0);
        assert_ne!(a.instance_id, b.instance_id);
        assert_ne!(a.private_address, b.private_address);
        assert_eq!(provider.count("create_instance"), 2);
    }

    #[tokio::test]
    async fn describe_unknown_instance_is_not_found() {
        let provider = RecordingProvider::new();
        let err = provider.describe_instance("i-missing").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn fulfilled_spot_request_keeps_its_instance() {
        let provider = RecordingProvider::new();
        let request = SpotRequest {
            spot_price: "1.0".to_string(),
            instance_count: 1,
            instance: spec(),
        };
        let id = provider.request_spot_instances(&request).await.unwrap().remove(0);
        let first = provider.spot_request_state(&id).await.unwrap();
        let second = provider.spot_request_state(&id).await.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn calls_serialize_with_op_tag_and_without_user_data() {
        let call = ProviderCall::CreateInstance { spec: spec() };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["op"], "create_instance");
        assert_eq!(json["spec"]["image_id"], "ami-1");
        assert!(json["spec"].get("user_data").is_none());
    }
}
