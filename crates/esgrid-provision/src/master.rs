//! Master provisioner — creates the single coordinator node.
//!
//! Two paths, selected by `LaunchConfig::spot_master`:
//!
//! ```text
//! on-demand: create_instance ─────────────────────────────┐
//! spot:      request_spot ─ poll state until fulfilled ─ describe
//!                                                         │
//!            create_tags ─ poll describe until private address known
//! ```
//!
//! Both paths tag the instance as soon as its id is known, then wait for a
//! private address so the worker fleet is never bound to an empty one.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use esgrid_core::{
    LaunchConfig, LaunchError, LaunchResult, LaunchStep, MasterNode, Role, RunName, run_tags,
};

use crate::provider::{
    CloudProvider, InstanceHandle, InstanceSpec, ProviderError, SpotRequest, SpotRequestState,
};

/// Poll cadence and upper bounds for the asynchronous waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSettings {
    pub poll_interval: Duration,
    /// Upper bound on the spot-fulfillment wait.
    pub spot_timeout: Duration,
    /// Upper bound on the wait for the master's private address.
    pub address_timeout: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            spot_timeout: Duration::from_secs(600),
            address_timeout: Duration::from_secs(300),
        }
    }
}

pub struct MasterProvisioner<'a, P> {
    provider: &'a P,
    config: &'a LaunchConfig,
    waits: WaitSettings,
}

impl<'a, P: CloudProvider> MasterProvisioner<'a, P> {
    pub fn new(provider: &'a P, config: &'a LaunchConfig, waits: WaitSettings) -> Self {
        Self {
            provider,
            config,
            waits,
        }
    }

    /// Create, tag, and await the master node.
    pub async fn provision(
        &self,
        run: &RunName,
        prefix: &str,
        image_id: &str,
        user_data: &str,
    ) -> LaunchResult<MasterNode> {
        let spec = InstanceSpec {
            image_id: image_id.to_string(),
            key_name: self.config.key_name.clone(),
            instance_type: self.config.master_instance_type.clone(),
            security_group: self.config.security_group.clone(),
            zone: self.config.zone.clone(),
            ebs_optimized: true,
            user_data: user_data.to_string(),
        };

        let handle = if self.config.spot_master {
            self.launch_spot(&spec).await?
        } else {
            self.launch_on_demand(&spec).await?
        };

        let tags = run_tags(run, prefix, Role::Master);
        self.provider
            .create_tags(&handle.instance_id, &tags)
            .await
            .map_err(|e| LaunchError::provisioning(LaunchStep::TagMaster, e))?;
        info!(run = %run, instance = %handle.instance_id, "master tagged");

        self.await_private_address(handle).await
    }

    async fn launch_on_demand(&self, spec: &InstanceSpec) -> LaunchResult<InstanceHandle> {
        let mut created = self
            .provider
            .create_instance(spec)
            .await
            .map_err(|e| LaunchError::provisioning(LaunchStep::CreateMaster, e))?;

        if created.len() != 1 {
            return Err(LaunchError::provisioning(
                LaunchStep::CreateMaster,
                format!("expected exactly one instance, provider returned {}", created.len()),
            ));
        }
        let handle = created.remove(0);

        info!(
            instance = %handle.instance_id,
            instance_type = %spec.instance_type,
            zone = %spec.zone,
            "on-demand master created"
        );
        Ok(handle)
    }

    async fn launch_spot(&self, spec: &InstanceSpec) -> LaunchResult<InstanceHandle> {
        let spot_price = self
            .config
            .spot_price
            .clone()
            .ok_or_else(|| LaunchError::configuration("spot_master requires spot_price"))?;

        let request = SpotRequest {
            spot_price,
            instance_count: 1,
            instance: spec.clone(),
        };
        let ids = self
            .provider
            .request_spot_instances(&request)
            .await
            .map_err(|e| LaunchError::provisioning(LaunchStep::RequestSpot, e))?;

        let [request_id] = ids.as_slice() else {
            return Err(LaunchError::provisioning(
                LaunchStep::RequestSpot,
                format!("expected exactly one spot request id, provider returned {}", ids.len()),
            ));
        };

        info!(
            request = %request_id,
            price = %request.spot_price,
            "waiting for spot request to be fulfilled"
        );
        let instance_id = self.await_fulfillment(request_id).await?;

        match self.provider.describe_instance(&instance_id).await {
            Ok(handle) => Ok(handle),
            // A just-fulfilled instance can be briefly invisible; the address
            // wait keeps describing it.
            Err(ProviderError::NotFound(_)) => {
                debug!(instance = %instance_id, "spot instance not visible yet");
                Ok(InstanceHandle {
                    instance_id,
                    public_address: None,
                    private_address: None,
                })
            }
            Err(e) => Err(LaunchError::provisioning(LaunchStep::DescribeMaster, e)),
        }
    }

    async fn await_fulfillment(&self, request_id: &str) -> LaunchResult<String> {
        let started = Instant::now();
        let deadline = started + self.waits.spot_timeout;

        loop {
            match self.provider.spot_request_state(request_id).await {
                Ok(SpotRequestState::Fulfilled { instance_id }) => {
                    info!(
                        request = %request_id,
                        instance = %instance_id,
                        waited_secs = started.elapsed().as_secs(),
                        "spot request fulfilled"
                    );
                    return Ok(instance_id);
                }
                Ok(SpotRequestState::Failed { status }) => {
                    return Err(LaunchError::provisioning(
                        LaunchStep::WaitSpot,
                        format!("spot request {request_id} ended without an instance: {status}"),
                    ));
                }
                Ok(SpotRequestState::Pending { status }) => {
                    debug!(request = %request_id, %status, "spot request pending");
                }
                // Freshly issued requests can be briefly invisible to describe calls.
                Err(ProviderError::NotFound(_)) => {
                    debug!(request = %request_id, "spot request not visible yet");
                }
                Err(e) => return Err(LaunchError::provisioning(LaunchStep::WaitSpot, e)),
            }

            if Instant::now() >= deadline {
                warn!(request = %request_id, "spot request not fulfilled before timeout");
                return Err(LaunchError::provisioning(
                    LaunchStep::WaitSpot,
                    format!(
                        "spot request {request_id} not fulfilled within {}s",
                        self.waits.spot_timeout.as_secs()
                    ),
                ));
            }
            sleep(self.waits.poll_interval).await;
        }
    }

    async fn await_private_address(&self, mut handle: InstanceHandle) -> LaunchResult<MasterNode> {
        let deadline = Instant::now() + self.waits.address_timeout;

        loop {
            if let Some(private_address) = handle.private_address.as_deref().filter(|a| !a.is_empty()) {
                info!(
                    instance = %handle.instance_id,
                    private = %private_address,
                    public = handle.public_address.as_deref().unwrap_or("-"),
                    "master address known"
                );
                return Ok(MasterNode {
                    private_address: private_address.to_string(),
                    instance_id: handle.instance_id,
                    public_address: handle.public_address.filter(|a| !a.is_empty()),
                });
            }

            if Instant::now() >= deadline {
                return Err(LaunchError::provisioning(
                    LaunchStep::MasterAddress,
                    format!(
                        "instance {} reported no private address within {}s",
                        handle.instance_id,
                        self.waits.address_timeout.as_secs()
                    ),
                ));
            }

            debug!(instance = %handle.instance_id, "master has no private address yet");
            sleep(self.waits.poll_interval).await;

            match self.provider.describe_instance(&handle.instance_id).await {
                Ok(latest) => handle = latest,
                Err(ProviderError::NotFound(_)) => {}
                Err(e) => return Err(LaunchError::provisioning(LaunchStep::DescribeMaster, e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{RecordingBehavior, RecordingProvider};
    use chrono::TimeZone;
    use esgrid_core::{ImageResolver, TAG_NAME, TAG_ROLE, Tag};

    fn config(spot_master: bool) -> LaunchConfig {
        LaunchConfig {
            region: "us-east-2".to_string(),
            zone: "us-east-2a".to_string(),
            security_group: "es".to_string(),
            key_name: "ops".to_string(),
            master_instance_type: "r4.xlarge".to_string(),
            worker_instance_type: "c5.18xlarge".to_string(),
            cluster_size: 3,
            spot_price: spot_master.then(|| "1.25".to_string()),
            spot_master,
            algorithm: "es".to_string(),
            images: ImageResolver::default(),
            archive_excludes: Vec::new(),
        }
    }

    fn run() -> RunName {
        RunName::new("demo", chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    fn waits() -> WaitSettings {
        WaitSettings {
            poll_interval: Duration::from_secs(5),
            spot_timeout: Duration::from_secs(60),
            address_timeout: Duration::from_secs(30),
        }
    }

    async fn provision(provider: &RecordingProvider, config: &LaunchConfig) -> LaunchResult<MasterNode> {
        MasterProvisioner::new(provider, config, waits())
            .provision(&run(), "demo", "ami-123", "#!/bin/bash\n")
            .await
    }

    #[tokio::test]
    async fn on_demand_issues_one_create_and_no_spot_calls() {
        let provider = RecordingProvider::new();
        let master = provision(&provider, &config(false)).await.unwrap();

        assert_eq!(provider.count("create_instance"), 1);
        assert_eq!(provider.count("request_spot_instances"), 0);
        assert_eq!(provider.count("spot_request_state"), 0);
        assert!(!master.private_address.is_empty());
    }

    #[tokio::test]
    async fn on_demand_passes_launch_parameters() {
        let provider = RecordingProvider::new();
        provision(&provider, &config(false)).await.unwrap();

        let spec = provider.instance_specs().remove(0);
        assert_eq!(spec.image_id, "ami-123");
        assert_eq!(spec.instance_type, "r4.xlarge");
        assert_eq!(spec.zone, "us-east-2a");
        assert_eq!(spec.security_group, "es");
        assert!(spec.ebs_optimized);
        assert_eq!(spec.user_data, "#!/bin/bash\n");
    }

    #[tokio::test]
    async fn master_gets_four_tags() {
        let provider = RecordingProvider::new();
        let master = provision(&provider, &config(false)).await.unwrap();

        let (instance, tags) = provider.tag_calls().remove(0);
        assert_eq!(instance, master.instance_id);
        assert_eq!(tags.len(), 4);
        assert!(tags.contains(&Tag::new(TAG_NAME, "demo_20240101-000000-master")));
        assert!(tags.contains(&Tag::new(TAG_ROLE, "master")));
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_waits_for_private_address() {
        let provider = RecordingProvider::with_behavior(RecordingBehavior {
            address_delay: 2,
            ..RecordingBehavior::default()
        });
        let master = provision(&provider, &config(false)).await.unwrap();

        assert!(!master.private_address.is_empty());
        assert_eq!(provider.count("describe_instance"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn address_wait_times_out() {
        let provider = RecordingProvider::with_behavior(RecordingBehavior {
            address_delay: u32::MAX,
            ..RecordingBehavior::default()
        });
        let err = provision(&provider, &config(false)).await.unwrap_err();

        assert_eq!(err.step(), Some(LaunchStep::MasterAddress));
        // Tagged before the wait started.
        assert_eq!(provider.count("create_tags"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spot_issues_one_request_and_waits() {
        let provider = RecordingProvider::with_behavior(RecordingBehavior {
            spot_pending_polls: 3,
            ..RecordingBehavior::default()
        });
        let master = provision(&provider, &config(true)).await.unwrap();

        assert_eq!(provider.count("request_spot_instances"), 1);
        assert_eq!(provider.count("create_instance"), 0);
        assert_eq!(provider.count("spot_request_state"), 4);
        assert_eq!(provider.count("create_tags"), 1);
        assert!(!master.private_address.is_empty());

        let request = provider.spot_requests().remove(0);
        assert_eq!(request.spot_price, "1.25");
        assert_eq!(request.instance_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spot_instance_briefly_invisible_after_fulfillment() {
        let provider = RecordingProvider::with_behavior(RecordingBehavior {
            missing_describes: 1,
            ..RecordingBehavior::default()
        });
        let master = provision(&provider, &config(true)).await.unwrap();

        assert_eq!(provider.count("describe_instance"), 2);
        let (tagged, _) = provider.tag_calls().remove(0);
        assert_eq!(tagged, master.instance_id);
        assert!(!master.private_address.is_empty());
    }

    #[tokio::test]
    async fn spot_cardinality_mismatch_fails_before_wait_or_tagging() {
        for ids in [0, 2] {
            let provider = RecordingProvider::with_behavior(RecordingBehavior {
                spot_request_ids: ids,
                ..RecordingBehavior::default()
            });
            let err = provision(&provider, &config(true)).await.unwrap_err();

            assert_eq!(err.step(), Some(LaunchStep::RequestSpot));
            assert_eq!(provider.count("spot_request_state"), 0);
            assert_eq!(provider.count("create_tags"), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spot_wait_times_out() {
        let provider = RecordingProvider::with_behavior(RecordingBehavior {
            spot_pending_polls: u32::MAX,
            ..RecordingBehavior::default()
        });
        let err = provision(&provider, &config(true)).await.unwrap_err();

        assert_eq!(err.step(), Some(LaunchStep::WaitSpot));
        assert!(err.to_string().contains("within 60s"));
        // 60s budget at a 5s interval: the first poll plus one per interval.
        assert_eq!(provider.count("spot_request_state"), 13);
        assert_eq!(provider.count("create_tags"), 0);
    }

    #[tokio::test]
    async fn spot_terminal_state_fails_immediately() {
        let provider = RecordingProvider::with_behavior(RecordingBehavior {
            spot_terminal_status: Some("price-too-low".to_string()),
            ..RecordingBehavior::default()
        });
        let err = provision(&provider, &config(true)).await.unwrap_err();

        assert_eq!(err.step(), Some(LaunchStep::WaitSpot));
        assert!(err.to_string().contains("price-too-low"));
        assert_eq!(provider.count("spot_request_state"), 1);
    }

    #[tokio::test]
    async fn tagging_failure_is_surfaced() {
        let provider = RecordingProvider::with_behavior(RecordingBehavior {
            fail_tags: true,
            ..RecordingBehavior::default()
        });
        let err = provision(&provider, &config(false)).await.unwrap_err();
        assert_eq!(err.step(), Some(LaunchStep::TagMaster));
    }

    #[tokio::test]
    async fn create_failure_is_provisioning_error() {
        let provider = RecordingProvider::with_behavior(RecordingBehavior {
            fail_create_instance: true,
            ..RecordingBehavior::default()
        });
        let err = provision(&provider, &config(false)).await.unwrap_err();
        assert_eq!(err.step(), Some(LaunchStep::CreateMaster));
        assert_eq!(provider.count("create_tags"), 0);
    }
}
