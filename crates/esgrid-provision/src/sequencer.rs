//! Launch sequencer — provisions one cluster per experiment, in order.
//!
//! For each experiment: load → confirm → derive run name → resolve image →
//! master script → master → worker script → fleet → report. Experiments
//! never interleave and share no state. A failed experiment either stops
//! the batch or is recorded and skipped, per `BatchPolicy`.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use esgrid_core::{
    ExperimentSource, ExperimentSpec, LaunchConfig, LaunchError, LaunchOutcome, LaunchResult,
    MasterNode, RunName, WorkerFleet,
};
use esgrid_script::{BootstrapProfile, master_script, worker_script};

use crate::fleet::FleetProvisioner;
use crate::master::{MasterProvisioner, WaitSettings};
use crate::provider::CloudProvider;

/// What to do with the rest of a batch after an experiment fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchPolicy {
    #[default]
    AbortOnError,
    ContinueOnError,
}

/// A fatal error for one experiment, with the experiment it belongs to.
#[derive(Debug, Error)]
#[error("experiment {experiment}: {error}")]
pub struct ExperimentFailure {
    pub experiment: String,
    #[source]
    pub error: LaunchError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub launched: Vec<LaunchOutcome>,
    pub failed: Vec<ExperimentFailure>,
    /// Experiments never attempted because the batch stopped early.
    pub skipped: Vec<String>,
    /// The operator declined a confirmation prompt.
    pub declined: bool,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.declined
    }
}

/// Progress hooks for the sequencer. Everything defaults to a no-op and
/// `confirm` defaults to proceeding.
pub trait LaunchObserver {
    fn experiment_loaded(&mut self, _index: usize, _total: usize, _spec: &ExperimentSpec) {}

    /// Asked before provisioning unless confirmations are skipped.
    /// Returning `false` stops the whole batch.
    fn confirm(&mut self, _spec: &ExperimentSpec) -> bool {
        true
    }

    fn image_resolved(&mut self, _run: &RunName, _image_id: &str) {}

    fn master_ready(&mut self, _run: &RunName, _master: &MasterNode) {}

    fn fleet_ready(&mut self, _run: &RunName, _fleet: &WorkerFleet) {}

    fn launched(&mut self, _outcome: &LaunchOutcome) {}

    fn failed(&mut self, _failure: &ExperimentFailure) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default)]
pub struct SilentObserver;

impl LaunchObserver for SilentObserver {}

pub struct LaunchSequencer<'a, P> {
    provider: &'a P,
    config: &'a LaunchConfig,
    profile: BootstrapProfile,
    waits: WaitSettings,
    policy: BatchPolicy,
    skip_confirmation: bool,
    clock: fn() -> DateTime<Utc>,
}

impl<'a, P: CloudProvider> LaunchSequencer<'a, P> {
    pub fn new(provider: &'a P, config: &'a LaunchConfig) -> Self {
        Self {
            provider,
            config,
            profile: BootstrapProfile::default(),
            waits: WaitSettings::default(),
            policy: BatchPolicy::default(),
            skip_confirmation: false,
            clock: Utc::now,
        }
    }

    pub fn with_profile(mut self, profile: BootstrapProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_waits(mut self, waits: WaitSettings) -> Self {
        self.waits = waits;
        self
    }

    pub fn with_policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn skip_confirmation(mut self, skip: bool) -> Self {
        self.skip_confirmation = skip;
        self
    }

    /// Override the clock used to derive run names.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Provision every experiment in order.
    pub async fn run(
        &self,
        sources: &[ExperimentSource],
        observer: &mut impl LaunchObserver,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let total = sources.len();

        for (index, source) in sources.iter().enumerate() {
            let name = source.name();

            let result = match source.load() {
                Ok(spec) => {
                    observer.experiment_loaded(index + 1, total, &spec);
                    if !self.skip_confirmation && !observer.confirm(&spec) {
                        warn!(experiment = %name, "launch declined; stopping batch");
                        report.declined = true;
                        report.skipped.extend(sources[index..].iter().map(|s| s.name()));
                        break;
                    }
                    self.launch(&spec, observer).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(outcome) => {
                    observer.launched(&outcome);
                    report.launched.push(outcome);
                }
                Err(error) => {
                    error!(
                        experiment = %name,
                        kind = error.kind(),
                        error = %error,
                        "experiment failed; resources created so far are left in place"
                    );
                    let failure = ExperimentFailure {
                        experiment: name,
                        error,
                    };
                    observer.failed(&failure);
                    report.failed.push(failure);

                    if self.policy == BatchPolicy::AbortOnError {
                        report
                            .skipped
                            .extend(sources[index + 1..].iter().map(|s| s.name()));
                        break;
                    }
                }
            }
        }

        info!(
            launched = report.launched.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "batch finished"
        );
        report
    }

    /// Provision the cluster for a single experiment.
    pub async fn launch(
        &self,
        spec: &ExperimentSpec,
        observer: &mut impl LaunchObserver,
    ) -> LaunchResult<LaunchOutcome> {
        self.config.validate()?;

        let run = RunName::new(spec.prefix(), (self.clock)());
        let image_id = self.config.images.resolve(&self.config.region)?;
        info!(run = %run, image = %image_id, region = %self.config.region, "launching");
        observer.image_resolved(&run, &image_id);

        let script = master_script(&self.profile, &spec.to_compact_json(), &self.config.algorithm);
        let master = MasterProvisioner::new(self.provider, self.config, self.waits)
            .provision(&run, spec.prefix(), &image_id, &script)
            .await?;
        observer.master_ready(&run, &master);

        let script = worker_script(&self.profile, &master.private_address, &self.config.algorithm);
        let fleet = FleetProvisioner::new(self.provider, self.config)
            .provision(&run, spec.prefix(), &image_id, &script, &master)
            .await?;
        observer.fleet_ready(&run, &fleet);

        info!(run = %run, master = %master.instance_id, workers = fleet.desired_capacity, "launched");

        Ok(LaunchOutcome {
            run_name: run,
            experiment_prefix: spec.prefix().to_string(),
            image_id,
            master,
            fleet,
            console_url: self.config.console_url(),
        })
    }
}
