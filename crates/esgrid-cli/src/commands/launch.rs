use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::bail;
use clap::Args;
use serde_json::json;
use tracing::info;

use esgrid_core::{
    Environment, EsgridConfig, ExperimentSource, ExperimentSpec, LaunchConfig, LaunchOutcome,
    LaunchSettings, MasterNode, RunName, WorkerFleet,
};
use esgrid_provision::{
    BatchPolicy, BatchReport, CloudProvider, ExperimentFailure, LaunchObserver, LaunchSequencer,
    RecordingProvider, WaitSettings,
};
use esgrid_script::BootstrapProfile;

#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Experiment JSON files, launched one after another.
    #[arg(required = true)]
    exp_files: Vec<PathBuf>,

    #[arg(long)]
    algorithm: Option<String>,

    /// Key-pair name (default: $KEY_NAME).
    #[arg(long)]
    key_name: Option<String>,

    /// Access key id (default: $AWS_ACCESS_KEY).
    #[arg(long)]
    aws_access_key_id: Option<String>,

    /// Secret access key (default: $AWS_ACCESS_SECRET).
    #[arg(long)]
    aws_secret_access_key: Option<String>,

    /// Spot bid price. Workers are requested as spot instances when set.
    #[arg(long)]
    spot_price: Option<String>,

    #[arg(long)]
    region: Option<String>,

    #[arg(long)]
    zone: Option<String>,

    #[arg(long)]
    cluster_size: Option<u32>,

    /// Use a spot instance as the master.
    #[arg(long)]
    spot_master: bool,

    #[arg(long)]
    master_instance_type: Option<String>,

    #[arg(long)]
    worker_instance_type: Option<String>,

    #[arg(long)]
    security_group: Option<String>,

    #[arg(long, value_delimiter = ',')]
    archive_excludes: Option<Vec<String>>,

    /// Skip the confirmation prompt.
    #[arg(short, long)]
    yes: bool,

    /// Path to esgrid.toml (default: ./esgrid.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against an in-memory provider and print the calls instead.
    #[arg(long)]
    dry_run: bool,

    /// Keep launching the remaining experiments after a failure.
    #[arg(long)]
    continue_on_error: bool,
}

impl LaunchArgs {
    fn settings(&self) -> LaunchSettings {
        LaunchSettings {
            region: self.region.clone(),
            zone: self.zone.clone(),
            security_group: self.security_group.clone(),
            key_name: self.key_name.clone(),
            master_instance_type: self.master_instance_type.clone(),
            worker_instance_type: self.worker_instance_type.clone(),
            cluster_size: self.cluster_size,
            spot_price: self.spot_price.clone(),
            spot_master: self.spot_master.then_some(true),
            algorithm: self.algorithm.clone(),
            archive_excludes: self.archive_excludes.clone(),
        }
    }

    fn environment(&self) -> Environment {
        let mut env = Environment::from_env();
        if let Some(id) = &self.aws_access_key_id {
            env.access_key_id = Some(id.clone());
        }
        if let Some(secret) = &self.aws_secret_access_key {
            env.secret_access_key = Some(secret.clone());
        }
        env
    }
}

/// Everything a launch needs once the configuration layers are merged.
struct Plan {
    config: LaunchConfig,
    env: Environment,
    profile: BootstrapProfile,
    waits: WaitSettings,
    policy: BatchPolicy,
}

fn plan(args: &LaunchArgs) -> anyhow::Result<Plan> {
    let file = EsgridConfig::load(args.config.as_deref())?;
    let env = args.environment();
    let config = file.resolve_launch(&env, args.settings())?;

    let policy = if args.continue_on_error || file.batch.continue_on_error {
        BatchPolicy::ContinueOnError
    } else {
        BatchPolicy::AbortOnError
    };

    Ok(Plan {
        config,
        profile: BootstrapProfile::from_settings(&file.bootstrap),
        waits: WaitSettings {
            poll_interval: file.spot_poll_interval()?,
            spot_timeout: file.spot_timeout()?,
            address_timeout: file.master_address_timeout()?,
        },
        policy,
        env,
    })
}

pub async fn run(args: LaunchArgs) -> anyhow::Result<()> {
    let plan = plan(&args)?;
    println!("Launching:");
    println!("{}", banner(&plan.config, &plan.env)?);

    let sources: Vec<ExperimentSource> =
        args.exp_files.iter().cloned().map(ExperimentSource::File).collect();
    let mut observer = ConsoleObserver;

    let report = if args.dry_run {
        let provider = RecordingProvider::new();
        let report = run_batch(&provider, &plan, &sources, args.yes, &mut observer).await;
        println!("Provider calls (dry run):");
        for call in provider.calls() {
            println!("{}", serde_json::to_string(&call)?);
        }
        report
    } else {
        launch_live(&plan, &sources, args.yes, &mut observer).await?
    };

    summarize(&report)
}

#[cfg(feature = "aws")]
async fn launch_live(
    plan: &Plan,
    sources: &[ExperimentSource],
    yes: bool,
    observer: &mut ConsoleObserver,
) -> anyhow::Result<BatchReport> {
    let credentials = plan.env.credentials()?;
    let provider = esgrid_provision::AwsProvider::connect(&plan.config.region, credentials).await;
    Ok(run_batch(&provider, plan, sources, yes, observer).await)
}

#[cfg(not(feature = "aws"))]
async fn launch_live(
    _plan: &Plan,
    _sources: &[ExperimentSource],
    _yes: bool,
    _observer: &mut ConsoleObserver,
) -> anyhow::Result<BatchReport> {
    Err(esgrid_core::LaunchError::configuration(
        "esgrid was built without the `aws` feature; rebuild with `--features aws` or pass --dry-run",
    )
    .into())
}

async fn run_batch<P: CloudProvider>(
    provider: &P,
    plan: &Plan,
    sources: &[ExperimentSource],
    yes: bool,
    observer: &mut ConsoleObserver,
) -> BatchReport {
    LaunchSequencer::new(provider, &plan.config)
        .with_profile(plan.profile.clone())
        .with_waits(plan.waits)
        .with_policy(plan.policy)
        .skip_confirmation(yes)
        .run(sources, observer)
        .await
}

/// Resolved parameters as pretty JSON. The secret is never printed.
fn banner(config: &LaunchConfig, env: &Environment) -> anyhow::Result<String> {
    let mut value = serde_json::to_value(config)?;
    if let Some(fields) = value.as_object_mut() {
        fields.insert("aws_access_key_id".to_string(), json!(env.access_key_id));
        fields.insert(
            "aws_secret_access_key".to_string(),
            json!(env.secret_access_key.as_ref().map(|_| "<redacted>")),
        );
    }
    Ok(serde_json::to_string_pretty(&value)?)
}

fn summarize(report: &BatchReport) -> anyhow::Result<()> {
    info!(
        launched = report.launched.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        "launch finished"
    );
    for line in skipped_lines(report) {
        eprintln!("{line}");
    }
    if report.declined {
        bail!("launch declined");
    }
    if !report.failed.is_empty() {
        bail!(
            "{} experiment(s) failed, {} launched",
            report.failed.len(),
            report.launched.len()
        );
    }
    Ok(())
}

fn skipped_lines(report: &BatchReport) -> Vec<String> {
    report
        .skipped
        .iter()
        .map(|name| format!("skipped: {name}"))
        .collect()
}

/// Prints operator-facing progress to stdout and prompts on stdin.
struct ConsoleObserver;

impl LaunchObserver for ConsoleObserver {
    fn experiment_loaded(&mut self, index: usize, total: usize, spec: &ExperimentSpec) {
        println!("Experiment [{index}/{total}]:");
        println!("{}", spec.to_pretty_json());
    }

    fn confirm(&mut self, spec: &ExperimentSpec) -> bool {
        print!("Launch experiment {}? [y/N] ", spec.prefix());
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }

    fn image_resolved(&mut self, run: &RunName, image_id: &str) {
        println!("Using image {image_id} for {run}");
    }

    fn master_ready(&mut self, _run: &RunName, master: &MasterNode) {
        println!(
            "Master {} up, private address {}",
            master.instance_id, master.private_address
        );
    }

    fn fleet_ready(&mut self, _run: &RunName, fleet: &WorkerFleet) {
        println!(
            "Scaling group {} created with {} worker(s)",
            fleet.group_name, fleet.desired_capacity
        );
    }

    fn launched(&mut self, outcome: &LaunchOutcome) {
        println!("Go to {} to monitor instances", outcome.console_url);
    }

    fn failed(&mut self, failure: &ExperimentFailure) {
        eprintln!("error: {failure}");
    }
}
