//! End-to-end launch sequences against the recording provider.

use std::io::Write;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use esgrid_core::{
    ExperimentSource, ImageResolver, LaunchConfig, LaunchError, LaunchStep, TAG_NAME, TAG_ROLE,
    Tag,
};
use esgrid_provision::{
    BatchPolicy, LaunchSequencer, ProviderCall, RecordingBehavior, RecordingProvider,
    SilentObserver, WaitSettings,
};
use esgrid_script::{BootstrapProfile, master_script, worker_script};

fn clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap()
}

fn config() -> LaunchConfig {
    LaunchConfig {
        region: "us-west-2".to_string(),
        zone: "us-west-2b".to_string(),
        security_group: "es-cluster".to_string(),
        key_name: "ops".to_string(),
        master_instance_type: "r4.xlarge".to_string(),
        worker_instance_type: "c5.18xlarge".to_string(),
        cluster_size: 3,
        spot_price: None,
        spot_master: false,
        algorithm: "es".to_string(),
        images: ImageResolver::new([("us-west-2", "ami-0west")], None),
        archive_excludes: LaunchConfig::default_archive_excludes(),
    }
}

fn inline(prefix: &str) -> ExperimentSource {
    ExperimentSource::inline(
        format!("{prefix}.json"),
        format!(r#"{{"exp_prefix":"{prefix}","config":{{"episodes_per_batch":1000}}}}"#),
    )
}

#[tokio::test]
async fn batch_launches_each_experiment_in_order() {
    let provider = RecordingProvider::new();
    let config = config();
    let sources = [inline("humanoid"), inline("hopper")];

    let report = LaunchSequencer::new(&provider, &config)
        .skip_confirmation(true)
        .with_clock(clock)
        .run(&sources, &mut SilentObserver)
        .await;

    assert!(report.is_success());
    let runs: Vec<&str> = report.launched.iter().map(|o| o.run_name.as_str()).collect();
    assert_eq!(runs, vec!["humanoid_20240203-040506", "hopper_20240203-040506"]);

    // The second experiment starts only after the first fleet exists.
    let ops: Vec<&str> = provider.calls().iter().map(ProviderCall::op).collect();
    let first_group = ops.iter().position(|op| *op == "create_scaling_group").unwrap();
    let second_master = ops.iter().rposition(|op| *op == "create_instance").unwrap();
    assert!(first_group < second_master);
    assert_eq!(provider.count("create_scaling_group"), 2);
}

#[tokio::test]
async fn abort_policy_skips_remaining_experiments() {
    let provider = RecordingProvider::new();
    let config = config();
    let sources = [
        ExperimentSource::inline("broken.json", r#"{"config":{}}"#),
        inline("hopper"),
    ];

    let report = LaunchSequencer::new(&provider, &config)
        .skip_confirmation(true)
        .run(&sources, &mut SilentObserver)
        .await;

    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].experiment, "broken.json");
    assert!(matches!(report.failed[0].error, LaunchError::Input { .. }));
    assert_eq!(report.skipped, vec!["hopper.json".to_string()]);
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn continue_policy_launches_the_rest() {
    let provider = RecordingProvider::new();
    let config = config();
    let sources = [
        ExperimentSource::inline("broken.json", "not json"),
        inline("hopper"),
    ];

    let report = LaunchSequencer::new(&provider, &config)
        .skip_confirmation(true)
        .with_policy(BatchPolicy::ContinueOnError)
        .run(&sources, &mut SilentObserver)
        .await;

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.launched.len(), 1);
    assert!(report.skipped.is_empty());
    assert_eq!(report.launched[0].experiment_prefix, "hopper");
}

#[tokio::test]
async fn missing_experiment_file_is_input_error() {
    let dir = tempfile::tempdir().unwrap();
    let provider = RecordingProvider::new();
    let config = config();
    let sources = [ExperimentSource::File(dir.path().join("absent.json"))];

    let report = LaunchSequencer::new(&provider, &config)
        .skip_confirmation(true)
        .run(&sources, &mut SilentObserver)
        .await;

    assert!(matches!(report.failed[0].error, LaunchError::Input { .. }));
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn experiment_file_reaches_master_script_verbatim() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"exp_prefix":"walker","policy":{{"type":"MujocoPolicy"}}}}"#).unwrap();

    let provider = RecordingProvider::new();
    let config = config();
    let sources = [ExperimentSource::File(file.path().to_path_buf())];

    let report = LaunchSequencer::new(&provider, &config)
        .skip_confirmation(true)
        .run(&sources, &mut SilentObserver)
        .await;
    assert!(report.is_success());

    let user_data = provider.instance_specs().remove(0).user_data;
    assert!(user_data.contains(r#"{"exp_prefix":"walker","policy":{"type":"MujocoPolicy"}}"#));
}

#[tokio::test(start_paused = true)]
async fn spot_master_end_to_end() {
    let provider = RecordingProvider::with_behavior(RecordingBehavior {
        spot_pending_polls: 3,
        address_delay: 1,
        ..RecordingBehavior::default()
    });
    let mut config = config();
    config.spot_master = true;
    config.spot_price = Some("1.25".to_string());

    let waits = WaitSettings {
        poll_interval: Duration::from_secs(5),
        spot_timeout: Duration::from_secs(120),
        address_timeout: Duration::from_secs(60),
    };
    let outcome = LaunchSequencer::new(&provider, &config)
        .with_waits(waits)
        .with_clock(clock)
        .launch(&inline("ant").load().unwrap(), &mut SilentObserver)
        .await
        .unwrap();

    assert_eq!(provider.count("create_instance"), 0);
    assert_eq!(provider.count("request_spot_instances"), 1);
    assert_eq!(provider.count("spot_request_state"), 4);
    assert_eq!(provider.spot_requests()[0].spot_price, "1.25");
    assert_eq!(provider.launch_configurations()[0].spot_price.as_deref(), Some("1.25"));

    let (tagged, tags) = provider.tag_calls().remove(0);
    assert_eq!(tagged, outcome.master.instance_id);
    assert!(tags.contains(&Tag::new(TAG_NAME, "ant_20240203-040506-master")));
    assert!(tags.contains(&Tag::new(TAG_ROLE, "master")));

    let worker_user_data = provider.launch_configurations().remove(0).user_data;
    assert!(worker_user_data.contains(&format!("--master_host {}", outcome.master.private_address)));
}

#[tokio::test(start_paused = true)]
async fn failed_spot_request_reports_step() {
    let provider = RecordingProvider::with_behavior(RecordingBehavior {
        spot_terminal_status: Some("price-too-low".to_string()),
        ..RecordingBehavior::default()
    });
    let mut config = config();
    config.spot_master = true;
    config.spot_price = Some("0.01".to_string());

    let err = LaunchSequencer::new(&provider, &config)
        .launch(&inline("ant").load().unwrap(), &mut SilentObserver)
        .await
        .unwrap_err();

    assert_eq!(err.step(), Some(LaunchStep::WaitSpot));
    assert!(err.to_string().contains("price-too-low"));
    assert_eq!(provider.count("create_launch_configuration"), 0);
}

#[test]
fn scripts_are_deterministic_and_role_specific() {
    let profile = BootstrapProfile::default();
    let json = r#"{"exp_prefix":"x"}"#;

    assert_eq!(master_script(&profile, json, "es"), master_script(&profile, json, "es"));
    assert_eq!(
        worker_script(&profile, "10.1.2.3", "ga"),
        worker_script(&profile, "10.1.2.3", "ga")
    );
    assert_ne!(master_script(&profile, json, "es"), worker_script(&profile, "10.1.2.3", "es"));
}
