use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Args;

use esgrid_core::{EsgridConfig, ExperimentSpec, Role};
use esgrid_script::{BootstrapProfile, ScriptParams, render};

#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Experiment JSON file (required for the master script).
    exp_file: Option<PathBuf>,

    #[arg(long)]
    algorithm: String,

    /// Which node's script to print: master or worker.
    #[arg(long, default_value = "master")]
    role: Role,

    /// Master private address baked into the worker script.
    #[arg(long)]
    master_address: Option<String>,

    /// Path to esgrid.toml (default: ./esgrid.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,
}

pub fn run(args: RenderArgs) -> anyhow::Result<()> {
    let file = EsgridConfig::load(args.config.as_deref())?;
    let profile = BootstrapProfile::from_settings(&file.bootstrap);
    println!("{}", script_for(&args, &profile)?);
    Ok(())
}

fn script_for(args: &RenderArgs, profile: &BootstrapProfile) -> anyhow::Result<String> {
    let script = match args.role {
        Role::Master => {
            let Some(path) = &args.exp_file else {
                bail!("the master script needs an experiment file");
            };
            let spec = ExperimentSpec::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            render(
                profile,
                ScriptParams::Master {
                    experiment_json: &spec.to_compact_json(),
                    algorithm: &args.algorithm,
                },
            )
        }
        Role::Worker => {
            let Some(master_address) = args.master_address.as_deref() else {
                bail!("the worker script needs --master-address");
            };
            render(
                profile,
                ScriptParams::Worker {
                    master_address,
                    algorithm: &args.algorithm,
                },
            )
        }
    };
    Ok(script)
}
