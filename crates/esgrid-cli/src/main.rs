//! esgrid — launch distributed ES clusters.
//!
//! # Usage
//!
//! ```text
//! esgrid launch exp.json --algorithm es --region us-east-2 --zone us-east-2a \
//!     --security-group es --master-instance-type r4.xlarge \
//!     --worker-instance-type c5.18xlarge --cluster-size 10 --spot-price 1.5
//! esgrid render exp.json --algorithm es --role master
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "esgrid",
    about = "Launch a distributed evolution-strategies cluster",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Provision a master and a worker fleet for each experiment, in order.
    Launch(commands::launch::LaunchArgs),
    /// Print the boot script a node would receive, without contacting a provider.
    Render(commands::render::RenderArgs),
}

/// Used when `RUST_LOG` is unset; includes the provisioning poll events.
const DEFAULT_FILTER: &str = "info,esgrid=debug,esgrid_provision=debug";

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Launch(args) => commands::launch::run(args).await,
        Command::Render(args) => commands::render::run(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_enables_provisioning_debug() {
        let filter = EnvFilter::try_new(DEFAULT_FILTER).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("esgrid_provision=debug"));
        assert!(rendered.contains("esgrid=debug"));
    }

    #[test]
    fn log_format_flag_is_global() {
        let cli = Cli::try_parse_from([
            "esgrid",
            "render",
            "--algorithm",
            "es",
            "--role",
            "worker",
            "--master-address",
            "10.0.0.1",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert!(matches!(cli.log_format, LogFormat::Json));
    }
}
