use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sedum",
    version,
    disable_version_flag = true,
    about = "A RESP routing proxy for standalone and clustered Redis deployments"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config", default_value = "sedum.toml")]
    config: PathBuf,

    /// Print version information.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match sedum::Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!(config = %args.config.display(), error = %err, "failed to load configuration");
            return ExitCode::from(2);
        }
    };
    let source = sedum::ConfigSource::new(&args.config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "sedum starting"
    );

    match sedum::run(config, source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "proxy terminated");
            ExitCode::FAILURE
        }
    }
}
