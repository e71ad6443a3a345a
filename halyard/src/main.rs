use clap::{Args, Parser};
use std::path::PathBuf;
use std::process::ExitCode;

mod config;
mod logging;
mod statsd;

use config::Config;

#[derive(Parser)]
#[command(name = "halyard", about = "Records container build results in etcd")]
enum CliCommand {
    /// Run the build hook receiver
    Run(ConfigArgs),
    /// Load and validate the configuration, then exit
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// YAML config file. $SERVER_PORT, $ETCD_URL and $SECURITY_KEY override its values.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

fn load_config(args: &ConfigArgs) -> Option<Config> {
    match Config::load(args.config.as_deref(), |name| std::env::var(name).ok()) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Error occurred in config: {e}");
            None
        }
    }
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    match &cli {
        CliCommand::Run(args) => match load_config(args) {
            Some(config) => run(config),
            None => ExitCode::FAILURE,
        },
        CliCommand::CheckConfig(args) => match load_config(args) {
            Some(_) => {
                println!("Config ok");
                ExitCode::SUCCESS
            }
            None => ExitCode::FAILURE,
        },
    }
}

fn run(config: Config) -> ExitCode {
    // Sentry has to be initialised before the runtime starts its threads.
    let _sentry = logging::init(config.common.logging.as_ref());

    if let Some(metrics_config) = &config.common.metrics
        && let Err(e) = statsd::init(metrics_config)
    {
        tracing::error!(error = %e, "Failed to initialise metrics");
        return ExitCode::FAILURE;
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Starting halyard");
    let result = rt.block_on(async {
        tokio::select! {
            res = build_hook::run(config.build_hook) => res,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                Ok(())
            }
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Build hook receiver failed");
            ExitCode::FAILURE
        }
    }
}
