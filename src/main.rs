//! Nexus Gateway - single HTTPS entrypoint for the service ecosystem.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use nexus_gateway::{cli::Cli, config::Config, gateway::Gateway};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = nexus_gateway::setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    if let Some(services_file) = cli.services_file {
        config.services_file = services_file;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr,
        public_origin = %config.public_origin,
        "Starting Nexus Gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::from(e.exit_code());
    }

    ExitCode::SUCCESS
}
