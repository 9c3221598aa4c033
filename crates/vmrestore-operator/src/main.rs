//! vmrestore operator - restores virtual machines from snapshots

mod config;
mod controller_runner;
mod crds;

use clap::Parser;
use kube::Client;

use vmrestore_common::telemetry::{init_telemetry, TelemetryConfig};

use crate::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube's rustls client needs a process-wide crypto provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The controller cannot reach the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crds::crd_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default().with_log_format(cli.log_format))
        .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {}", e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;

    if cli.install_crds {
        crds::ensure_crds_installed(&client).await?;
    }

    controller_runner::run(client, &cli).await;
    Ok(())
}
