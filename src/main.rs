//! cr-synchronizer - deployment hook synchronizing declarative custom
//! resources with their owning controllers.
//!
//! Exit code 1 means the deployment must not proceed: a declaration failed,
//! timed out, or could not be applied.

use clap::Parser;
use kube::Client;
use tracing::{error, info};

use cr_synchronizer::SyncConfig;

#[derive(Parser)]
#[command(name = "cr-synchronizer", version, about = "Synchronize declarative custom resources during a deployment")]
struct Cli {
    /// Run the post-deploy phase: discover this session's declarations by
    /// label and wait for them instead of applying manifests.
    #[arg(long)]
    post: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cr_synchronizer=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let cfg = SyncConfig::from_env();
    info!(
        namespace = %cfg.namespace,
        service = %cfg.service_name,
        post_deploy = cli.post,
        "starting cr-synchronizer"
    );

    let client = Client::try_default().await?;

    if let Err(e) = cr_synchronizer::run(client, cfg, cli.post).await {
        error!(error = %e, "synchronization failed");
        std::process::exit(1);
    }

    info!("synchronization finished");
    Ok(())
}
