//! Crossmesh - multi-cloud cluster and service mesh bootstrap

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crossmesh::cluster_api::KubeClusterApi;
use crossmesh::config::RunConfig;
use crossmesh::driver::ExecutionDriver;
use crossmesh::exec::{CommandRunner, ProcessRunner};
use crossmesh::install::HelmInstaller;
use crossmesh::provider::{BackendRegistry, EksBackend, GkeBackend};
use crossmesh::telemetry::{init_logging, LogFormat};

/// Crossmesh - bootstrap one cluster per cloud and join them into one mesh
#[derive(Parser, Debug)]
#[command(name = "crossmesh", version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, env = "CROSSMESH_LOG_FORMAT", default_value = "human", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create (or adopt) every cluster and install the mesh
    ///
    /// Prints the run result as JSON on stdout. Exits non-zero unless every
    /// required step on every cloud succeeded.
    Bootstrap(BootstrapArgs),

    /// Validate a run configuration without touching any cloud
    Validate(ValidateArgs),
}

/// Bootstrap arguments
#[derive(Parser, Debug)]
struct BootstrapArgs {
    /// Path to the run configuration YAML
    #[arg(short = 'f', long = "config")]
    config_file: PathBuf,

    /// AWS CLI profile used for EKS
    #[arg(long, env = "AWS_PROFILE")]
    aws_profile: Option<String>,

    /// GCP project used for GKE
    #[arg(long, env = "CLOUDSDK_CORE_PROJECT")]
    gcp_project: Option<String>,
}

/// Validate arguments
#[derive(Parser, Debug)]
struct ValidateArgs {
    /// Path to the run configuration YAML
    #[arg(short = 'f', long = "config")]
    config_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        return Err(anyhow::anyhow!("Failed to install crypto provider: {:?}", e));
    }

    let cli = Cli::parse();
    init_logging(cli.log_format);

    match cli.command {
        Commands::Bootstrap(args) => run_bootstrap(args).await,
        Commands::Validate(args) => {
            let config = RunConfig::load(&args.config_file)?;
            config.validate()?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_bootstrap(args: BootstrapArgs) -> anyhow::Result<ExitCode> {
    let config = RunConfig::load(&args.config_file)?;

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let mut eks = EksBackend::new(runner.clone(), config.cluster_timeout());
    if let Some(profile) = args.aws_profile {
        eks = eks.with_profile(profile);
    }
    let mut gke = GkeBackend::new(runner.clone(), config.cluster_timeout());
    if let Some(project) = args.gcp_project {
        gke = gke.with_project(project);
    }
    let backends = BackendRegistry::new()
        .register("aws", Arc::new(eks))
        .register("gcp", Arc::new(gke));

    let driver = ExecutionDriver::new(
        backends,
        Arc::new(HelmInstaller::new(runner)),
        Arc::new(KubeClusterApi::new()),
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; letting running steps finish and skipping the rest");
            on_signal.cancel();
        }
    });

    let result = driver.bootstrap(&config, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.succeeded() {
        info!(mesh_id = %result.mesh_id, "Mesh bootstrap succeeded");
        Ok(ExitCode::SUCCESS)
    } else {
        error!(mesh_id = %result.mesh_id, status = ?result.status, "Mesh bootstrap did not complete");
        Ok(ExitCode::FAILURE)
    }
}
