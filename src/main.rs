//! Accounting extension controller

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, CustomResourceExt};

use accounting::config::ControllerConfiguration;
use accounting::controller::{error_policy, reconcile, Context};
use accounting::crd::{Cluster, Extension};
use accounting::egress::ensure_egress_policy;
use accounting::kube_utils::create_client;
use accounting::retry::RetryConfig;
use accounting::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Gardener extension deploying the accounting exporter
#[derive(Parser, Debug)]
#[command(name = "gardener-extension-accounting", version, about, long_about = None)]
struct Cli {
    /// Print the Extension and Cluster CRDs and exit
    #[arg(long)]
    crd: bool,

    /// Controller configuration file
    #[arg(long, env = "ACCOUNTING_CONFIG", required_unless_present = "crd")]
    config: Option<PathBuf>,

    /// Image vector overlay
    #[arg(long, env = "IMAGEVECTOR_OVERWRITE")]
    image_vector_overwrite: Option<PathBuf>,

    /// Kubeconfig; in-cluster config when omitted
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// How long a project inventory snapshot stays fresh
    #[arg(long, default_value_t = 1800)]
    project_cache_ttl_seconds: u64,

    /// How long Delete waits for the bundles to disappear
    #[arg(long, default_value_t = 120)]
    delete_timeout_seconds: u64,

    /// Extensions reconciled in parallel
    #[arg(long, default_value_t = 5)]
    max_concurrent_reconciles: u16,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in [Extension::crd(), Cluster::crd()] {
            println!("---\n{}", serde_yaml::to_string(&crd)?);
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })?;

    let config_path = cli
        .config
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("--config is required"))?;
    let config = Arc::new(ControllerConfiguration::load(config_path)?);
    tracing::info!(path = %config_path.display(), "loaded controller configuration");

    let client = create_client(cli.kubeconfig.as_deref()).await?;

    ensure_egress_policy(
        &client,
        config.accounting.port_number()?,
        &RetryConfig::with_max_attempts(10),
    )
    .await?;

    let ctx = Arc::new(
        Context::builder(client.clone(), config.clone())
            .image_vector_overwrite(cli.image_vector_overwrite)
            .cache_ttl(Duration::from_secs(cli.project_cache_ttl_seconds))
            .delete_timeout(Duration::from_secs(cli.delete_timeout_seconds))
            .build()?,
    );

    let extensions: Api<Extension> = Api::all(client);
    tracing::info!(
        concurrency = cli.max_concurrent_reconciles,
        "starting extension controller"
    );

    Controller::new(extensions, WatcherConfig::default().timeout(25))
        .with_config(ControllerConfig::default().concurrency(cli.max_concurrent_reconciles))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "extension reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "extension reconciliation error"),
            }
        })
        .await;

    tracing::info!("controller stopped");
    Ok(())
}
