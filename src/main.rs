//! Signal processing operator - enriches and classifies alert signals

mod config;

use std::sync::Arc;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sigproc_classifier::Classifiers;
use sigproc_common::crd::SignalRecord;
use sigproc_common::retry::{retry_with_backoff, RetryConfig};
use sigproc_common::telemetry::{init_telemetry, TelemetryConfig};
use sigproc_controller::{run_controller, BufferedAuditStore, Context, TracingAuditWriter};

use crate::config::Settings;

/// Signal processing controller for SignalRecord resources
#[derive(Parser, Debug)]
#[command(name = "sigproc", version, about, long_about = None)]
struct Cli {
    /// Print the SignalRecord CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    settings: Settings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&SignalRecord::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json_logs: !cli.settings.plain_logs,
        ..Default::default()
    })?;

    run(cli.settings).await
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let client = retry_with_backoff(&RetryConfig::with_max_attempts(10), "create_client", || async {
        Client::try_default().await
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // Only a broken built-in policy fails here; bad override files fall back
    let classifiers = Classifiers::from_config(&settings.classifier_config())
        .map_err(|e| anyhow::anyhow!("Failed to load classification policies: {}", e))?;
    classifiers.log_active_policies();

    let cancel = CancellationToken::new();
    let reload_tasks = if settings.hot_reload {
        classifiers.start_hot_reload(&cancel)
    } else {
        info!("policy hot reload disabled");
        Vec::new()
    };

    let (audit, audit_task) = BufferedAuditStore::spawn(
        Arc::new(TracingAuditWriter),
        settings.audit_config(),
        cancel.child_token(),
    );

    let ctx = Arc::new(Context::from_client(
        client.clone(),
        classifiers,
        Arc::new(audit),
        settings.controller_settings(),
    ));

    run_controller(client, ctx).await;

    info!("controller stopped, flushing audit events");
    cancel.cancel();
    join_background("audit", audit_task).await;
    for task in reload_tasks {
        join_background("policy reload", task).await;
    }
    info!("shutdown complete");
    Ok(())
}

/// Wait for a background task, logging a panic or abort instead of propagating it
///
/// Returns whether the task finished normally.
async fn join_background(name: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!(task = name, error = %e, "background task ended abnormally");
            false
        }
    }
}
