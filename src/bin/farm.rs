//! farm CLI: watches workflow engines and reports run transitions.

use farm::config::Config;
use farm::engine::{Poller, supervise};
use farm::event::Emitter;
use farm::gcp::auth::TokenSource;
use farm::gcp::{MetadataClient, resolve_identity};
use farm::model::Identity;
use farm::publish::Topic;
use farm::publish::pubsub::PubSubPublisher;
use farm::source::airflow::AirflowSource;
use farm::source::argo::ArgoSource;
use farm::telemetry::{OtelTraceSink, TelemetryConfig, init_telemetry};
use farm::trace::TraceSink;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "farm", about = "Scrape Argo and Airflow runs into Pub/Sub and traces")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll every enabled source until interrupted
    Run,
    /// Print the identity attached to published events
    Whoami,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Run => cmd_run(config).await,
        Command::Whoami => cmd_whoami(config).await,
    }
}

async fn cmd_run(config: Config) -> anyhow::Result<()> {
    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "farm".to_string(),
        log_level: config.log_level.clone(),
        json_logs: config.json_logs,
    })?;
    if !guard.exports_traces() {
        warn!("OTEL_ENDPOINT not set, run traces will not be exported");
    }

    let metadata = MetadataClient::new()?;
    let identity = resolve_identity(&config, &metadata).await;
    info!(
        project_id = %identity.project_id,
        sa_email = %identity.service_account_email,
        tenant = %identity.tenant,
        environment = %identity.environment,
        "whoami"
    );

    let tokens = if metadata.on_gce().await {
        Some(Arc::new(TokenSource::new(metadata.clone())))
    } else {
        None
    };

    let topic = Topic::new(config.topic_project(&identity.project_id), config.topic.clone());
    let publisher = Arc::new(PubSubPublisher::new(&config.pubsub_endpoint, tokens.clone())?);
    let emitter = Emitter::new(publisher, topic, identity);
    let traces: Arc<dyn TraceSink> = Arc::new(OtelTraceSink::new());

    let mut pollers = Vec::new();
    if let Some(airflow) = &config.airflow {
        let source = AirflowSource::new(&airflow.host, tokens.clone())?;
        pollers.push(Poller::new(
            Box::new(source),
            emitter.clone(),
            Arc::clone(&traces),
            airflow.poll.clone(),
            config.cache_ttl,
        ));
    }
    if let Some(argo) = &config.argo {
        let source = ArgoSource::new(
            &argo.server,
            &argo.namespace,
            argo.resolve_token()?,
            argo.ui_url.clone(),
        )?;
        pollers.push(Poller::new(
            Box::new(source),
            emitter.clone(),
            Arc::clone(&traces),
            argo.poll.clone(),
            config.cache_ttl,
        ));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    supervise(pollers, shutdown_rx).await;
    guard.force_flush();
    Ok(())
}

async fn cmd_whoami(config: Config) -> anyhow::Result<()> {
    let metadata = MetadataClient::new()?;
    let Identity {
        project_id,
        service_account_email,
        tenant,
        environment,
    } = resolve_identity(&config, &metadata).await;

    println!("Project:      {}", or_dash(&project_id));
    println!("SA Email:     {}", or_dash(&service_account_email));
    println!("Tenant:       {}", or_dash(&tenant));
    println!("Environment:  {}", or_dash(&environment));
    println!(
        "Topic:        {}",
        Topic::new(config.topic_project(&project_id), config.topic.clone())
    );
    println!(
        "Sources:      {}",
        [
            config.airflow.as_ref().map(|_| "airflow"),
            config.argo.as_ref().map(|_| "argo"),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ")
    );
    Ok(())
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() { "-" } else { value }
}
