use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::Args;
use tokio::signal;
use tracing::{error, info};

use super::CliContext;
use helm::BINARY_VERSION;
use helm::app::App;
use helm::config::NodeSettings;
use helm::connector::{MetricsRegistry, OtelMetricsRegistry};
use helm::logger::{LogLevel, init_tracing};
use helm::persistence::InMemoryPersistence;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Platform file (YAML) with the schema version and the tenants
    #[arg(long)]
    pub platform: PathBuf,

    /// Log level for the subscriber
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// OpenTelemetry collector base url (e.g. http://localhost:4318); logs go to files without it
    #[arg(long)]
    pub otel_endpoint: Option<String>,

    /// Directory of the rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let telemetry = init_tracing(&args.log_dir, args.log_level, args.otel_endpoint.as_deref())?;

    let settings = NodeSettings::from_config(&context.config_manager).await?;
    let persistence = InMemoryPersistence::load(&args.platform, BINARY_VERSION)?;
    let metrics: Arc<dyn MetricsRegistry> = OtelMetricsRegistry::global();
    let app = App::bootstrap(settings, BINARY_VERSION, persistence, None, metrics, vec![]);

    info!("helm {} starting node `{}`", BINARY_VERSION, app.settings().node_id);
    match app.orchestrator().start().await {
        Ok(true) => {}
        Ok(false) => bail!("node `{}` is already {}", app.settings().node_id, app.orchestrator().state()),
        Err(e) => {
            error!("could not start node: {:#}", anyhow::Error::from(e));
            telemetry.shutdown();
            bail!("node `{}` did not start, see the logs", app.settings().node_id);
        }
    }

    println!(
        "helm node `{}` running ({} tenants); press Ctrl-C to exit",
        app.settings().node_id,
        app.persistence().tenants().await.len()
    );

    // wait for CTRL-C
    signal::ctrl_c().await?;

    println!("\nShutting down…");
    let result = app.shutdown().await;
    telemetry.shutdown();
    result?;
    println!("Goodbye!");
    Ok(())
}
