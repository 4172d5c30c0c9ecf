use std::path::PathBuf;

use anyhow::bail;
use clap::Args;

use super::CliContext;
use helm::BINARY_VERSION;
use helm::app::App;
use helm::config::NodeSettings;
use helm::connector::InMemoryMetricsRegistry;
use helm::persistence::InMemoryPersistence;

#[derive(Args, Debug)]
pub struct VersionsArgs {
    /// Platform file (YAML) with the schema version
    #[arg(long)]
    pub platform: PathBuf,
}

pub async fn execute(args: VersionsArgs, context: &CliContext) -> anyhow::Result<()> {
    let settings = NodeSettings::from_config(&context.config_manager).await?;
    let persistence = InMemoryPersistence::load(&args.platform, BINARY_VERSION)?;
    let app = App::bootstrap(
        settings,
        BINARY_VERSION,
        persistence,
        None,
        InMemoryMetricsRegistry::new(),
        vec![],
    );

    let check = app.orchestrator().check_cluster_version_consistency().await;
    if !check.ok {
        bail!("{}", check.message);
    }
    println!("✅ {}", check.message);
    Ok(())
}
