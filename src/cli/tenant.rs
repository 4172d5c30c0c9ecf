use std::path::PathBuf;

use clap::{Args, Subcommand};

use super::CliContext;
use helm::BINARY_VERSION;
use helm::app::App;
use helm::config::NodeSettings;
use helm::connector::InMemoryMetricsRegistry;
use helm::persistence::{InMemoryPersistence, TenantId};

#[derive(Args, Debug)]
pub struct TenantArgs {
    /// Platform file (YAML); status changes are written back to it
    #[arg(long, global = true, default_value = "platform.yaml")]
    pub platform: PathBuf,

    #[command(subcommand)]
    pub command: TenantCommands,
}

#[derive(Subcommand, Debug)]
pub enum TenantCommands {
    Activate { id: TenantId },
    Deactivate { id: TenantId },
    Pause { id: TenantId },
    Resume { id: TenantId },
    List,
}

pub async fn execute(args: TenantArgs, context: &CliContext) -> anyhow::Result<()> {
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
    let node = app.orchestrator();

    match args.command {
        TenantCommands::Activate { id } => {
            node.activate_tenant(id).await?;
            println!("✅ Tenant {} activated.", id);
        }
        TenantCommands::Deactivate { id } => {
            node.deactivate_tenant(id).await?;
            println!("✅ Tenant {} deactivated.", id);
        }
        TenantCommands::Pause { id } => {
            node.pause_tenant(id).await?;
            println!("✅ Tenant {} paused.", id);
        }
        TenantCommands::Resume { id } => {
            node.resume_tenant(id).await?;
            println!("✅ Tenant {} resumed.", id);
        }
        TenantCommands::List => {
            for tenant in app.persistence().tenants().await {
                println!("{:>6}  {:<12} {}", tenant.id, tenant.status.to_string(), tenant.name);
            }
        }
    }
    Ok(())
}
