use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod config;
pub mod run;
pub mod schema;
pub mod tenant;
pub mod versions;

use config::ConfigArgs;
use run::RunArgs;
use schema::SchemaArgs;
use tenant::TenantArgs;
use versions::VersionsArgs;

use helm::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "helm",
    about = "Node and tenant lifecycle for the process engine",
    version
)]
pub struct Cli {
    /// Env file holding the HELM_* settings
    #[arg(long, global = true, default_value = ".env")]
    pub env: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node and keep it running until Ctrl-C
    Run(RunArgs),

    /// Check schema and binary versions without starting
    CheckVersions(VersionsArgs),

    /// Change the status of a tenant
    Tenant(TenantArgs),

    /// Handle settings
    Config(ConfigArgs),

    /// Emit the JSON-Schema of the platform file
    Schema(SchemaArgs),
}

#[derive(Clone, Debug)]
pub struct CliContext {
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(config_manager: ConfigManager) -> Self {
        Self { config_manager }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::CheckVersions(args) => versions::execute(args, context).await,
        Commands::Tenant(args) => tenant::execute(args, context).await,
        Commands::Config(args) => config::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args).await,
    }
}
