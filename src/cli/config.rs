use clap::{Args, Subcommand};

use super::CliContext;
use helm::config::NodeSettings;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Add or update a setting in the env file
    Set { key: String, value: String },
    Delete { key: String },
    /// Print the resolved node settings
    Show,
}

pub async fn execute(args: ConfigArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        ConfigCommands::Set { key, value } => {
            context.config_manager.0.set(&key, &value).await?;
            println!("✅ {} set.", key);
        }
        ConfigCommands::Delete { key } => {
            context.config_manager.0.del(&key).await;
            println!("✅ {} deleted.", key);
        }
        ConfigCommands::Show => {
            let settings = NodeSettings::from_config(&context.config_manager).await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }
    Ok(())
}
