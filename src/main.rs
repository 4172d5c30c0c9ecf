use clap::Parser;
use helm::config::{ConfigManager, EnvConfigManager};

mod cli;

use cli::{Cli, CliContext};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let context = CliContext::new(ConfigManager(EnvConfigManager::new(cli.env.clone())));
    cli::execute(&context, cli.command).await
}
