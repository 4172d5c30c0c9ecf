use std::fs;
use std::path::PathBuf;

use clap::Args;
use schemars::schema_for;

use helm::persistence::PlatformFile;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Write the schema to this file instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub async fn execute(args: SchemaArgs) -> anyhow::Result<()> {
    let schema = serde_json::to_string_pretty(&schema_for!(PlatformFile))?;
    match args.out {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, schema)?;
            println!("Schema written to {}", path.display());
        }
        None => println!("{}", schema),
    }
    Ok(())
}
