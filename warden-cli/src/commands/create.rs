use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use warden::{ContainerSpec, LifecycleManager};

#[derive(Args)]
pub struct CreateArgs {
    /// Container specification file (JSON)
    pub spec: PathBuf,

    /// Override the partition named in the specification
    #[arg(long)]
    pub partition: Option<String>,
}

pub fn run(mgr: &LifecycleManager, args: CreateArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.spec)
        .with_context(|| format!("reading {}", args.spec.display()))?;
    let mut spec: ContainerSpec = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", args.spec.display()))?;
    if let Some(partition) = args.partition {
        spec.partition = partition;
    }
    // the spec file's directory anchors relative fileFolderMapping
    // sources
    if spec.source_dir.is_none() {
        if let Some(dir) = args.spec.parent().and_then(|p| p.to_str()) {
            if !dir.is_empty() {
                spec.source_dir = Some(dir.to_string());
            }
        }
    }
    let uuid = mgr.create(&spec)?;
    println!("{}", uuid);
    Ok(())
}
