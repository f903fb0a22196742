//! `berth` command line: worker selection and version checks over a fleet file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use berth::config::Config;
use berth::observability::init_tracing;
use berth::worker::compat::parse_worker_version;
use berth::worker::{VersionedResourceTypes, WorkerInfo, WorkerSpec};

#[derive(Parser)]
#[command(name = "berth", about = "Container placement and provisioning for CI workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the workers of a fleet that can run a container spec.
    Select {
        /// Fleet file: a JSON array of workers.
        #[arg(long)]
        fleet: PathBuf,

        /// Team the container belongs to.
        #[arg(long, default_value_t = 0)]
        team: i32,

        /// Required platform.
        #[arg(long)]
        platform: Option<String>,

        /// Required worker tag (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Resource type the container runs.
        #[arg(long)]
        resource_type: Option<String>,

        /// Pipeline resource type catalog: a JSON array.
        #[arg(long)]
        resource_types: Option<PathBuf>,
    },

    /// Report which workers of a fleet are compatible with a version.
    CheckVersion {
        /// Fleet file: a JSON array of workers.
        #[arg(long)]
        fleet: PathBuf,

        /// Version callers expect, e.g. 2.3 or 2.3.1.
        #[arg(long)]
        version: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.logging);

    let cli = Cli::parse();
    match cli.command {
        Commands::Select {
            fleet,
            team,
            platform,
            tags,
            resource_type,
            resource_types,
        } => {
            let fleet = read_fleet(&fleet).await?;
            let catalog = match resource_types {
                Some(path) => read_json::<VersionedResourceTypes>(&path).await?,
                None => VersionedResourceTypes::new(),
            };
            let spec = WorkerSpec {
                platform,
                tags,
                team_id: team,
                resource_type,
            };

            for worker in &fleet {
                match worker.satisfying(&spec, &catalog) {
                    Ok(_) => println!("{}\tok", worker.name),
                    Err(reason) => println!("{}\trejected: {reason}", worker.name),
                }
            }
        }
        Commands::CheckVersion { fleet, version } => {
            let fleet = read_fleet(&fleet).await?;
            let required = parse_worker_version(&version)
                .with_context(|| format!("invalid version: {version}"))?;

            for worker in &fleet {
                let verdict = if worker.is_version_compatible(&required) {
                    "compatible"
                } else {
                    "incompatible"
                };
                println!(
                    "{}\t{}\t{verdict}",
                    worker.name,
                    worker.version.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

async fn read_fleet(path: &Path) -> anyhow::Result<Vec<WorkerInfo>> {
    read_json(path).await
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
