mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre;
use tracing_subscriber::EnvFilter;
use warden_core::BackendConfig;

/// Snapshot, copy and restore protected entities.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub dest: DestArgs,

    /// Skip TLS verification for remote managers
    #[arg(long, env = "WARDEN_INSECURE", global = true)]
    pub insecure: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Default)]
pub struct SourceArgs {
    /// Local configuration directory (`pes/<type>.pe.json`, optional `s3config.json`)
    #[arg(long, env = "WARDEN_CONF_DIR", global = true)]
    pub conf_dir: Option<PathBuf>,

    /// Remote manager host
    #[arg(long, env = "WARDEN_HOST", global = true)]
    pub host: Option<String>,

    /// S3 repository URL
    #[arg(long, env = "WARDEN_S3_REPO", global = true)]
    pub s3_repo: Option<String>,

    /// Content-addressable repository URL
    #[arg(long, env = "WARDEN_KOPIA_REPO", global = true)]
    pub kopia_repo: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct DestArgs {
    /// Destination configuration directory; defaults to the source manager
    #[arg(long, env = "WARDEN_DEST_CONF_DIR", global = true)]
    pub dest_conf_dir: Option<PathBuf>,

    #[arg(long, env = "WARDEN_DEST_HOST", global = true)]
    pub dest_host: Option<String>,

    #[arg(long, env = "WARDEN_DEST_S3_REPO", global = true)]
    pub dest_s3_repo: Option<String>,

    #[arg(long, env = "WARDEN_DEST_KOPIA_REPO", global = true)]
    pub dest_kopia_repo: Option<String>,
}

impl Cli {
    pub fn source_config(&self) -> BackendConfig {
        BackendConfig {
            conf_dir: self.source.conf_dir.clone(),
            host: self.source.host.clone(),
            s3_repo: self.source.s3_repo.clone(),
            kopia_repo: self.source.kopia_repo.clone(),
            insecure: self.insecure,
        }
    }

    pub fn dest_config(&self) -> BackendConfig {
        BackendConfig {
            conf_dir: self.dest.dest_conf_dir.clone(),
            host: self.dest.dest_host.clone(),
            s3_repo: self.dest.dest_s3_repo.clone(),
            kopia_repo: self.dest.dest_kopia_repo.clone(),
            insecure: self.insecure,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List registered entity types
    Types,

    /// List entities of a type
    Ls {
        #[arg(value_name = "TYPE")]
        type_name: String,
    },

    /// Show an entity's info and component ids
    Show { id: String },

    /// List an entity's snapshots
    Lssn { id: String },

    /// Take a snapshot
    Snap { id: String },

    /// Delete a snapshot
    Rmsn { id: String },

    /// Copy between entities and archive files
    Cp { source: String, dest: String },

    /// Reconcile snapshot and restore resources until interrupted
    Controller {
        /// Directory holding `snapshots/` and `restores/`
        #[arg(long, env = "WARDEN_RESOURCES")]
        resources: PathBuf,

        /// Entity type the resources refer to
        #[arg(long = "type", env = "WARDEN_TYPE")]
        type_name: String,

        /// Seconds between passes
        #[arg(long, default_value_t = 10)]
        interval: u64,

        /// Resources reconciled in parallel
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::run(cli).await
}
