use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use device_identity::{
    HeaderStoreBackend, HostSignalCollector, IdentityConfig, IdentitySubsystem, InMemoryGateway,
    JsonFileStore, MemoryBackend, StorageBackend, StorageTier, WorkerChannelBackend,
};
use device_identity::storage::WorkerHandle;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const NAMESPACE_FILE: &str = "namespace.json";
const DATABASE_FILE: &str = "database.json";
const REMOTE_FILE: &str = "remote.json";

#[derive(Parser)]
#[command(name = "identity-probe")]
#[command(about = "Inspect and exercise device identity state kept in a directory")]
struct Cli {
    /// Directory holding namespace.json, database.json and remote.json.
    #[arg(long, default_value = ".identity-state")]
    state_dir: PathBuf,
    /// JSON configuration; every field is optional.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the subsystem and print the boot report.
    Resolve,
    /// Boot, then run one more loss check.
    Detect,
    /// Run the legacy migration on its own.
    Migrate {
        /// Remove legacy keys whose grace period elapsed.
        #[arg(long)]
        purge: bool,
        /// Restore the namespace from the durable migration backup.
        #[arg(long, conflicts_with = "purge")]
        restore: bool,
    },
    /// Print the raw state files.
    Inspect,
}

struct Session {
    subsystem: IdentitySubsystem,
    remote: Arc<InMemoryGateway>,
    remote_path: PathBuf,
    worker: WorkerHandle,
}

impl Session {
    async fn open(state_dir: &Path, config: IdentityConfig) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create {}", state_dir.display()))?;

        let namespace = Arc::new(JsonFileStore::open_as(
            state_dir.join(NAMESPACE_FILE),
            "local_namespace",
            StorageTier::StructuredDatabase,
        )?);
        let database = Arc::new(JsonFileStore::open(state_dir.join(DATABASE_FILE))?);
        let remote_path = state_dir.join(REMOTE_FILE);
        let remote = Arc::new(InMemoryGateway::load_json(&remote_path).await?);
        let (worker, worker_handle) = WorkerChannelBackend::spawn(Duration::from_millis(500));

        let backends: Vec<Arc<dyn StorageBackend>> = vec![
            Arc::new(MemoryBackend::page_cache()),
            Arc::new(MemoryBackend::session_cache()),
            database,
            Arc::new(HeaderStoreBackend::new()),
            Arc::new(worker),
        ];
        let subsystem = IdentitySubsystem::builder()
            .config(config)
            .backends(backends)
            .gateway(remote.clone())
            .namespace(namespace)
            .signal_collector(Arc::new(HostSignalCollector))
            .build()?;

        Ok(Self {
            subsystem,
            remote,
            remote_path,
            worker: worker_handle,
        })
    }

    async fn close(self) -> Result<()> {
        self.remote
            .save_json(&self.remote_path)
            .await
            .with_context(|| format!("failed to write {}", self.remote_path.display()))?;
        self.worker.stop().await?;
        Ok(())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<IdentityConfig> {
    let config = match path {
        Some(path) => IdentityConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => IdentityConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn inspect(state_dir: &Path) -> Result<()> {
    for file in [NAMESPACE_FILE, DATABASE_FILE, REMOTE_FILE] {
        let path = state_dir.join(file);
        println!("== {}", path.display());
        match fs::read_to_string(&path) {
            Ok(raw) => println!("{}", raw.trim()),
            Err(_) => println!("(missing)"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if matches!(cli.command, Command::Inspect) {
        return inspect(&cli.state_dir);
    }

    let config = load_config(cli.config.as_deref())?;
    let session = Session::open(&cli.state_dir, config).await?;
    run(&session, &cli.command, &cli.state_dir).await?;
    session.close().await
}

async fn run(session: &Session, command: &Command, state_dir: &Path) -> Result<()> {
    let subsystem = &session.subsystem;
    match command {
        Command::Resolve => {
            print_json(subsystem.ready().await)?;
        }
        Command::Detect => {
            subsystem.ready().await;
            print_json(&subsystem.detector().detect().await)?;
        }
        Command::Migrate { purge, restore } => {
            let migration = subsystem.migration();
            if *purge {
                print_json(&migration.purge_expired().await?)?;
            } else if *restore {
                let restored = migration.restore_backup().await?;
                let keys = subsystem.namespace().keys().await?;
                print_json(&serde_json::json!({ "restored": restored, "keys": keys }))?;
            } else {
                print_json(&migration.run().await?)?;
            }
        }
        Command::Inspect => inspect(state_dir)?,
    }
    Ok(())
}
