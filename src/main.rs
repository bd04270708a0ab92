use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use plansync::core::{PermissionLevel, ProjectId, UserId};
use plansync::{Engine, EngineConfig, MemoryStore, SessionServer};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "plansync")]
#[command(about = "Mutation engine and session server for shared planning data")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct StoreArgs {
    /// JSON config file; missing sections use defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Snapshot file, overriding the config.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

impl StoreArgs {
    fn load(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::new(),
        };
        if let Some(path) = &self.snapshot {
            config = config.snapshot_path(path);
        }
        Ok(config)
    }

    async fn open_store(&self) -> Result<MemoryStore> {
        let policy = self.load()?.store;
        if policy.snapshot_path.is_none() {
            anyhow::bail!("a snapshot path is required so the change outlives this command");
        }
        MemoryStore::open(&policy)
            .await
            .context("failed to open store")
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve JSON-lines sessions over TCP until interrupted.
    Serve {
        #[arg(long, default_value = "127.0.0.1:7300")]
        addr: String,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Create a project owned by `owner`.
    CreateProject {
        #[arg(long)]
        name: String,
        #[arg(long)]
        owner: UserId,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Set a user's membership level in a project.
    Grant {
        #[arg(long)]
        project: ProjectId,
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        level: PermissionLevel,
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { addr, store } => serve(&addr, store.load()?).await,
        Command::CreateProject { name, owner, store } => {
            let memory = store.open_store().await?;
            let project = memory
                .seed_project(&name, owner)
                .await
                .context("failed to create project")?;
            println!("{}", project.id);
            Ok(())
        }
        Command::Grant {
            project,
            user,
            level,
            store,
        } => {
            let memory = store.open_store().await?;
            memory
                .grant(project, user, level)
                .await
                .with_context(|| format!("failed to grant {level:?} on {project}"))?;
            Ok(())
        }
    }
}

async fn serve(addr: &str, config: EngineConfig) -> Result<()> {
    let engine = Engine::open(config).await.context("failed to open store")?;
    let server = SessionServer::bind(engine.clone(), addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %server.local_addr()?, "plansync ready");

    server
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "cannot listen for ctrl-c");
            }
        })
        .await?;

    engine.shutdown().await;
    engine
        .store()
        .checkpoint()
        .await
        .context("failed to write final snapshot")?;
    info!("plansync stopped");
    Ok(())
}
