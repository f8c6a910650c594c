use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use vmplane::config::Settings;
use vmplane::driver::{BackendType, backend_available, create_driver};
use vmplane::fingerprint::fingerprint;
use vmplane::http_api;
use vmplane::logging::{self, LogFormat};
use vmplane::pool::PoolManager;
use vmplane::proxy::LogProxy;
use vmplane::reconciler::Reconciler;
use vmplane::store::{DesiredStore, load_desired_file};

#[derive(Parser)]
#[command(name = "vmplane")]
#[command(about = "State-reconciling control plane for microVMs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane (store, pool, reconciler, HTTP API)
    Serve {
        /// Port for the HTTP API (overrides FC_PORT)
        #[arg(short, long)]
        port: Option<u16>,
        /// Hypervisor backend (overrides FC_BACKEND)
        #[arg(short, long)]
        backend: Option<BackendType>,
        /// SQLite file for the desired-state store (overrides VMPLANE_DB)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Desired-state file to bootstrap from (overrides VMPLANE_DESIRED_FILE)
        #[arg(long)]
        desired_file: Option<PathBuf>,
        /// Emit JSON logs instead of human-readable output
        #[arg(long)]
        json: bool,
    },
    /// Parse a desired-state file and print each job's spec fingerprint
    Validate {
        /// Path to the desired-state TOML file
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            backend,
            db,
            desired_file,
            json,
        } => {
            logging::init(if json { LogFormat::Json } else { LogFormat::Human });

            let mut settings = Settings::from_env()?;
            if let Some(port) = port {
                settings.api_port = port;
            }
            if let Some(backend) = backend {
                settings.backend = backend;
            }
            if let Some(db) = db {
                settings.db_path = db;
            }
            if let Some(file) = desired_file {
                settings.desired_file = Some(file);
            }

            let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
            runtime.block_on(serve(settings))
        }
        Commands::Validate { file } => validate(&file),
    }
}

async fn serve(settings: Settings) -> Result<()> {
    info!(backend = %settings.backend, port = settings.api_port, "starting vmplane");
    if !backend_available(settings.backend) {
        tracing::warn!(
            backend = %settings.backend,
            "backend binary not found; vm boots will fail until it is installed"
        );
    }

    if let Some(parent) = settings.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = DesiredStore::open(&settings.db_path)
        .await
        .with_context(|| format!("opening store at {}", settings.db_path.display()))?;

    let driver = create_driver(&settings);
    let pool = PoolManager::new(store.clone(), driver, Arc::new(LogProxy), &settings);

    // Bootstrap runs once, concurrently with the first reconciler ticks;
    // the reconciler tolerates a store that is still populating.
    if let Some(desired_file) = settings.desired_file.clone() {
        let store = store.clone();
        tokio::spawn(async move {
            store.bootstrap_from_file(&desired_file).await;
        });
    }

    let reconciler = Reconciler::new(pool.clone()).spawn();

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.api_port));
    tokio::select! {
        result = http_api::run_server(addr, pool.clone()) => {
            result.context("api server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    reconciler.shutdown().await;
    pool.shutdown().await;
    info!("vmplane stopped");
    Ok(())
}

fn validate(file: &PathBuf) -> Result<()> {
    let jobs = load_desired_file(file)?;
    for job in &jobs {
        println!(
            "{}\ttenant={}\tlifecycle={}\tfingerprint={}",
            job.job_id,
            job.tenant,
            job.spec.lifecycle,
            fingerprint(&job.spec)
        );
    }
    println!("{} job(s) ok", jobs.len());
    Ok(())
}
