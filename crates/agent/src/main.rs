mod agent_manager;
mod cdn;
mod cmd;
mod config;
mod error;
mod http;
mod job_manager;
mod jobs;
mod metrics;
mod ping;
mod pool;
mod storage;
mod web;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent_manager::AgentManager;
use crate::cdn::{CdnNetwork, CdnResourceMapping};
use crate::config::AgentConfig;
use crate::http::HttpClientProvider;
use crate::job_manager::{JobLedger, JobManager};
use crate::jobs::{scheduler, DownloadClient, GetJobsClient, JobFactory, UploadClient};
use crate::metrics::Metrics;
use crate::ping::{PingInfoProvider, PingSender};
use crate::storage::FileStore;
use crate::web::AppState;

/// Jobs pulled from peers that may wait for submission at once.
const INTAKE_CAPACITY: usize = 256;

#[derive(Debug, Parser)]
#[command(name = "fleet-agent")]
#[command(about = "file-serving, job-running agent for a peer fleet", version)]
struct Cli {
    /// Agent config file (defaults to $FLEET_AGENT_CONFIG, then <data dir>/agent.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent (default when no subcommand is given)
    Run,
    /// Ping an agent's REST port and print its PingInfo
    Ping {
        host: String,
        port: u16,
        #[arg(long)]
        no_proxy: bool,
    },
    /// Ask the running agent which peers hold a resource
    Lookup { key: String },
    /// Download a URL into the files directory, here or on another agent
    Download {
        url: String,
        location: String,
        #[arg(long)]
        no_proxy: bool,
        /// Address the job to another agent (host:port) instead of running it here
        #[arg(long, value_name = "AGENT")]
        to: Option<String>,
    },
    /// Upload a file from the files directory to a URL
    Upload {
        location: String,
        url: String,
        #[arg(long)]
        no_proxy: bool,
    },
    /// Show one job
    Job { id: String },
    /// List recent jobs
    Jobs {
        /// PENDING, RUNNING, FINISHED or FAILED
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let shutdown = setup_shutdown_handler();
            tokio::select! {
                result = run_agent(config) => result,
                _ = shutdown => {
                    info!("Shutdown signal received, stopping agent gracefully");
                    Ok(())
                }
            }
        }
        Commands::Ping { host, port, no_proxy } => cmd::ping(config, host, port, no_proxy).await,
        Commands::Lookup { key } => cmd::lookup(&config, key).await,
        Commands::Download { url, location, no_proxy, to } => {
            cmd::download(&config, url, location, no_proxy, to).await
        }
        Commands::Upload { location, url, no_proxy } => cmd::upload(&config, location, url, no_proxy).await,
        Commands::Job { id } => cmd::job_status(&config, id).await,
        Commands::Jobs { state, limit } => cmd::list_jobs(&config, state, limit).await,
    }
}

async fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let self_id = config.agent_id();
    let metrics = Arc::new(Metrics::new());

    let store = FileStore::open(config.files_path())?;
    let index = Arc::new(CdnResourceMapping::load(&config.cdn_mapping_file())?);
    let http = Arc::new(HttpClientProvider::new(&config)?);

    let ping_info = PingInfoProvider::from_config(&config);
    let pinger = Arc::new(PingSender::new(config.clone(), http.clone(), ping_info.clone()));
    let agents = Arc::new(
        AgentManager::new(&self_id, config.peers()?, pinger, config.pools.ping, metrics.clone())
            .with_listener(http.clone()),
    );
    let cdn = Arc::new(CdnNetwork::new(
        config.clone(),
        agents.clone(),
        http.clone(),
        index,
        metrics.clone(),
    ));

    let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);
    let factory = JobFactory::new(
        Arc::new(DownloadClient::new(http.clone())),
        Arc::new(UploadClient::new(http.clone())),
        Arc::new(GetJobsClient::new(config.clone(), http.clone(), intake_tx)),
        agents.clone(),
        store.clone(),
        config.schedulers.get_new_jobs_batch_size,
    );
    let ledger = Arc::new(JobLedger::new(config.data_dir()));
    if let Err(e) = ledger.load_from_disk().await {
        warn!(error=%e, "failed to load job ledger, starting empty");
    }
    let jobs = Arc::new(JobManager::new(&config, ledger, factory, metrics.clone()));
    let _intake = jobs.spawn_intake(intake_rx);

    info!(agent=%self_id, peers = agents.get_all().len(), files=%store.root().display(), "starting agent");
    agents.refresh().await;
    let _get_new_jobs =
        scheduler::start_get_new_jobs(jobs.clone(), agents.clone(), &config.schedulers, metrics.clone());
    let _refresh_agents = scheduler::start_refresh_agents(jobs.clone(), &config.schedulers, metrics.clone());

    let state = AppState::new(config.clone(), ping_info, agents, cdn, jobs, store, metrics);
    let rest_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self_id.rest_port()));
    let cdn_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self_id.cdn_port()));
    tokio::try_join!(
        web::serve("rest", rest_addr, web::rest_router(state.clone())),
        web::serve("cdn", cdn_addr, web::cdn_router(state)),
    )
    .context("agent servers")?;
    Ok(())
}

async fn setup_shutdown_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error=%e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error=%e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
