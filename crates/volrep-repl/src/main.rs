use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use volrep_repl::{
    load_intents, spawn_eviction, Controller, ControllerConfig, ControllerOptions, DriverService,
    EventBus, IntentStore, MemoryStore, OperationAdapter, RemoteDriverResolver,
    ReplicationStateMachine, SimulatedBackend, StaticEndpointResolver,
};
use volrep_transport::{BackoffPolicy, ChannelRegistry, RpcConnector, RpcServer, TcpTransport};

#[derive(Parser)]
#[command(name = "volrepd")]
#[command(about = "Volume replication orchestrator", long_about = None)]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true, env = "VOLREP_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation controller.
    Run {
        #[arg(short, long, default_value = "/etc/volrep/volrepd.toml")]
        config: PathBuf,
        /// Seed the in-memory store with intents from this file.
        #[arg(short, long)]
        intents: Option<PathBuf>,
    },
    /// Serve the simulated storage backend.
    Sidecar {
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    match cli.command {
        Command::Run { config, intents } => run_controller(config, intents).await,
        Command::Sidecar { listen } => run_sidecar(listen).await,
    }
}

async fn run_controller(config_path: PathBuf, intents: Option<PathBuf>) -> Result<()> {
    let config = ControllerConfig::load_or_default(&config_path)?;
    tracing::info!(workers = config.workers, endpoints = config.endpoints.len(), "volrepd starting");

    let registry = Arc::new(ChannelRegistry::new(
        RpcConnector::new(config.transport.tcp(), config.transport.rpc()),
        config.transport.registry(),
    ));
    let deadline = config.transport.operation_deadline();
    let resolver = Arc::new(RemoteDriverResolver::new(registry.clone(), deadline));
    let adapter = Arc::new(OperationAdapter::new(resolver, deadline));
    let machine = Arc::new(ReplicationStateMachine::new(
        adapter,
        BackoffPolicy::new(config.backoff.clone()),
        config.refresh_interval(),
    ));

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = intents {
        for intent in load_intents(&path)? {
            tracing::info!(intent = %intent.name, "seeding intent");
            store.apply(intent).await?;
        }
    }

    let endpoints = Arc::new(StaticEndpointResolver::new(
        config.endpoints.clone(),
        config.default_endpoint.clone(),
    ));
    let controller = Controller::new(
        store,
        machine,
        endpoints,
        Arc::new(EventBus::default()),
        ControllerOptions::from(&config),
    );

    let maintenance = CancellationToken::new();
    let eviction = spawn_eviction(
        registry,
        config.transport.eviction_interval(),
        maintenance.clone(),
    );
    let locks = controller.machine().adapter().locks().clone();
    let lock_pruning = {
        let cancel = maintenance.clone();
        let interval = config.transport.eviction_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        locks.prune();
                    }
                }
            }
        })
    };

    let running = tokio::spawn(controller.clone().run());
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    controller.shutdown();
    maintenance.cancel();
    running.await??;
    let _ = tokio::join!(eviction, lock_pruning);
    Ok(())
}

async fn run_sidecar(listen: String) -> Result<()> {
    let transport = TcpTransport::new(Default::default());
    let listener = transport.listen(&listen).await?;
    tracing::info!(addr = %listen, "simulated sidecar listening");
    let service = Arc::new(DriverService::new(Arc::new(SimulatedBackend::new())));

    tokio::select! {
        served = RpcServer::serve(&transport, listener, service) => served?,
        _ = tokio::signal::ctrl_c() => tracing::info!("sidecar stopping"),
    }
    Ok(())
}
