//! repguard - Replication failover daemon
//!
//! Monitors one node of a streaming replication cluster and coordinates
//! automatic failover with the daemons on the other nodes.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use repguard::api::{AppState, HttpServer};
use repguard::check::CheckThresholds;
use repguard::config::{LoggingConfig, RepguardConfig};
use repguard::coordination::{Coordination, CoordinationClient, CoordinationServer, PeerDirectory, RpcPeers};
use repguard::error::{Error, Result};
use repguard::events::{EventJournal, EventRecorder};
use repguard::lifecycle::{Lifecycle, Pidfile};
use repguard::monitor::{CommandRejoin, HealthMonitor};
use repguard::notifier::FailoverNotifier;
use repguard::registry::{NodeRegistry, PgRegistry};
use repguard::replication::PgReplicationSource;
use repguard::state::{LivenessProbe, ProcessProbe, SharedState, StateFile};

/// repguard - Replication failover daemon
#[derive(Parser)]
#[command(name = "repguard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "repguard.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitoring daemon
    Start {
        /// Create the registry tables if they do not exist
        #[arg(long)]
        install_schema: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "repguard.toml")]
        output: PathBuf,

        /// Registry node id
        #[arg(long, default_value_t = 1)]
        node_id: u32,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Query a running daemon
    Status {
        /// API address to query
        #[arg(short, long, default_value = "localhost:8090")]
        address: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start { install_schema } => run_start(cli.config, cli.log_level, install_schema).await,
        command => {
            if let Err(e) = init_logging(&LoggingConfig::default(), cli.log_level.as_deref()) {
                eprintln!("Failed to initialise logging: {}", e);
            }
            match command {
                Commands::Init { output, node_id } => run_init(output, node_id),
                Commands::Validate => run_validate(cli.config),
                Commands::Info => run_info(cli.config),
                Commands::Status { address } => run_status(address).await,
                Commands::Start { .. } => Ok(()),
            }
        }
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

/// Initialize logging. `RUST_LOG` takes precedence over the configured level.
fn init_logging(config: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    let level = level_override.unwrap_or(&config.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let file_layer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    let compact = config.format == "compact";
    tracing_subscriber::registry()
        .with(env_filter)
        .with((!compact).then(|| tracing_subscriber::fmt::layer()))
        .with(compact.then(|| tracing_subscriber::fmt::layer().compact()))
        .with(file_layer)
        .init();
    Ok(())
}

/// Start the daemon
async fn run_start(config_path: PathBuf, level_override: Option<String>, install_schema: bool) -> Result<()> {
    let config = match RepguardConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    init_logging(&config.logging, level_override.as_deref())?;
    tracing::info!("Starting repguard for node {} ({})", config.node.id, config.node.name);

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    // Registry
    let registry = match PgRegistry::connect(
        &config.registry.conninfo,
        config.registry.pool_size,
        config.connect_timeout(),
    )
    .await
    {
        Ok(r) => Arc::new(r),
        Err(e) => {
            tracing::error!("Failed to connect to the registry: {}", e);
            return Err(e);
        }
    };
    if install_schema {
        registry.install_schema().await?;
        tracing::info!("Registry schema installed");
    }

    let local = registry
        .get_node(config.node.id)
        .await?
        .ok_or(Error::NodeNotFound(config.node.id))?;
    local.validate()?;
    if local.name != config.node.name {
        tracing::warn!(
            "node {} is registered as '{}' but configured as '{}'",
            local.id, local.name, config.node.name
        );
    }
    tracing::info!("Local node {} is registered as {}", local.id, local.node_type);

    // Coordination block
    let probe: Arc<dyn LivenessProbe> = Arc::new(ProcessProbe);
    let state = Arc::new(SharedState::new(
        Some(StateFile::new(config.state_file())),
        probe.clone(),
    ));
    state.set_local_node_id(local.id).await?;
    if let Some(upstream) = local.upstream_node_id.or(config.node.upstream_node_id) {
        state.set_upstream_node_id(upstream).await?;
    }

    // Events
    let journal = if config.daemon.event_journal {
        Some(EventJournal::open(config.data_dir())?)
    } else {
        None
    };
    let events = Arc::new(EventRecorder::new(registry.clone(), journal, config.daemon.event_buffer));

    let lifecycle = Arc::new(Lifecycle::new(
        local.id,
        state.clone(),
        events.clone(),
        probe,
        Some(Pidfile::new(config.pidfile())),
    ));
    lifecycle.start(std::process::id()).await?;

    // Peers
    let server = Arc::new(CoordinationServer::new(config.node.bind_address.clone(), state.clone()));
    let client = Arc::new(CoordinationClient::new(config.connect_timeout(), config.async_query_timeout()));
    let peers: Arc<dyn PeerDirectory> = Arc::new(RpcPeers::new(local.id, state.clone(), client.clone()));
    let replication = Arc::new(PgReplicationSource::new(config.connect_timeout()));

    let rejoin = Arc::new(CommandRejoin {
        promote_command: config.failover.promote_command.clone(),
        follow_command: config.failover.follow_command.clone(),
        disconnect_wal_receiver_command: config.failover.disconnect_wal_receiver_command.clone(),
    });

    let monitor = Arc::new(HealthMonitor::new(
        local.clone(),
        state.clone(),
        registry.clone(),
        replication.clone(),
        peers.clone(),
        rejoin,
        events.clone(),
        config.monitor_config(),
        config.election_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordination_server = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = coordination_server.start().await {
            tracing::error!("Coordination server error: {}", e);
        }
    });

    if config.api.enabled {
        let app = AppState {
            state: state.clone(),
            monitor: monitor.clone(),
            lifecycle: lifecycle.clone(),
            registry: registry.clone(),
            replication,
            notifier: Arc::new(FailoverNotifier::new(
                registry.clone(),
                peers,
                config.async_query_timeout(),
            )),
            events,
            thresholds: CheckThresholds {
                warning_secs: config.monitor.replication_lag_warning_secs,
                critical_secs: config.monitor.replication_lag_critical_secs,
            },
        };
        let http = HttpServer::new(config.api.clone(), app);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = http.start(rx).await {
                tracing::error!("HTTP API error: {}", e);
            }
        });
    }

    let monitor_rx = shutdown_rx.clone();
    let mut monitor_task = tokio::spawn(async move { monitor.run(monitor_rx).await });

    let finished = tokio::select! {
        joined = &mut monitor_task => Some(joined),
        _ = shutdown_signal() => None,
    };

    let _ = shutdown_tx.send(true);
    server.stop();

    let joined = match finished {
        Some(joined) => joined,
        None => {
            tracing::info!("Received shutdown signal");
            monitor_task.await
        }
    };
    let result = joined
        .map_err(|e| Error::Internal(format!("monitor task failed: {}", e)))
        .and_then(|r| r);

    client.close_all().await;
    if let Err(e) = lifecycle.shutdown().await {
        tracing::warn!("Failed to clean up: {}", e);
    }
    tracing::info!("repguard stopped");
    result
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!("Unable to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
        _ = terminate => {}
    }
}

/// Query a running daemon
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    let response = reqwest::get(&url)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    let status: serde_json::Value = response
        .json()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    let pretty = serde_json::to_string_pretty(&status).map_err(|e| Error::Internal(e.to_string()))?;
    println!("{}", pretty);
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: u32) -> Result<()> {
    let config_content = format!(r#"# repguard configuration

[node]
id = {node_id}
name = "node{node_id}"
# Coordination server, reached by the other daemons
bind_address = "0.0.0.0:7650"
data_dir = "/var/lib/repguard"

[registry]
conninfo = "host=localhost dbname=repguard user=repguard"
pool_size = 4
connect_timeout_secs = 5

[monitor]
monitor_interval_secs = 2
reconnect_attempts = 6
reconnect_interval_secs = 10
# degraded_monitoring_timeout_secs = 300
async_query_timeout_secs = 60
child_nodes_check_interval_secs = 5
# child_nodes_disconnect_min_count = 1
# child_nodes_connected_min_count = 1
child_nodes_connected_include_witness = false
child_nodes_disconnect_timeout_secs = 30
# child_nodes_disconnect_command = "/usr/local/bin/fence-primary %n"
replication_lag_warning_secs = 300
replication_lag_critical_secs = 600

[failover]
mode = "automatic"
primary_visibility_consensus = false
# consensus = "majority"  # none, majority, visible_majority or {{ at_least = 2 }}
election_rerun_interval_secs = 15
primary_notification_timeout_secs = 60
max_term_catchup = 16
standby_disconnect_on_failover = false
promote_command = "pg_ctl promote -D /var/lib/postgresql/data"
# %n = new primary id, %a = its conninfo
follow_command = "/usr/local/bin/follow-primary %n '%a'"
# disconnect_wal_receiver_command = "/usr/local/bin/stop-wal-receiver"

[daemon]
# pidfile = "/run/repguard/repguard.pid"
# state_file = "/var/lib/repguard/repguard.state"
event_journal = true
event_buffer = 256

[api]
enabled = true
bind_address = "0.0.0.0:8090"

[logging]
level = "info"
format = "pretty"
# file = "/var/log/repguard/repguard.log"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nRegister the node in the registry, then start with:");
    println!("  repguard --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match RepguardConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node:           {} ({})", config.node.id, config.node.name);
            println!("  Bind Address:   {}", config.node.bind_address);
            println!("  Failover Mode:  {}", config.failover.mode);
            println!("  Consensus:      {}", config.failover.consensus);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = RepguardConfig::from_file(&config_path)?;
    let monitor = config.monitor_config();
    let election = config.election_config();

    println!("repguard Node Information");
    println!("=========================");
    println!();
    println!("Node:             {} ({})", config.node.id, config.node.name);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Pidfile:          {}", config.pidfile().display());
    println!("State File:       {}", config.state_file().display());
    println!();
    println!("Monitoring:");
    println!("  Interval:       {:?}", monitor.monitor_interval);
    println!("  Reconnect:      {} x {:?}", monitor.reconnect_attempts, monitor.reconnect_interval);
    match monitor.degraded_monitoring_timeout {
        Some(t) => println!("  Degraded Limit: {:?}", t),
        None => println!("  Degraded Limit: none"),
    }
    println!();
    println!("Failover:");
    println!("  Mode:           {}", monitor.failover_mode);
    println!("  Consensus:      {}", election.consensus);
    println!("  Visibility:     {}", election.primary_visibility_consensus);
    println!("  Rerun After:    {:?}", election.election_rerun_interval);
    println!("  Query Timeout:  {:?}", election.async_query_timeout);

    Ok(())
}
