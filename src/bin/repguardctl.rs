//! repguardctl - Command line tool for a running repguard daemon
//!
//! Usage:
//!   repguardctl status          - Show local node and voting status
//!   repguardctl cluster         - Show registered nodes
//!   repguardctl pause|unpause   - Pause or resume failover on this node
//!   repguardctl rerun           - Ask every node to discard the current election
//!   repguardctl follow <id>     - Make this node follow an active primary
//!   repguardctl check           - Run node checks (text, csv or nagios)
//!   repguardctl events          - Show recent events

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use repguard::api::{ActionResponse, ClusterResponse, ErrorResponse, StatusResponse};
use repguard::events::EventRecord;
use repguard::replication::format_lsn;

/// repguard control tool
#[derive(Parser)]
#[command(name = "repguardctl")]
#[command(about = "Control and inspect a repguard daemon", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/repguard/repguard.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of the local node
    Status,
    /// List registered nodes
    Cluster,
    /// Pause failover on this node
    Pause,
    /// Resume failover on this node
    Unpause,
    /// Request an election rerun on every node
    Rerun,
    /// Follow the given primary on the next monitoring cycle
    Follow {
        node_id: u32,
    },
    /// Run node checks
    Check {
        /// Output format: text, csv or nagios
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Show recent events
    Events {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
        }
    }
}

fn default_api_bind() -> String {
    "0.0.0.0:8090".to_string()
}

fn endpoint_from_config(path: &PathBuf) -> String {
    let addr = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(default_api_bind);

    // A wildcard bind is reached through loopback
    match addr.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => format!("http://{}", addr),
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let endpoint = match &cli.endpoint {
        Some(e) => e.trim_end_matches('/').to_string(),
        None => endpoint_from_config(&cli.config),
    };

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Cluster => show_cluster(&endpoint).await,
        Commands::Pause => action(&endpoint, "/pause").await,
        Commands::Unpause => action(&endpoint, "/unpause").await,
        Commands::Rerun => action(&endpoint, "/admin/rerun-election").await,
        Commands::Follow { node_id } => action(&endpoint, &format!("/admin/follow/{}", node_id)).await,
        Commands::Check { format } => run_check(&endpoint, format).await,
        Commands::Events { limit } => show_events(&endpoint, *limit).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

// ============ Commands ============

type CtlResult = Result<i32, Box<dyn std::error::Error>>;

async fn api_error(response: reqwest::Response) -> Box<dyn std::error::Error> {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => format!("{} ({}): {}", status, body.code, body.error).into(),
        Err(_) => format!("API error: {}", status).into(),
    }
}

async fn show_status(endpoint: &str) -> CtlResult {
    let response = reqwest::get(format!("{}/status", endpoint)).await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    let status: StatusResponse = response.json().await?;
    let c = &status.coordination;

    println!();
    println!("Node {} ({})", status.node.id, status.node.name);
    println!("==========================");
    println!("Role:             {}", status.node.node_type);
    println!("Priority:         {}", status.node.priority);
    match c.upstream_node_id {
        Some(id) => println!("Upstream:         node {} (last seen {}s ago)", id, c.upstream_last_seen),
        None => println!("Upstream:         none"),
    }
    println!("Paused:           {}", if c.paused { "yes" } else { "no" });
    println!(
        "Daemon:           {}",
        match (c.daemon_running, c.daemon_pid) {
            (true, Some(pid)) => format!("running (pid {})", pid),
            _ => "not running".to_string(),
        }
    );
    println!("Voting status:    {}", c.voting_status);
    println!("Electoral term:   {}", c.current_electoral_term);
    if let Some(candidate) = c.candidate {
        println!("Candidate:        {}", candidate);
    }

    if let Some(r) = &status.replication {
        println!();
        println!("In recovery:      {}", r.in_recovery);
        println!("Receive LSN:      {}", format_lsn(r.last_wal_receive_lsn));
        println!("Replay LSN:       {}", format_lsn(r.last_wal_replay_lsn));
        println!("Replication lag:  {}s", r.replication_lag_time);
        if r.wal_replay_paused {
            println!("WAL replay:       paused");
        }
    }
    println!();
    Ok(0)
}

async fn show_cluster(endpoint: &str) -> CtlResult {
    let response = reqwest::get(format!("{}/cluster", endpoint)).await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    let info: ClusterResponse = response.json().await?;

    println!();
    match info.primary {
        Some(id) => println!("Primary: node {}", id),
        None => println!("Primary: NONE"),
    }
    println!();
    println!("{:<6} {:<16} {:<9} {:<9} {:<8} {:<7}", "ID", "NAME", "ROLE", "UPSTREAM", "PRIORITY", "ACTIVE");
    println!("{}", "-".repeat(60));

    for node in &info.nodes {
        let upstream = node
            .upstream_node_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        let active = if node.active {
            "\x1b[32myes\x1b[0m    "
        } else {
            "\x1b[31mno\x1b[0m     "
        };
        println!(
            "{:<6} {:<16} {:<9} {:<9} {:<8} {}",
            node.id, node.name, node.node_type, upstream, node.priority, active
        );
    }
    println!();
    Ok(0)
}

async fn action(endpoint: &str, path: &str) -> CtlResult {
    let client = reqwest::Client::new();
    let response = client.post(format!("{}{}", endpoint, path)).send().await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let result: ActionResponse = response.json().await?;
    println!("{}", result.message);
    Ok(if result.success { 0 } else { 1 })
}

async fn run_check(endpoint: &str, format: &str) -> CtlResult {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/check", endpoint))
        .query(&[("format", format)])
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let body = response.text().await?;
    print!("{}", body);

    // Nagios plugins report through the exit code
    let code = match body.split_whitespace().nth(1).filter(|_| format == "nagios") {
        Some("OK") | None => 0,
        Some("WARNING") => 1,
        Some("CRITICAL") => 2,
        Some(_) => 3,
    };
    Ok(code)
}

async fn show_events(endpoint: &str, limit: usize) -> CtlResult {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/events", endpoint))
        .query(&[("limit", limit)])
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let events: Vec<EventRecord> = response.json().await?;
    for event in events.iter().rev() {
        println!(
            "{}  node {:<4} {:<32} {:<5} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.node_id,
            event.event_type,
            if event.successful { "ok" } else { "fail" },
            event.details
        );
    }
    Ok(0)
}
