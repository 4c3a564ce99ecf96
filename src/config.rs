//! repguard Configuration
//!
//! This module provides configuration structures for the repguard
//! failover daemon.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::election::{ConsensusPolicy, ElectionConfig};
use crate::monitor::{ChildMonitorConfig, FailoverMode, MonitorConfig};
use crate::registry::NodeId;

/// Main repguard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepguardConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Registry database connection
    pub registry: RegistryConfig,

    /// Health monitoring
    #[serde(default)]
    pub monitor: MonitorSection,

    /// Failover behaviour
    #[serde(default)]
    pub failover: FailoverSection,

    /// Daemon process settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Registry node id
    pub id: NodeId,

    /// Registry node name
    pub name: String,

    /// Address to bind the coordination server
    pub bind_address: String,

    /// Data directory for the state file and event journal
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Expected upstream before the registry has been read
    #[serde(default)]
    pub upstream_node_id: Option<NodeId>,
}

/// Registry database connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Connection string of the local node
    pub conninfo: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Health monitoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSection {
    /// Seconds between monitoring cycles
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Attempts to reach the upstream before declaring it down
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Seconds between reconnect attempts
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    /// Exit after this many seconds in degraded monitoring (unset = never)
    #[serde(default)]
    pub degraded_monitoring_timeout_secs: Option<u64>,

    /// Timeout for any single call to a peer
    #[serde(default = "default_async_query_timeout")]
    pub async_query_timeout_secs: u64,

    /// Seconds between child node checks on the primary
    #[serde(default = "default_child_nodes_check_interval")]
    pub child_nodes_check_interval_secs: u64,

    /// Disconnected children that trigger the disconnect command
    #[serde(default)]
    pub child_nodes_disconnect_min_count: Option<usize>,

    /// Fewer connected children than this triggers the disconnect command
    #[serde(default)]
    pub child_nodes_connected_min_count: Option<usize>,

    /// Whether witnesses count towards the connected children
    #[serde(default)]
    pub child_nodes_connected_include_witness: bool,

    /// Seconds the threshold must hold before the command runs
    #[serde(default = "default_child_nodes_disconnect_timeout")]
    pub child_nodes_disconnect_timeout_secs: u64,

    /// Command run when the child node threshold is crossed
    #[serde(default)]
    pub child_nodes_disconnect_command: Option<String>,

    /// Replication lag warning threshold (seconds)
    #[serde(default = "default_lag_warning")]
    pub replication_lag_warning_secs: i64,

    /// Replication lag critical threshold (seconds)
    #[serde(default = "default_lag_critical")]
    pub replication_lag_critical_secs: i64,
}

/// Failover settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverSection {
    /// automatic or manual
    #[serde(default)]
    pub mode: FailoverMode,

    /// Abort promotion while any sibling still sees the primary
    #[serde(default)]
    pub primary_visibility_consensus: bool,

    /// How many votes a candidate needs
    #[serde(default)]
    pub consensus: ConsensusPolicy,

    /// Seconds to wait for a result before forcing a rerun
    #[serde(default = "default_election_rerun_interval")]
    pub election_rerun_interval_secs: u64,

    /// Seconds a losing candidate waits for the winner's notification
    #[serde(default = "default_primary_notification_timeout")]
    pub primary_notification_timeout_secs: u64,

    /// Largest number of terms a candidate will skip to catch up with a peer
    #[serde(default = "default_max_term_catchup")]
    pub max_term_catchup: u64,

    /// Disconnect the WAL receiver before the election
    #[serde(default)]
    pub standby_disconnect_on_failover: bool,

    /// Command promoting the local node
    #[serde(default)]
    pub promote_command: Option<String>,

    /// Command making the local node follow a new primary (%n = id, %a = conninfo)
    #[serde(default)]
    pub follow_command: Option<String>,

    /// Command disconnecting the local WAL receiver
    #[serde(default)]
    pub disconnect_wal_receiver_command: Option<String>,
}

/// Daemon process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Pidfile path (default: <data_dir>/repguard.pid)
    #[serde(default)]
    pub pidfile: Option<PathBuf>,

    /// Pause state file (default: <data_dir>/repguard.state)
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Keep a local SQLite journal of events
    #[serde(default = "default_true")]
    pub event_journal: bool,

    /// Events kept in memory for the API
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_pool_size() -> u32 {
    4
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_monitor_interval() -> u64 {
    2
}

fn default_reconnect_attempts() -> u32 {
    6
}

fn default_reconnect_interval() -> u64 {
    10
}

fn default_async_query_timeout() -> u64 {
    60
}

fn default_child_nodes_check_interval() -> u64 {
    5
}

fn default_child_nodes_disconnect_timeout() -> u64 {
    30
}

fn default_lag_warning() -> i64 {
    300
}

fn default_lag_critical() -> i64 {
    600
}

fn default_election_rerun_interval() -> u64 {
    15
}

fn default_primary_notification_timeout() -> u64 {
    60
}

fn default_max_term_catchup() -> u64 {
    16
}

fn default_event_buffer() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/repguard")
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_interval_secs: default_reconnect_interval(),
            degraded_monitoring_timeout_secs: None,
            async_query_timeout_secs: default_async_query_timeout(),
            child_nodes_check_interval_secs: default_child_nodes_check_interval(),
            child_nodes_disconnect_min_count: None,
            child_nodes_connected_min_count: None,
            child_nodes_connected_include_witness: false,
            child_nodes_disconnect_timeout_secs: default_child_nodes_disconnect_timeout(),
            child_nodes_disconnect_command: None,
            replication_lag_warning_secs: default_lag_warning(),
            replication_lag_critical_secs: default_lag_critical(),
        }
    }
}

impl Default for FailoverSection {
    fn default() -> Self {
        Self {
            mode: FailoverMode::default(),
            primary_visibility_consensus: false,
            consensus: ConsensusPolicy::default(),
            election_rerun_interval_secs: default_election_rerun_interval(),
            primary_notification_timeout_secs: default_primary_notification_timeout(),
            max_term_catchup: default_max_term_catchup(),
            standby_disconnect_on_failover: false,
            promote_command: None,
            follow_command: None,
            disconnect_wal_receiver_command: None,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pidfile: None,
            state_file: None,
            event_journal: true,
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl RepguardConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: RepguardConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.name.is_empty() {
            return Err(crate::Error::Config("node.name cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.node.upstream_node_id == Some(self.node.id) {
            return Err(crate::Error::Config(
                "node.upstream_node_id cannot be the node's own id".into(),
            ));
        }

        if self.registry.conninfo.is_empty() {
            return Err(crate::Error::Config("registry.conninfo cannot be empty".into()));
        }

        if self.monitor.reconnect_attempts == 0 {
            return Err(crate::Error::Config("monitor.reconnect_attempts must be at least 1".into()));
        }

        if self.monitor.replication_lag_warning_secs > self.monitor.replication_lag_critical_secs {
            return Err(crate::Error::Config(
                "monitor.replication_lag_warning_secs exceeds the critical threshold".into(),
            ));
        }

        if self.api.enabled && self.api.bind_address == self.node.bind_address {
            return Err(crate::Error::Config(
                "api.bind_address and node.bind_address must differ".into(),
            ));
        }

        if let ConsensusPolicy::AtLeast(0) = self.failover.consensus {
            return Err(crate::Error::Config("failover.consensus at_least must be positive".into()));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    pub fn pidfile(&self) -> PathBuf {
        self.daemon
            .pidfile
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("repguard.pid"))
    }

    pub fn state_file(&self) -> PathBuf {
        self.daemon
            .state_file
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("repguard.state"))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.registry.connect_timeout_secs)
    }

    pub fn async_query_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.async_query_timeout_secs)
    }

    /// Runtime settings for the health monitor
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            monitor_interval: Duration::from_secs(self.monitor.monitor_interval_secs),
            reconnect_attempts: self.monitor.reconnect_attempts,
            reconnect_interval: Duration::from_secs(self.monitor.reconnect_interval_secs),
            degraded_monitoring_timeout: self
                .monitor
                .degraded_monitoring_timeout_secs
                .map(Duration::from_secs),
            failover_mode: self.failover.mode,
            primary_notification_timeout: Duration::from_secs(
                self.failover.primary_notification_timeout_secs,
            ),
            standby_disconnect_on_failover: self.failover.standby_disconnect_on_failover,
            children: ChildMonitorConfig {
                check_interval: Duration::from_secs(self.monitor.child_nodes_check_interval_secs),
                disconnect_min_count: self.monitor.child_nodes_disconnect_min_count,
                connected_min_count: self.monitor.child_nodes_connected_min_count,
                include_witness: self.monitor.child_nodes_connected_include_witness,
                disconnect_timeout: Duration::from_secs(
                    self.monitor.child_nodes_disconnect_timeout_secs,
                ),
                disconnect_command: self.monitor.child_nodes_disconnect_command.clone(),
            },
        }
    }

    /// Runtime settings for elections
    pub fn election_config(&self) -> ElectionConfig {
        let down_after = self.monitor.reconnect_interval_secs
            * u64::from(self.monitor.reconnect_attempts);

        ElectionConfig {
            async_query_timeout: self.async_query_timeout(),
            election_rerun_interval: Duration::from_secs(self.failover.election_rerun_interval_secs),
            primary_visibility_consensus: self.failover.primary_visibility_consensus,
            visibility_window_secs: i64::try_from(down_after).unwrap_or(i64::MAX),
            consensus: self.failover.consensus,
            max_term_catchup: self.failover.max_term_catchup,
        }
    }
}
