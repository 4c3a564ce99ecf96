//! Node Checks
//!
//! Point-in-time health checks of the local node, reported in plain text,
//! CSV or Nagios plugin format.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::{Node, NodeType};
use crate::replication::ReplicationStatus;
use crate::state::CoordinationSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warning => "WARNING",
            CheckStatus::Critical => "CRITICAL",
            CheckStatus::Unknown => "UNKNOWN",
        }
    }

    /// Nagios plugin exit code
    pub fn exit_code(&self) -> i32 {
        match self {
            CheckStatus::Ok => 0,
            CheckStatus::Warning => 1,
            CheckStatus::Critical => 2,
            CheckStatus::Unknown => 3,
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    /// Nagios performance data, e.g. `lag=12s;300;600`
    pub perfdata: Option<String>,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            perfdata: None,
        }
    }

    fn with_perfdata(mut self, perfdata: String) -> Self {
        self.perfdata = Some(perfdata);
        self
    }
}

/// Warning and critical limits, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckThresholds {
    pub warning_secs: i64,
    pub critical_secs: i64,
}

impl Default for CheckThresholds {
    fn default() -> Self {
        Self {
            warning_secs: 300,
            critical_secs: 600,
        }
    }
}

impl CheckThresholds {
    fn classify(&self, secs: i64) -> CheckStatus {
        if secs >= self.critical_secs {
            CheckStatus::Critical
        } else if secs >= self.warning_secs {
            CheckStatus::Warning
        } else {
            CheckStatus::Ok
        }
    }
}

pub fn check_lag(node: &Node, status: Option<&ReplicationStatus>, limits: CheckThresholds) -> CheckResult {
    if node.node_type != NodeType::Standby {
        return CheckResult::new("replication_lag", CheckStatus::Ok, format!("node is {}", node.node_type));
    }
    let Some(status) = status else {
        return CheckResult::new("replication_lag", CheckStatus::Unknown, "replication status unavailable");
    };

    let lag = status.replication_lag_time;
    let mut message = format!("{} seconds", lag);
    if status.wal_replay_paused {
        message.push_str(" (WAL replay paused)");
    }
    CheckResult::new("replication_lag", limits.classify(lag), message).with_perfdata(format!(
        "lag={}s;{};{}",
        lag, limits.warning_secs, limits.critical_secs
    ))
}

pub fn check_upstream(node: &Node, snapshot: &CoordinationSnapshot, limits: CheckThresholds) -> CheckResult {
    if node.node_type == NodeType::Primary {
        return CheckResult::new("upstream", CheckStatus::Ok, "primary has no upstream");
    }

    let upstream = match snapshot.upstream_node_id {
        Some(id) => format!("node {}", id),
        None => "upstream".to_string(),
    };
    if snapshot.upstream_last_seen < 0 {
        return CheckResult::new("upstream", CheckStatus::Critical, format!("{} never seen", upstream));
    }

    let seen = snapshot.upstream_last_seen;
    CheckResult::new(
        "upstream",
        limits.classify(seen),
        format!("{} last seen {} second(s) ago", upstream, seen),
    )
    .with_perfdata(format!("upstream_last_seen={}s;{};{}", seen, limits.warning_secs, limits.critical_secs))
}

pub fn check_daemon(snapshot: &CoordinationSnapshot) -> CheckResult {
    match (snapshot.daemon_running, snapshot.paused) {
        (true, false) => CheckResult::new(
            "daemon",
            CheckStatus::Ok,
            format!("running (pid {})", snapshot.daemon_pid.unwrap_or_default()),
        ),
        (true, true) => CheckResult::new("daemon", CheckStatus::Warning, "running, failover paused"),
        (false, _) => CheckResult::new("daemon", CheckStatus::Critical, "not running"),
    }
}

/// Registered role against what the database reports
pub fn check_role(node: &Node, status: Option<&ReplicationStatus>) -> CheckResult {
    let Some(status) = status else {
        return CheckResult::new("role", CheckStatus::Unknown, format!("registered as {}", node.node_type));
    };

    match (node.node_type, status.in_recovery) {
        (NodeType::Primary, true) => CheckResult::new(
            "role",
            CheckStatus::Critical,
            "registered as primary but running in recovery",
        ),
        (NodeType::Standby, false) => CheckResult::new(
            "role",
            CheckStatus::Critical,
            "registered as standby but not in recovery",
        ),
        (node_type, _) => CheckResult::new("role", CheckStatus::Ok, format!("{}", node_type)),
    }
}

/// Failover history as seen by the event recorder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSummary {
    /// A split brain is among the recently recorded events
    pub split_brain: bool,
    /// Successful promotions recorded on this node
    pub failovers: u64,
}

pub fn check_events(summary: EventSummary) -> CheckResult {
    let perfdata = format!("failovers={}", summary.failovers);
    if summary.split_brain {
        return CheckResult::new("events", CheckStatus::Critical, "split brain recorded recently")
            .with_perfdata(perfdata);
    }
    CheckResult::new(
        "events",
        CheckStatus::Ok,
        format!("{} promotion(s) recorded", summary.failovers),
    )
    .with_perfdata(perfdata)
}

pub fn run_checks(
    node: &Node,
    status: Option<&ReplicationStatus>,
    snapshot: &CoordinationSnapshot,
    events: EventSummary,
    limits: CheckThresholds,
) -> Vec<CheckResult> {
    vec![
        check_role(node, status),
        check_lag(node, status, limits),
        check_upstream(node, snapshot, limits),
        check_daemon(snapshot),
        check_events(events),
    ]
}

/// Worst status among `results`
pub fn overall(results: &[CheckResult]) -> CheckStatus {
    results
        .iter()
        .map(|r| r.status)
        .max()
        .unwrap_or(CheckStatus::Unknown)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Csv,
    Nagios,
}

impl std::str::FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "csv" => Ok(OutputFormat::Csv),
            "nagios" => Ok(OutputFormat::Nagios),
            other => Err(Error::Config(format!("unknown output format '{}'", other))),
        }
    }
}

impl OutputFormat {
    pub fn render(&self, node: &Node, results: &[CheckResult]) -> String {
        match self {
            OutputFormat::Text => render_text(node, results),
            OutputFormat::Csv => render_csv(node, results),
            OutputFormat::Nagios => render_nagios(results),
        }
    }
}

fn render_text(node: &Node, results: &[CheckResult]) -> String {
    let mut out = format!("node {} ({}): {}\n", node.id, node.name, overall(results));
    for r in results {
        out.push_str(&format!("  {:<16} {:<8} {}\n", r.name, r.status, r.message));
    }
    out
}

fn csv_field(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn render_csv(node: &Node, results: &[CheckResult]) -> String {
    results
        .iter()
        .map(|r| {
            format!(
                "{},{},{},{}\n",
                node.id,
                csv_field(&r.name),
                r.status.exit_code(),
                csv_field(&r.message)
            )
        })
        .collect()
}

fn render_nagios(results: &[CheckResult]) -> String {
    let status = overall(results);
    let summary: Vec<String> = results
        .iter()
        .map(|r| format!("{}: {}", r.name, r.message))
        .collect();
    let perfdata: Vec<&str> = results.iter().filter_map(|r| r.perfdata.as_deref()).collect();

    if perfdata.is_empty() {
        format!("REPGUARD {} - {}\n", status, summary.join("; "))
    } else {
        format!("REPGUARD {} - {} | {}\n", status, summary.join("; "), perfdata.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_node;
    use crate::state::VotingStatus;

    fn snapshot(last_seen: i64, running: bool, paused: bool) -> CoordinationSnapshot {
        CoordinationSnapshot {
            local_node_id: Some(2),
            paused,
            upstream_node_id: Some(1),
            upstream_last_seen: last_seen,
            voting_status: VotingStatus::NoVote,
            current_electoral_term: 0,
            candidate: None,
            follow_new_primary: false,
            daemon_pid: running.then_some(4242),
            daemon_running: running,
        }
    }

    fn standby_status(lag: i64) -> ReplicationStatus {
        ReplicationStatus {
            in_recovery: true,
            replication_lag_time: lag,
            ..ReplicationStatus::default()
        }
    }

    #[test]
    fn test_lag_thresholds() {
        let node = test_node(2, NodeType::Standby, Some(1), 50);
        let limits = CheckThresholds::default();

        assert_eq!(check_lag(&node, Some(&standby_status(5)), limits).status, CheckStatus::Ok);
        assert_eq!(check_lag(&node, Some(&standby_status(300)), limits).status, CheckStatus::Warning);
        assert_eq!(check_lag(&node, Some(&standby_status(900)), limits).status, CheckStatus::Critical);
        assert_eq!(check_lag(&node, None, limits).status, CheckStatus::Unknown);
    }

    #[test]
    fn test_role_mismatch_is_critical() {
        let primary = test_node(1, NodeType::Primary, None, 100);
        assert_eq!(check_role(&primary, Some(&standby_status(0))).status, CheckStatus::Critical);

        let standby = test_node(2, NodeType::Standby, Some(1), 50);
        assert_eq!(check_role(&standby, Some(&standby_status(0))).status, CheckStatus::Ok);
    }

    #[test]
    fn test_upstream_and_daemon() {
        let node = test_node(2, NodeType::Standby, Some(1), 50);
        let limits = CheckThresholds::default();

        assert_eq!(check_upstream(&node, &snapshot(-1, true, false), limits).status, CheckStatus::Critical);
        assert_eq!(check_upstream(&node, &snapshot(3, true, false), limits).status, CheckStatus::Ok);
        assert_eq!(check_daemon(&snapshot(3, true, true)).status, CheckStatus::Warning);
        assert_eq!(check_daemon(&snapshot(3, false, false)).status, CheckStatus::Critical);
    }

    #[test]
    fn test_recent_split_brain_is_critical() {
        let quiet = check_events(EventSummary { split_brain: false, failovers: 2 });
        assert_eq!(quiet.status, CheckStatus::Ok);
        assert_eq!(quiet.perfdata.as_deref(), Some("failovers=2"));

        let split = check_events(EventSummary { split_brain: true, failovers: 2 });
        assert_eq!(split.status, CheckStatus::Critical);
    }

    #[test]
    fn test_output_formats() {
        let node = test_node(2, NodeType::Standby, Some(1), 50);
        let results = run_checks(
            &node,
            Some(&standby_status(12)),
            &snapshot(1, true, false),
            EventSummary::default(),
            CheckThresholds::default(),
        );
        assert_eq!(overall(&results), CheckStatus::Ok);

        let nagios = OutputFormat::Nagios.render(&node, &results);
        assert!(nagios.starts_with("REPGUARD OK - role: standby"));
        assert!(nagios.contains("| lag=12s;300;600 upstream_last_seen=1s;300;600 failovers=0"));

        let csv = OutputFormat::Csv.render(&node, &results);
        assert_eq!(csv.lines().count(), 5);
        assert!(csv.starts_with("2,\"role\",0,\"standby\""));

        let text = "text".parse::<OutputFormat>().unwrap().render(&node, &results);
        assert!(text.starts_with("node 2 (node2): OK"));
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
