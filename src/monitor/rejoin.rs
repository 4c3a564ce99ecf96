//! Rejoin actions
//!
//! What a node does to itself once an election result arrives: promote,
//! follow a new primary, or cut its WAL receiver before voting. The daemon
//! runs configured shell commands; tests substitute a recorder.

use tokio::process::Command;

use crate::error::{Error, Result};
use crate::registry::Node;

#[async_trait::async_trait]
pub trait RejoinAction: Send + Sync {
    /// Promote the local node to primary
    async fn promote(&self, node: &Node) -> Result<()>;

    /// Re-point the local node at `new_primary`
    async fn follow(&self, node: &Node, new_primary: &Node) -> Result<()>;

    /// Stop streaming from the (failed) upstream
    async fn disconnect_wal_receiver(&self, node: &Node) -> Result<()>;

    /// React to too many children having detached from this primary
    async fn child_nodes_disconnect(&self, node: &Node, command: &str) -> Result<()>;
}

/// Runs the configured shell commands
#[derive(Debug, Clone, Default)]
pub struct CommandRejoin {
    pub promote_command: Option<String>,
    pub follow_command: Option<String>,
    pub disconnect_wal_receiver_command: Option<String>,
}

/// Expand `%n` (node id), `%a` (conninfo) and `%%` in a command template
pub fn expand_placeholders(template: &str, target: &Node) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push_str(&target.id.to_string()),
            Some('a') => out.push_str(&target.conninfo),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Run a command through `sh -c`, failing on a non-zero exit
pub async fn run_shell(command: &str) -> Result<()> {
    tracing::info!("executing: \"{}\"", command);

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .map_err(|e| Error::Command {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Command {
            command: command.to_string(),
            reason: format!("{}: {}", output.status, stderr.trim()),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        tracing::debug!("command output: {}", stdout.trim());
    }
    Ok(())
}

#[async_trait::async_trait]
impl RejoinAction for CommandRejoin {
    async fn promote(&self, node: &Node) -> Result<()> {
        let template = self
            .promote_command
            .as_deref()
            .ok_or_else(|| Error::Config("failover.promote_command is not set".into()))?;
        run_shell(&expand_placeholders(template, node)).await
    }

    async fn follow(&self, _node: &Node, new_primary: &Node) -> Result<()> {
        let template = self
            .follow_command
            .as_deref()
            .ok_or_else(|| Error::Config("failover.follow_command is not set".into()))?;
        run_shell(&expand_placeholders(template, new_primary)).await
    }

    async fn disconnect_wal_receiver(&self, node: &Node) -> Result<()> {
        match &self.disconnect_wal_receiver_command {
            Some(template) => run_shell(&expand_placeholders(template, node)).await,
            None => {
                tracing::warn!("standby_disconnect_on_failover set but no disconnect command configured");
                Ok(())
            }
        }
    }

    async fn child_nodes_disconnect(&self, node: &Node, command: &str) -> Result<()> {
        run_shell(&expand_placeholders(command, node)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{test_node, NodeType};

    #[test]
    fn test_expand_placeholders() {
        let node = test_node(2, NodeType::Standby, Some(1), 50);
        assert_eq!(
            expand_placeholders("follow --upstream=%n --conninfo='%a' 100%%", &node),
            "follow --upstream=2 --conninfo='host=node2 dbname=repguard user=repguard' 100%"
        );
        assert_eq!(expand_placeholders("odd %x and %", &node), "odd %x and %");
    }

    #[tokio::test]
    async fn test_run_shell_status() {
        assert!(run_shell("true").await.is_ok());
        match run_shell("echo broken >&2; exit 3").await {
            Err(Error::Command { reason, .. }) => assert!(reason.contains("broken")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_commands() {
        let rejoin = CommandRejoin::default();
        let node = test_node(2, NodeType::Standby, Some(1), 50);
        let primary = test_node(1, NodeType::Primary, None, 100);

        assert!(matches!(rejoin.promote(&node).await, Err(Error::Config(_))));
        assert!(matches!(rejoin.follow(&node, &primary).await, Err(Error::Config(_))));
        assert!(rejoin.disconnect_wal_receiver(&node).await.is_ok());
    }

    #[tokio::test]
    async fn test_follow_runs_expanded_command() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("followed");
        let rejoin = CommandRejoin {
            follow_command: Some(format!("echo %n > {}", marker.display())),
            ..CommandRejoin::default()
        };

        let node = test_node(3, NodeType::Standby, Some(1), 10);
        let primary = test_node(2, NodeType::Primary, None, 50);
        rejoin.follow(&node, &primary).await.unwrap();

        assert_eq!(std::fs::read_to_string(marker).unwrap().trim(), "2");
    }
}
