//! Daemon Lifecycle
//!
//! Pidfile ownership, pid registration in the coordination block, and
//! operator pause/resume. A paused daemon keeps monitoring but neither
//! stands for election nor votes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::coordination::Coordination;
use crate::error::{Error, Result};
use crate::events::{EventRecorder, EventType};
use crate::registry::NodeId;
use crate::state::{LivenessProbe, SharedState};

/// Pidfile owned by a running daemon
#[derive(Debug, Clone)]
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The pid recorded in the file, if any
    pub async fn read(&self) -> Result<Option<u32>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents
                .trim()
                .parse::<u32>()
                .map(Some)
                .map_err(|_| Error::State(format!("invalid pidfile {}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `pid`, refusing when the file names another live process
    pub async fn acquire(&self, pid: u32, probe: &dyn LivenessProbe) -> Result<()> {
        match self.read().await {
            Ok(Some(existing)) if existing != pid && probe.is_alive(existing) => {
                return Err(Error::AlreadyRunning(existing));
            }
            Ok(Some(existing)) if existing != pid => {
                tracing::warn!("removing stale pidfile {} (pid {})", self.path.display(), existing);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("ignoring unreadable pidfile: {}", e),
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, format!("{}\n", pid)).await?;
        Ok(())
    }

    pub async fn release(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonStatus {
    pub pid: Option<u32>,
    pub pidfile: Option<PathBuf>,
    pub running: bool,
    pub paused: bool,
}

pub struct Lifecycle {
    node_id: NodeId,
    state: Arc<SharedState>,
    events: Arc<EventRecorder>,
    probe: Arc<dyn LivenessProbe>,
    pidfile: Option<Pidfile>,
}

impl Lifecycle {
    pub fn new(
        node_id: NodeId,
        state: Arc<SharedState>,
        events: Arc<EventRecorder>,
        probe: Arc<dyn LivenessProbe>,
        pidfile: Option<Pidfile>,
    ) -> Self {
        Self {
            node_id,
            state,
            events,
            probe,
            pidfile,
        }
    }

    /// Claim the pidfile and register `pid` as the running daemon
    pub async fn start(&self, pid: u32) -> Result<()> {
        if let Some(pidfile) = &self.pidfile {
            pidfile.acquire(pid, self.probe.as_ref()).await?;
        }
        self.state
            .set_daemon_pid(Some(pid), self.pidfile.as_ref().map(|p| p.path().to_path_buf()))
            .await;

        let paused = self.state.is_paused().await?;
        let details = if paused {
            format!("monitoring daemon started with pid {} (paused)", pid)
        } else {
            format!("monitoring daemon started with pid {}", pid)
        };
        self.events
            .emit(self.node_id, EventType::DaemonStart, true, details)
            .await;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.state.set_daemon_pid(None, None).await;
        if let Some(pidfile) = &self.pidfile {
            pidfile.release().await?;
        }
        self.events
            .emit(self.node_id, EventType::DaemonShutdown, true, "monitoring daemon shut down")
            .await;
        Ok(())
    }

    /// Pause failover; `false` if already paused
    pub async fn pause(&self) -> Result<bool> {
        self.set_paused(true).await
    }

    /// Resume failover; `false` if not paused
    pub async fn unpause(&self) -> Result<bool> {
        self.set_paused(false).await
    }

    async fn set_paused(&self, paused: bool) -> Result<bool> {
        // Swap in one step so concurrent requests agree on who changed it
        if self.state.set_paused(paused).await? == paused {
            return Ok(false);
        }

        let (event_type, details) = if paused {
            (EventType::DaemonPause, "failover paused by operator")
        } else {
            (EventType::DaemonUnpause, "failover resumed by operator")
        };
        self.events
            .emit(self.node_id, event_type, true, details)
            .await;
        Ok(true)
    }

    pub async fn status(&self) -> Result<DaemonStatus> {
        Ok(DaemonStatus {
            pid: self.state.get_daemon_pid().await,
            pidfile: self.state.get_daemon_pidfile().await,
            running: self.state.is_daemon_running().await,
            paused: self.state.is_paused().await?,
        })
    }
}
