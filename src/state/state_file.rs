//! On-disk pause state.
//!
//! A single line `node_id:paused` (e.g. `3:1`). Older writers left a
//! trailing NUL byte, which is tolerated on read.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::registry::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredState {
    pub node_id: NodeId,
    pub paused: bool,
}

impl StoredState {
    fn parse(contents: &str) -> Result<Self> {
        let trimmed = contents.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());
        let (id, flag) = trimmed
            .split_once(':')
            .ok_or_else(|| Error::State(format!("malformed state file contents '{}'", trimmed)))?;

        let node_id = id
            .trim()
            .parse::<NodeId>()
            .map_err(|_| Error::State(format!("invalid node id '{}' in state file", id)))?;
        let paused = match flag.trim() {
            "0" => false,
            "1" => true,
            other => {
                return Err(Error::State(format!("invalid pause flag '{}' in state file", other)))
            }
        };

        Ok(Self { node_id, paused })
    }
}

/// Location of the pause state file
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored state; `None` when no file exists
    pub async fn read(&self) -> Result<Option<StoredState>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => StoredState::parse(&contents).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the stored state
    pub async fn write(&self, state: StoredState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("tmp");
        let line = format!("{}:{}", state.node_id, u8::from(state.paused));
        tokio::fs::write(&tmp, line).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!("wrote state file {}: {:?}", self.path.display(), state);
        Ok(())
    }
}
