//! Child node tracking on the primary

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::registry::{Node, NodeId};

#[derive(Debug, Clone, Default)]
pub struct ChildMonitorConfig {
    pub check_interval: Duration,
    /// Fire when at least this many children are detached
    pub disconnect_min_count: Option<usize>,
    /// Fire when fewer than this many children are attached
    pub connected_min_count: Option<usize>,
    pub include_witness: bool,
    /// How long the threshold must hold
    pub disconnect_timeout: Duration,
    pub disconnect_command: Option<String>,
}

impl ChildMonitorConfig {
    pub fn enabled(&self) -> bool {
        self.disconnect_min_count.is_some() || self.connected_min_count.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildChange {
    Disconnected(NodeId, String),
    Reconnected(NodeId, String),
    NewConnection(NodeId, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    /// Counts are within bounds
    Clear,
    /// Crossed, waiting for the timeout
    Pending,
    /// Crossed for long enough; act now (reported once per crossing)
    Fire,
    /// Already acted on this crossing
    Fired,
}

#[derive(Debug, Default)]
pub struct ChildTracker {
    attached: HashMap<NodeId, bool>,
    threshold_since: Option<Instant>,
    fired: bool,
    last_check: Option<Instant>,
}

impl ChildTracker {
    pub fn due(&self, now: Instant, interval: Duration) -> bool {
        match self.last_check {
            Some(last) => now.duration_since(last) >= interval,
            None => true,
        }
    }

    /// Compare attachment with the previous check. Children already attached
    /// at the first check are not reported as new connections.
    pub fn observe(&mut self, children: &[(Node, bool)], now: Instant) -> Vec<ChildChange> {
        let first_check = self.last_check.is_none();
        self.last_check = Some(now);

        let mut changes = Vec::new();
        for (child, attached) in children {
            let previous = self.attached.insert(child.id, *attached);
            let change = match (previous, *attached) {
                (Some(true), false) | (None, false) => {
                    Some(ChildChange::Disconnected(child.id, child.name.clone()))
                }
                (Some(false), true) => Some(ChildChange::Reconnected(child.id, child.name.clone())),
                (None, true) if !first_check => {
                    Some(ChildChange::NewConnection(child.id, child.name.clone()))
                }
                _ => None,
            };
            changes.extend(change);
        }

        // Forget children that left the registry
        self.attached
            .retain(|id, _| children.iter().any(|(c, _)| c.id == *id));
        changes
    }

    pub fn counts(&self) -> (usize, usize) {
        let connected = self.attached.values().filter(|a| **a).count();
        (connected, self.attached.len() - connected)
    }

    pub fn threshold(&mut self, config: &ChildMonitorConfig, now: Instant) -> Threshold {
        let (connected, disconnected) = self.counts();
        let crossed = config.disconnect_min_count.is_some_and(|min| disconnected >= min)
            || config.connected_min_count.is_some_and(|min| connected < min);

        if !crossed {
            self.threshold_since = None;
            self.fired = false;
            return Threshold::Clear;
        }

        let since = *self.threshold_since.get_or_insert(now);
        if self.fired {
            Threshold::Fired
        } else if now.duration_since(since) >= config.disconnect_timeout {
            self.fired = true;
            Threshold::Fire
        } else {
            Threshold::Pending
        }
    }
}
