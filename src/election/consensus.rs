//! Vote thresholds

use serde::{Deserialize, Serialize};

/// How many votes, the candidate's own included, win an election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusPolicy {
    /// No threshold: win unless a reachable peer backs a better candidate
    #[default]
    None,
    /// More than half of all active siblings plus self
    Majority,
    /// More than half of the nodes that answered, self included
    VisibleMajority,
    /// A fixed number of votes
    AtLeast(usize),
}

/// Votes gathered in one round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    /// Nodes entitled to vote, self included
    pub electorate: usize,
    /// Nodes that answered, self included
    pub reachable: usize,
    /// Votes for the candidate, self included
    pub granted: usize,
}

impl ConsensusPolicy {
    pub fn required_votes(&self, electorate: usize, reachable: usize) -> usize {
        match self {
            ConsensusPolicy::None => 1,
            ConsensusPolicy::Majority => electorate / 2 + 1,
            ConsensusPolicy::VisibleMajority => reachable / 2 + 1,
            ConsensusPolicy::AtLeast(n) => *n,
        }
    }

    pub fn is_satisfied(&self, tally: &Tally) -> bool {
        tally.granted >= self.required_votes(tally.electorate, tally.reachable)
    }
}

impl std::fmt::Display for ConsensusPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusPolicy::None => write!(f, "none"),
            ConsensusPolicy::Majority => write!(f, "majority"),
            ConsensusPolicy::VisibleMajority => write!(f, "visible majority"),
            ConsensusPolicy::AtLeast(n) => write!(f, "at least {}", n),
        }
    }
}
