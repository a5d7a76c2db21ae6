/// Secondary selection for eventually consistent reads
use crate::core::Node;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Picks one node out of the readable secondaries
pub trait ReadBalancer: Send + Sync {
    /// Index into `candidates`, or `None` when there are none
    fn select(&self, candidates: &[Arc<Node>]) -> Option<usize>;
}

/// Cycle through the secondaries in address order
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReadBalancer for RoundRobin {
    fn select(&self, candidates: &[Arc<Node>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(index)
    }
}

/// Prefer the secondary with the fewest sockets checked out
#[derive(Debug, Default)]
pub struct LeastInUse;

impl ReadBalancer for LeastInUse {
    fn select(&self, candidates: &[Arc<Node>]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, node)| node.in_use())
            .map(|(index, _)| index)
    }
}

/// Configurable choice of read balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadBalancing {
    #[default]
    RoundRobin,
    LeastInUse,
}

impl ReadBalancing {
    pub fn build(self) -> Box<dyn ReadBalancer> {
        match self {
            ReadBalancing::RoundRobin => Box::new(RoundRobin::new()),
            ReadBalancing::LeastInUse => Box::new(LeastInUse),
        }
    }
}

impl FromStr for ReadBalancing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(ReadBalancing::RoundRobin),
            "least-in-use" => Ok(ReadBalancing::LeastInUse),
            other => Err(format!("unknown read balancing '{}'", other)),
        }
    }
}

impl fmt::Display for ReadBalancing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadBalancing::RoundRobin => write!(f, "round-robin"),
            ReadBalancing::LeastInUse => write!(f, "least-in-use"),
        }
    }
}
