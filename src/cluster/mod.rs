/// Replica set topology and routing
///
/// A `Cluster` owns every known `Node`, keeps track of which one is primary,
/// and answers "which node should serve this role". Topology is learned by
/// probing nodes with `ismaster`; see `refresh`.
pub mod balancer;
pub mod discovery;

pub use balancer::{LeastInUse, ReadBalancer, ReadBalancing, RoundRobin};
pub use discovery::IsMaster;

use crate::core::{Connector, Node, NodeRole, PoolOptions, Role};
use crate::error::{EnlaceError, EnlaceResult};
use crate::options::{Consistency, Seeds};
use crate::utils::format_duration;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// When topology discovery runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Rediscover before routing once this much time has passed since the
    /// last successful pass. `None` disables periodic refresh.
    pub interval: Option<Duration>,
    /// Run a discovery pass when no node can serve a role
    pub on_routing_failure: bool,
}

impl RefreshPolicy {
    /// Discovery only on routing failure or explicit `refresh` calls
    pub fn manual() -> Self {
        Self {
            interval: None,
            on_routing_failure: true,
        }
    }

    pub fn every(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            on_routing_failure: true,
        }
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::every(Duration::from_secs(300))
    }
}

/// What a safe write does when its node turns out to be no longer primary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalePrimaryPolicy {
    /// Return `NotPrimary` to the caller
    #[default]
    Surface,
    /// Rediscover and send the write once more to the new primary
    Retry,
}

impl std::str::FromStr for StalePrimaryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "surface" => Ok(StalePrimaryPolicy::Surface),
            "retry" => Ok(StalePrimaryPolicy::Retry),
            other => Err(format!("unknown stale primary policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClusterOptions {
    pub pool: PoolOptions,
    pub refresh: RefreshPolicy,
    pub stale_primary: StalePrimaryPolicy,
    pub read_balancing: ReadBalancing,
}

/// Outcome of the latest discovery pass, shared with callers that queued
/// behind it
#[derive(Debug, Default)]
struct LastPass {
    failure: Option<String>,
}

#[derive(Debug, Default)]
struct Topology {
    nodes: BTreeMap<String, Arc<Node>>,
    primary: Option<String>,
    set_name: Option<String>,
}

impl Topology {
    fn primary_node(&self) -> Option<&Arc<Node>> {
        self.primary.as_ref().and_then(|address| self.nodes.get(address))
    }

    fn clear_primary_if(&mut self, address: &str) {
        if self.primary.as_deref() == Some(address) {
            self.primary = None;
        }
    }
}

pub struct Cluster {
    seeds: Seeds,
    options: ClusterOptions,
    connector: Arc<dyn Connector>,
    topology: RwLock<Topology>,
    refreshed_at: Mutex<Option<Instant>>,
    /// Serializes discovery passes
    discovery: tokio::sync::Mutex<LastPass>,
    /// Completed discovery passes, successful or not
    passes: AtomicU64,
    balancer: Box<dyn ReadBalancer>,
}

impl Cluster {
    /// Build a cluster with one unclassified node per seed. Nothing is dialed
    /// until the first route or refresh.
    pub fn new<S: Into<Seeds>>(seeds: S, options: ClusterOptions, connector: Arc<dyn Connector>) -> Self {
        let seeds = seeds.into();
        let mut topology = Topology::default();
        for seed in seeds.iter() {
            topology.nodes.insert(
                seed.to_string(),
                Arc::new(Node::new(seed.to_string(), Arc::clone(&connector), options.pool.clone())),
            );
        }

        Self {
            seeds,
            balancer: options.read_balancing.build(),
            options,
            connector,
            topology: RwLock::new(topology),
            refreshed_at: Mutex::new(None),
            discovery: tokio::sync::Mutex::new(LastPass::default()),
            passes: AtomicU64::new(0),
        }
    }

    pub fn seeds(&self) -> &Seeds {
        &self.seeds
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Every known node in address order, including down ones
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.topology.read().nodes.values().cloned().collect()
    }

    pub fn node(&self, address: &str) -> Option<Arc<Node>> {
        self.topology.read().nodes.get(address).cloned()
    }

    /// Address currently believed primary
    pub fn primary(&self) -> Option<String> {
        self.topology.read().primary.clone()
    }

    pub fn set_name(&self) -> Option<String> {
        self.topology.read().set_name.clone()
    }

    /// When the last successful discovery pass finished
    pub fn refreshed_at(&self) -> Option<Instant> {
        *self.refreshed_at.lock()
    }

    /// Pick a node for `role`. Writes, and reads under strong consistency,
    /// need the primary. Eventual reads take a secondary and fall back to
    /// the primary.
    ///
    /// At most one discovery pass runs per call, and none when another
    /// caller's pass completed while this one waited for it.
    pub async fn route(&self, role: Role, consistency: Consistency) -> EnlaceResult<Arc<Node>> {
        let seen = self.passes.load(Ordering::Acquire);
        let scheduled = match self.refresh_if_due_since(seen).await {
            Ok(_) => None,
            Err(e) => {
                debug!("Scheduled refresh failed before routing: {}", e);
                Some(e)
            }
        };

        if let Some(node) = self.select(role, consistency) {
            return Ok(node);
        }

        if self.options.refresh.on_routing_failure {
            // The pass that just failed is the routing refresh
            if let Some(e) = scheduled {
                return Err(e);
            }
            debug!("No node for {:?}/{}; running discovery", role, consistency);
            self.refresh_since(seen).await?;
            if let Some(node) = self.select(role, consistency) {
                return Ok(node);
            }
        }

        Err(EnlaceError::connection_failure(match (role, consistency) {
            (Role::Read, Consistency::Eventual) => "no primary or secondary available".to_string(),
            _ => "no primary available".to_string(),
        }))
    }

    fn select(&self, role: Role, consistency: Consistency) -> Option<Arc<Node>> {
        let topology = self.topology.read();
        let primary = topology
            .primary_node()
            .filter(|node| node.role() == NodeRole::Primary)
            .cloned();

        match (role, consistency) {
            (Role::Read, Consistency::Eventual) => {
                let secondaries: Vec<Arc<Node>> = topology
                    .nodes
                    .values()
                    .filter(|node| node.role() == NodeRole::Secondary)
                    .cloned()
                    .collect();
                self.balancer
                    .select(&secondaries)
                    .map(|index| Arc::clone(&secondaries[index]))
                    .or(primary)
            }
            _ => primary,
        }
    }

    /// Run `refresh` if the policy's interval has elapsed. Returns whether a
    /// pass ran, here or in a concurrent caller this one waited on.
    pub async fn refresh_if_due(&self) -> EnlaceResult<bool> {
        let seen = self.passes.load(Ordering::Acquire);
        self.refresh_if_due_since(seen).await
    }

    async fn refresh_if_due_since(&self, seen: u64) -> EnlaceResult<bool> {
        let interval = match self.options.refresh.interval {
            Some(interval) => interval,
            None => return Ok(false),
        };

        let due = match *self.refreshed_at.lock() {
            Some(at) => at.elapsed() >= interval,
            None => true,
        };
        if !due {
            return Ok(false);
        }

        self.refresh_since(seen).await?;
        Ok(true)
    }

    /// Number of discovery passes that have finished
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }

    /// One discovery pass over the seeds and every known node.
    ///
    /// Probes run concurrently and their replies are applied in completion
    /// order, so the latest reply wins when two nodes both claim to be
    /// primary. Addresses learned from replies are probed in follow-up
    /// rounds. Nodes missing from the authoritative member list are marked
    /// down but kept.
    pub async fn refresh(&self) -> EnlaceResult<()> {
        let mut last = self.discovery.lock().await;
        self.run_pass(&mut last).await
    }

    /// Run a pass unless one finished after the caller observed `seen`
    /// passes. A caller that queued behind a pass takes its outcome.
    async fn refresh_since(&self, seen: u64) -> EnlaceResult<()> {
        let mut last = self.discovery.lock().await;
        if self.passes.load(Ordering::Acquire) != seen {
            debug!("Discovery ran while waiting for it; reusing the outcome");
            return match &last.failure {
                Some(message) => Err(EnlaceError::connection_failure(message.clone())),
                None => Ok(()),
            };
        }
        self.run_pass(&mut last).await
    }

    async fn run_pass(&self, last: &mut LastPass) -> EnlaceResult<()> {
        let result = self.discover().await;
        last.failure = match &result {
            Ok(()) => None,
            Err(EnlaceError::ConnectionFailure { message }) => Some(message.clone()),
            Err(e) => Some(e.to_string()),
        };
        self.passes.fetch_add(1, Ordering::Release);
        result
    }

    async fn discover(&self) -> EnlaceResult<()> {
        let started = Instant::now();

        let mut probed: HashSet<String> = HashSet::new();
        let mut pending = self.candidates();
        let mut successes = 0usize;
        // The primary's own reply, else the latest reply listing members
        let mut authority: Option<IsMaster> = None;
        let mut authority_is_primary = false;

        while !pending.is_empty() {
            let mut probes: FuturesUnordered<_> = std::mem::take(&mut pending)
                .into_iter()
                .filter(|node| probed.insert(node.address().to_string()))
                .map(|node| async move {
                    let result = discovery::probe(&node).await;
                    (node, result)
                })
                .collect();

            while let Some((node, result)) = probes.next().await {
                match result {
                    Ok(reply) => {
                        successes += 1;
                        pending.extend(self.apply(&node, &reply));

                        if reply.has_members() && (reply.is_master || !authority_is_primary) {
                            authority_is_primary = reply.is_master;
                            authority = Some(reply);
                        }
                    }
                    Err(e) => {
                        debug!("Discovery probe to {} failed: {}", node.address(), e);
                        self.mark_down(node.address(), e.to_string());
                    }
                }
            }
        }

        if successes == 0 {
            let candidates: Vec<String> = probed.into_iter().collect();
            return Err(EnlaceError::connection_failure(format!(
                "no reachable nodes among [{}]",
                candidates.join(", ")
            )));
        }

        if let Some(authority) = authority {
            self.mark_unlisted_down(&authority);
        }

        *self.refreshed_at.lock() = Some(Instant::now());
        info!(
            "Discovery finished in {}: primary {:?}, {} node(s) probed",
            format_duration(started.elapsed()),
            self.primary(),
            successes
        );
        Ok(())
    }

    /// Seeds first, then every other known node
    fn candidates(&self) -> Vec<Arc<Node>> {
        let topology = self.topology.read();
        let mut candidates: Vec<Arc<Node>> = self
            .seeds
            .iter()
            .filter_map(|seed| topology.nodes.get(seed).cloned())
            .collect();
        candidates.extend(
            topology
                .nodes
                .values()
                .filter(|node| !self.seeds.contains(node.address()))
                .cloned(),
        );
        candidates
    }

    /// Merge one probe reply into the topology. Returns nodes created for
    /// addresses seen for the first time.
    fn apply(&self, responder: &Arc<Node>, reply: &IsMaster) -> Vec<Arc<Node>> {
        let mut topology = self.topology.write();
        let mut learned = Vec::new();

        for address in reply.members() {
            if !topology.nodes.contains_key(address) {
                debug!("Discovered node {} via {}", address, responder.address());
                let node = Arc::new(Node::new(
                    address.to_string(),
                    Arc::clone(&self.connector),
                    self.options.pool.clone(),
                ));
                topology.nodes.insert(address.to_string(), Arc::clone(&node));
                learned.push(node);
            }
        }

        let role = reply.role();
        responder.set_role(role);

        if role == NodeRole::Primary {
            let address = responder.address().to_string();
            if let Some(previous) = topology.primary.replace(address.clone()) {
                if previous != address {
                    info!("Primary moved from {} to {}", previous, address);
                    if let Some(node) = topology.nodes.get(&previous) {
                        node.demote();
                    }
                }
            }
        } else {
            topology.clear_primary_if(responder.address());
        }

        if let Some(set_name) = &reply.set_name {
            if topology.set_name.as_ref() != Some(set_name) {
                topology.set_name = Some(set_name.clone());
            }
        }

        learned
    }

    fn mark_unlisted_down(&self, authority: &IsMaster) {
        let members: HashSet<&str> = authority.members().into_iter().collect();
        let mut topology = self.topology.write();

        let stale: Vec<String> = topology
            .nodes
            .iter()
            .filter(|(address, node)| {
                !members.contains(address.as_str()) && node.role() != NodeRole::Down
            })
            .map(|(address, _)| address.clone())
            .collect();

        for address in stale {
            if let Some(node) = topology.nodes.get(&address) {
                node.mark_down("not listed by the replica set");
            }
            topology.clear_primary_if(&address);
        }
    }

    /// Exclude a node from routing until discovery restores it
    pub fn mark_down<S: Into<String>>(&self, address: &str, reason: S) {
        let mut topology = self.topology.write();
        if let Some(node) = topology.nodes.get(address) {
            node.mark_down(reason);
        }
        topology.clear_primary_if(address);
    }

    /// A node answered a write as a non-primary; forget it as primary
    pub fn observe_not_primary(&self, address: &str) {
        let mut topology = self.topology.write();
        if let Some(node) = topology.nodes.get(address) {
            node.demote();
        }
        if topology.primary.as_deref() == Some(address) {
            warn!("Node {} reported it is no longer primary", address);
            topology.primary = None;
        }
    }

    /// Run `refresh` on the policy's interval in a background task. The task
    /// ends once the cluster is dropped. Returns `None` under a manual
    /// policy.
    pub fn spawn_refresh_task(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.options.refresh.interval?;
        let cluster = Arc::downgrade(self);
        info!("Refreshing topology every {}", format_duration(interval));

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cluster = match cluster.upgrade() {
                    Some(cluster) => cluster,
                    None => break,
                };
                if let Err(e) = cluster.refresh().await {
                    warn!("Background discovery failed: {}", e);
                }
            }
        }))
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topology = self.topology.read();
        f.debug_struct("Cluster")
            .field("seeds", &self.seeds)
            .field("nodes", &topology.nodes.keys().collect::<Vec<_>>())
            .field("primary", &topology.primary)
            .field("set_name", &topology.set_name)
            .finish()
    }
}
