/// Topology probes
///
/// A probe sends `{ismaster: 1}` to `admin.$cmd` with the slave-ok flag and
/// reads back how the node sees itself and the replica set.
use crate::core::{Node, NodeRole};
use crate::error::EnlaceResult;
use crate::protocol::{Query, QueryFlags};
use bson::{doc, Bson, Document};
use std::sync::Arc;
use tracing::trace;

/// Parsed `ismaster` reply
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IsMaster {
    pub is_master: bool,
    pub secondary: bool,
    pub arbiter_only: bool,
    pub hosts: Vec<String>,
    pub passives: Vec<String>,
    pub arbiters: Vec<String>,
    /// Primary as seen by the responder
    pub primary: Option<String>,
    pub set_name: Option<String>,
    pub me: Option<String>,
}

impl IsMaster {
    pub fn from_document(reply: &Document) -> Self {
        Self {
            is_master: flag(reply, "ismaster"),
            secondary: flag(reply, "secondary"),
            arbiter_only: flag(reply, "arbiterOnly"),
            hosts: addresses(reply, "hosts"),
            passives: addresses(reply, "passives"),
            arbiters: addresses(reply, "arbiters"),
            primary: reply.get_str("primary").ok().map(str::to_string),
            set_name: reply.get_str("setName").ok().map(str::to_string),
            me: reply.get_str("me").ok().map(str::to_string),
        }
    }

    /// Role the responder reports for itself
    pub fn role(&self) -> NodeRole {
        if self.is_master {
            NodeRole::Primary
        } else if self.secondary {
            NodeRole::Secondary
        } else if self.arbiter_only {
            NodeRole::Arbiter
        } else {
            NodeRole::Unknown
        }
    }

    /// Every replica set member the reply names, in reply order
    pub fn members(&self) -> Vec<&str> {
        let mut members: Vec<&str> = Vec::new();
        let named = self
            .hosts
            .iter()
            .chain(&self.passives)
            .chain(&self.arbiters)
            .chain(self.primary.iter());
        for address in named {
            if !members.contains(&address.as_str()) {
                members.push(address);
            }
        }
        members
    }

    /// Whether the reply lists the set's members. Standalone servers don't.
    pub fn has_members(&self) -> bool {
        !self.hosts.is_empty() || !self.passives.is_empty() || !self.arbiters.is_empty()
    }
}

/// Accept booleans and the numeric flags older servers send
fn flag(reply: &Document, key: &str) -> bool {
    match reply.get(key) {
        Some(Bson::Boolean(value)) => *value,
        Some(Bson::Int32(value)) => *value != 0,
        Some(Bson::Int64(value)) => *value != 0,
        Some(Bson::Double(value)) => *value != 0.0,
        _ => false,
    }
}

fn addresses(reply: &Document, key: &str) -> Vec<String> {
    reply
        .get_array(key)
        .map(|values| {
            values
                .iter()
                .filter_map(Bson::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Ask one node for its view of the topology
pub async fn probe(node: &Arc<Node>) -> EnlaceResult<IsMaster> {
    let mut socket = node.acquire().await?;
    let query = Query::command("admin", doc! { "ismaster": 1 }).flags(QueryFlags::SLAVE_OK);
    let reply = socket.simple_query(query).await?;
    trace!("ismaster from {}: {}", node.address(), reply);
    Ok(IsMaster::from_document(&reply))
}
