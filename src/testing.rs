//! In-memory replica set used by unit tests.
//!
//! Each mock server answers wire protocol requests over a `tokio::io::duplex`
//! stream: `ismaster` with its configured topology document, `getlasterror`
//! with a configured document, other commands with `{ok: 1}`.

use crate::core::{Connector, Transport};
use crate::error::{EnlaceError, EnlaceResult};
use crate::protocol::{Message, Query, Reply, WireCodec};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

#[derive(Debug, Clone)]
struct MockServer {
    ismaster: Document,
    reply_delay: Duration,
    last_error: Document,
    query_results: Vec<Document>,
    command_replies: HashMap<String, Document>,
    corrupt_next: bool,
}

#[derive(Default)]
struct SetState {
    servers: HashMap<String, MockServer>,
    connections: HashMap<String, usize>,
    attempts: HashMap<String, usize>,
    received: Vec<(String, Message)>,
}

#[derive(Clone, Default)]
pub(crate) struct MockReplicaSet {
    state: Arc<Mutex<SetState>>,
}

impl MockReplicaSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_server(&self, address: &str, ismaster: Document) {
        self.state.lock().servers.insert(
            address.to_string(),
            MockServer {
                ismaster,
                reply_delay: Duration::ZERO,
                last_error: doc! { "ok": 1.0, "err": Bson::Null, "n": 0 },
                query_results: Vec::new(),
                command_replies: HashMap::new(),
                corrupt_next: false,
            },
        );
    }

    /// Make the address refuse new connections and drop open ones on their
    /// next request
    pub(crate) fn remove_server(&self, address: &str) {
        self.state.lock().servers.remove(address);
    }

    pub(crate) fn set_ismaster(&self, address: &str, ismaster: Document) {
        self.with_server(address, |server| server.ismaster = ismaster);
    }

    pub(crate) fn set_reply_delay(&self, address: &str, delay: Duration) {
        self.with_server(address, |server| server.reply_delay = delay);
    }

    pub(crate) fn set_last_error(&self, address: &str, last_error: Document) {
        self.with_server(address, |server| server.last_error = last_error);
    }

    pub(crate) fn set_query_results(&self, address: &str, documents: Vec<Document>) {
        self.with_server(address, |server| server.query_results = documents);
    }

    /// Answer the named command with `reply` instead of `{ok: 1}`
    pub(crate) fn set_command_reply(&self, address: &str, command: &str, reply: Document) {
        self.with_server(address, |server| {
            server.command_replies.insert(command.to_lowercase(), reply);
        });
    }

    /// Answer the next query with an unknown opcode
    pub(crate) fn corrupt_next_reply(&self, address: &str) {
        self.with_server(address, |server| server.corrupt_next = true);
    }

    pub(crate) fn connection_count(&self, address: &str) -> usize {
        self.state.lock().connections.get(address).copied().unwrap_or(0)
    }

    /// Dials to `address`, refused ones included
    pub(crate) fn connect_attempts(&self, address: &str) -> usize {
        self.state.lock().attempts.get(address).copied().unwrap_or(0)
    }

    pub(crate) fn received(&self, address: &str) -> Vec<Message> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(to, _)| to == address)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Queries received by `address`, excluding topology probes
    pub(crate) fn queries(&self, address: &str) -> Vec<Query> {
        self.received(address)
            .into_iter()
            .filter_map(|message| match message {
                Message::Query(query) if !query.selector.contains_key("ismaster") => Some(query),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector { set: self.clone() })
    }

    fn with_server(&self, address: &str, f: impl FnOnce(&mut MockServer)) {
        let mut state = self.state.lock();
        let server = state
            .servers
            .get_mut(address)
            .unwrap_or_else(|| panic!("no mock server at {}", address));
        f(server);
    }

    async fn serve(self, address: String, mut stream: DuplexStream) {
        let mut buf = BytesMut::new();
        loop {
            let frame = loop {
                match WireCodec::decode(&mut buf) {
                    Ok(Some(frame)) => break frame,
                    Ok(None) => {}
                    Err(_) => return,
                }
                match stream.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            };

            let server = {
                let mut state = self.state.lock();
                state.received.push((address.clone(), frame.message.clone()));
                match state.servers.get_mut(&address) {
                    Some(server) => {
                        let snapshot = server.clone();
                        server.corrupt_next = false;
                        snapshot
                    }
                    None => return,
                }
            };

            let documents = match &frame.message {
                Message::Query(query) => Self::answer(&server, query),
                Message::GetMore(_) => Vec::new(),
                _ => continue,
            };

            if !server.reply_delay.is_zero() {
                tokio::time::sleep(server.reply_delay).await;
            }

            let mut out = BytesMut::new();
            if server.corrupt_next {
                out.put_i32_le(16);
                out.put_i32_le(0);
                out.put_i32_le(frame.header.request_id);
                out.put_i32_le(9999);
            } else {
                let reply = Reply {
                    documents,
                    ..Default::default()
                };
                if WireCodec::encode(0, frame.header.request_id, &reply.into(), &mut out).is_err() {
                    return;
                }
            }
            if stream.write_all(&out).await.is_err() {
                return;
            }
        }
    }

    fn answer(server: &MockServer, query: &Query) -> Vec<Document> {
        if !query.full_collection_name.ends_with(".$cmd") {
            return server.query_results.clone();
        }
        let command = query
            .selector
            .keys()
            .next()
            .map(|key| key.to_lowercase())
            .unwrap_or_default();
        if let Some(reply) = server.command_replies.get(&command) {
            return vec![reply.clone()];
        }
        match command.as_str() {
            "ismaster" => vec![server.ismaster.clone()],
            "getlasterror" => vec![server.last_error.clone()],
            _ => vec![doc! { "ok": 1.0 }],
        }
    }
}

struct MockConnector {
    set: MockReplicaSet,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &str) -> EnlaceResult<Box<dyn Transport>> {
        {
            let mut state = self.set.state.lock();
            *state.attempts.entry(address.to_string()).or_insert(0) += 1;
            if !state.servers.contains_key(address) {
                return Err(EnlaceError::Network(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("nothing listening on {}", address),
                )));
            }
            *state.connections.entry(address.to_string()).or_insert(0) += 1;
        }

        let (client, server) = duplex(1 << 20);
        tokio::spawn(self.set.clone().serve(address.to_string(), server));
        Ok(Box::new(client))
    }
}

pub(crate) fn ismaster_primary(me: &str, hosts: &[&str]) -> Document {
    doc! {
        "ismaster": true,
        "secondary": false,
        "setName": "rs0",
        "hosts": hosts.iter().map(|h| Bson::String(h.to_string())).collect::<Vec<_>>(),
        "primary": me,
        "me": me,
        "ok": 1.0,
    }
}

pub(crate) fn ismaster_secondary(me: &str, primary: Option<&str>, hosts: &[&str]) -> Document {
    let mut reply = doc! {
        "ismaster": false,
        "secondary": true,
        "setName": "rs0",
        "hosts": hosts.iter().map(|h| Bson::String(h.to_string())).collect::<Vec<_>>(),
        "me": me,
        "ok": 1.0,
    };
    if let Some(primary) = primary {
        reply.insert("primary", primary);
    }
    reply
}

pub(crate) fn ismaster_standalone() -> Document {
    doc! { "ismaster": true, "ok": 1.0 }
}
