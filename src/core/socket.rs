/// One physical connection to one node
///
/// A socket writes framed requests with process-unique request ids and reads
/// framed replies, matching them to requests by `response_to`. A socket is
/// poisoned for the duration of every exchange and only cleared once the
/// exchange completes, so an error or a cancelled future leaves it poisoned.
/// A poisoned socket is never handed out again.
use super::connection::Transport;
use crate::error::{EnlaceError, EnlaceResult, ProtocolError};
use crate::protocol::{Frame, Message, OpCode, Query, Reply, WireCodec};
use bson::Document;
use bytes::BytesMut;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::error::Elapsed;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Next request id, unique across every socket in the process
pub fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

pub struct Socket {
    address: String,
    stream: Box<dyn Transport>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    operation_timeout: Duration,
    /// Requests written whose reply has not been consumed yet
    outstanding: HashSet<i32>,
    /// Replies that arrived for a request other than the one being awaited
    stashed: HashMap<i32, Reply>,
    poisoned: bool,
}

impl Socket {
    pub fn new(address: String, stream: Box<dyn Transport>, operation_timeout: Duration) -> Self {
        Self {
            address,
            stream,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::with_capacity(8192),
            operation_timeout,
            outstanding: HashSet::new(),
            stashed: HashMap::new(),
            poisoned: false,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether an error left this connection unusable
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Write a message that gets no reply (insert, update, delete,
    /// kill-cursors). Returns the request id used.
    pub async fn send(&mut self, message: impl Into<Message>) -> EnlaceResult<i32> {
        let message = message.into();
        self.ensure_usable()?;

        let request_id = next_request_id();
        self.poisoned = true;
        let result = timeout(
            self.operation_timeout,
            self.write_message(request_id, &message),
        )
        .await;
        self.settle(message.op_code(), result)?;
        Ok(request_id)
    }

    /// Write a message and wait for the reply that answers it
    pub async fn execute(&mut self, message: impl Into<Message>) -> EnlaceResult<Reply> {
        let message = message.into();
        self.ensure_usable()?;

        let request_id = next_request_id();
        self.poisoned = true;
        let result = timeout(self.operation_timeout, self.exchange(request_id, &message)).await;
        self.settle(message.op_code(), result)
    }

    /// Run a query and return the first document of its reply
    pub async fn simple_query(&mut self, query: Query) -> EnlaceResult<Document> {
        self.execute(query)
            .await?
            .into_first()
            .ok_or_else(|| EnlaceError::Protocol(ProtocolError::EmptyReply))
    }

    fn ensure_usable(&self) -> EnlaceResult<()> {
        if self.poisoned {
            return Err(EnlaceError::connection_failure(format!(
                "socket to {} was discarded after an earlier error",
                self.address
            )));
        }
        Ok(())
    }

    /// Map a timeout to a transport failure. Only a completed exchange clears
    /// the poison set before it started.
    fn settle<T>(
        &mut self,
        operation: OpCode,
        result: Result<EnlaceResult<T>, Elapsed>,
    ) -> EnlaceResult<T> {
        let result = match result {
            Ok(result) => result,
            Err(_) => Err(EnlaceError::timeout(format!(
                "{} on {}",
                operation, self.address
            ))),
        };

        match &result {
            Ok(_) => self.poisoned = false,
            Err(e) => warn!(
                "Discarding socket to {} after {} [{}]: {}",
                self.address,
                operation,
                e.severity(),
                e
            ),
        }
        result
    }

    async fn exchange(&mut self, request_id: i32, message: &Message) -> EnlaceResult<Reply> {
        self.write_message(request_id, message).await?;
        self.outstanding.insert(request_id);
        self.read_reply_for(request_id).await
    }

    async fn write_message(&mut self, request_id: i32, message: &Message) -> EnlaceResult<()> {
        self.write_buf.clear();
        WireCodec::encode(request_id, 0, message, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        trace!(
            "Wrote {} ({} bytes, request {}) to {}",
            message.op_code(),
            self.write_buf.len(),
            request_id,
            self.address
        );
        Ok(())
    }

    async fn read_reply_for(&mut self, request_id: i32) -> EnlaceResult<Reply> {
        loop {
            if let Some(reply) = self.stashed.remove(&request_id) {
                self.outstanding.remove(&request_id);
                return Ok(reply);
            }

            let frame = self.read_frame().await?;
            let response_to = frame.header.response_to;
            match frame.message {
                Message::Reply(reply) if response_to == request_id => {
                    self.outstanding.remove(&request_id);
                    return Ok(reply);
                }
                Message::Reply(reply) if self.outstanding.contains(&response_to) => {
                    debug!(
                        "Stashing reply to request {} while waiting for {} on {}",
                        response_to, request_id, self.address
                    );
                    self.stashed.insert(response_to, reply);
                }
                Message::Reply(_) => {
                    return Err(ProtocolError::UnexpectedResponse(response_to).into());
                }
                other => {
                    return Err(ProtocolError::UnexpectedOpCode {
                        expected: OpCode::Reply.code(),
                        found: other.op_code().code(),
                    }
                    .into());
                }
            }
        }
    }

    async fn read_frame(&mut self) -> EnlaceResult<Frame> {
        loop {
            if let Some(frame) = WireCodec::decode(&mut self.read_buf)? {
                return Ok(frame);
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(EnlaceError::Network(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection to {} closed mid-exchange", self.address),
                )));
            }
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("address", &self.address)
            .field("outstanding", &self.outstanding.len())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
