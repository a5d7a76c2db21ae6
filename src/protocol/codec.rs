/// Wire protocol framing: encoding messages into buffers and decoding
/// complete frames out of a read buffer.

use super::{
    DeleteFlags, GetMore, Insert, InsertFlags, KillCursors, Message, MessageHeader, OpCode, Query,
    QueryFlags, Reply, ReplyFlags, Update, UpdateFlags, Delete, HEADER_LENGTH, MAX_MESSAGE_LENGTH,
};
use crate::error::ProtocolError;
use bson::Document;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Smallest valid BSON document: length prefix and terminator
const MIN_DOCUMENT_LENGTH: usize = 5;

/// A decoded message together with its header
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: MessageHeader,
    pub message: Message,
}

/// Encoder/decoder for wire protocol messages
pub struct WireCodec;

impl WireCodec {
    /// Append one framed message to `dst`
    pub fn encode(
        request_id: i32,
        response_to: i32,
        message: &Message,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        let start = dst.len();

        // Length is patched once the body is written
        dst.put_i32_le(0);
        dst.put_i32_le(request_id);
        dst.put_i32_le(response_to);
        dst.put_i32_le(message.op_code().code());

        if let Err(e) = Self::encode_body(message, dst) {
            dst.truncate(start);
            return Err(e);
        }

        let length = dst.len() - start;
        if length > MAX_MESSAGE_LENGTH as usize {
            dst.truncate(start);
            return Err(ProtocolError::InvalidLength(length.min(i32::MAX as usize) as i32));
        }
        dst[start..start + 4].copy_from_slice(&(length as i32).to_le_bytes());

        Ok(())
    }

    fn encode_body(message: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match message {
            Message::Query(query) => {
                dst.put_u32_le(query.flags.bits());
                put_cstring(dst, &query.full_collection_name)?;
                dst.put_i32_le(query.skip);
                dst.put_i32_le(query.limit);
                put_document(dst, &query.selector)?;
                if let Some(fields) = &query.fields {
                    put_document(dst, fields)?;
                }
            }
            Message::Insert(insert) => {
                dst.put_u32_le(insert.flags.bits());
                put_cstring(dst, &insert.full_collection_name)?;
                for document in &insert.documents {
                    put_document(dst, document)?;
                }
            }
            Message::Update(update) => {
                dst.put_i32_le(0);
                put_cstring(dst, &update.full_collection_name)?;
                dst.put_u32_le(update.flags.bits());
                put_document(dst, &update.selector)?;
                put_document(dst, &update.update)?;
            }
            Message::Delete(delete) => {
                dst.put_i32_le(0);
                put_cstring(dst, &delete.full_collection_name)?;
                dst.put_u32_le(delete.flags.bits());
                put_document(dst, &delete.selector)?;
            }
            Message::GetMore(get_more) => {
                dst.put_i32_le(0);
                put_cstring(dst, &get_more.full_collection_name)?;
                dst.put_i32_le(get_more.limit);
                dst.put_i64_le(get_more.cursor_id);
            }
            Message::KillCursors(kill) => {
                dst.put_i32_le(0);
                dst.put_i32_le(kill.cursor_ids.len() as i32);
                for cursor_id in &kill.cursor_ids {
                    dst.put_i64_le(*cursor_id);
                }
            }
            Message::Reply(reply) => {
                dst.put_u32_le(reply.flags.bits());
                dst.put_i64_le(reply.cursor_id);
                dst.put_i32_le(reply.starting_from);
                dst.put_i32_le(reply.documents.len() as i32);
                for document in &reply.documents {
                    put_document(dst, document)?;
                }
            }
        }
        Ok(())
    }

    /// Read a header from the first 16 bytes of `src`, validating the length
    /// and opcode. Returns `None` when fewer than 16 bytes are available.
    pub fn decode_header(src: &[u8]) -> Result<Option<MessageHeader>, ProtocolError> {
        if src.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LENGTH];
        let message_length = header.get_i32_le();
        let request_id = header.get_i32_le();
        let response_to = header.get_i32_le();
        let op_code = header.get_i32_le();

        if message_length < HEADER_LENGTH as i32 || message_length > MAX_MESSAGE_LENGTH {
            return Err(ProtocolError::InvalidLength(message_length));
        }

        Ok(Some(MessageHeader {
            message_length,
            request_id,
            response_to,
            op_code: OpCode::try_from(op_code)?,
        }))
    }

    /// Decode one complete frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; the buffer is left
    /// untouched in that case. On success the frame's bytes are consumed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let header = match Self::decode_header(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let length = header.message_length as usize;
        if buf.len() < length {
            buf.reserve(length - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(length).freeze();
        frame.advance(HEADER_LENGTH);
        let mut body = Body { bytes: frame };

        let message = match header.op_code {
            OpCode::Query => {
                let flags = QueryFlags::from_bits(body.u32()?);
                let full_collection_name = body.cstring()?;
                let skip = body.i32()?;
                let limit = body.i32()?;
                let selector = body.document()?;
                let fields = if body.is_empty() {
                    None
                } else {
                    Some(body.document()?)
                };
                Message::Query(Query {
                    flags,
                    full_collection_name,
                    skip,
                    limit,
                    selector,
                    fields,
                })
            }
            OpCode::Insert => {
                let flags = InsertFlags::from_bits(body.u32()?);
                let full_collection_name = body.cstring()?;
                let mut documents = Vec::new();
                while !body.is_empty() {
                    documents.push(body.document()?);
                }
                Message::Insert(Insert {
                    flags,
                    full_collection_name,
                    documents,
                })
            }
            OpCode::Update => {
                body.i32()?;
                let full_collection_name = body.cstring()?;
                let flags = UpdateFlags::from_bits(body.u32()?);
                let selector = body.document()?;
                let update = body.document()?;
                Message::Update(Update {
                    flags,
                    full_collection_name,
                    selector,
                    update,
                })
            }
            OpCode::Delete => {
                body.i32()?;
                let full_collection_name = body.cstring()?;
                let flags = DeleteFlags::from_bits(body.u32()?);
                let selector = body.document()?;
                Message::Delete(Delete {
                    flags,
                    full_collection_name,
                    selector,
                })
            }
            OpCode::GetMore => {
                body.i32()?;
                let full_collection_name = body.cstring()?;
                let limit = body.i32()?;
                let cursor_id = body.i64()?;
                Message::GetMore(GetMore {
                    full_collection_name,
                    limit,
                    cursor_id,
                })
            }
            OpCode::KillCursors => {
                body.i32()?;
                let count = body.i32()?;
                if count < 0 {
                    return Err(ProtocolError::Truncated(format!(
                        "negative cursor count {}",
                        count
                    )));
                }
                // The count is untrusted until the ids are read
                let mut cursor_ids = Vec::with_capacity((count as usize).min(body.bytes.len() / 8));
                for _ in 0..count {
                    cursor_ids.push(body.i64()?);
                }
                Message::KillCursors(KillCursors { cursor_ids })
            }
            OpCode::Reply => {
                let flags = ReplyFlags::from_bits(body.u32()?);
                let cursor_id = body.i64()?;
                let starting_from = body.i32()?;
                let number_returned = body.i32()?;
                if number_returned < 0 {
                    return Err(ProtocolError::Truncated(format!(
                        "negative document count {}",
                        number_returned
                    )));
                }
                let mut documents = Vec::with_capacity(
                    (number_returned as usize).min(body.bytes.len() / MIN_DOCUMENT_LENGTH),
                );
                for _ in 0..number_returned {
                    documents.push(body.document()?);
                }
                Message::Reply(Reply {
                    flags,
                    cursor_id,
                    starting_from,
                    documents,
                })
            }
        };

        if !body.is_empty() {
            return Err(ProtocolError::TrailingBytes(body.bytes.len()));
        }

        Ok(Some(Frame { header, message }))
    }
}

fn put_cstring(dst: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    if value.as_bytes().contains(&0) {
        return Err(ProtocolError::Document(format!(
            "namespace {:?} contains a NUL byte",
            value
        )));
    }
    dst.put_slice(value.as_bytes());
    dst.put_u8(0);
    Ok(())
}

fn put_document(dst: &mut BytesMut, document: &Document) -> Result<(), ProtocolError> {
    let mut raw = Vec::new();
    document.to_writer(&mut raw)?;
    dst.put_slice(&raw);
    Ok(())
}

/// Bounds-checked reader over a message body
struct Body {
    bytes: Bytes,
}

impl Body {
    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn require(&self, needed: usize, what: &str) -> Result<(), ProtocolError> {
        if self.bytes.len() < needed {
            return Err(ProtocolError::Truncated(format!(
                "{} needs {} bytes, {} left",
                what,
                needed,
                self.bytes.len()
            )));
        }
        Ok(())
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.require(4, "int32")?;
        Ok(self.bytes.get_i32_le())
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.require(4, "flags")?;
        Ok(self.bytes.get_u32_le())
    }

    fn i64(&mut self) -> Result<i64, ProtocolError> {
        self.require(8, "int64")?;
        Ok(self.bytes.get_i64_le())
    }

    fn cstring(&mut self) -> Result<String, ProtocolError> {
        let end = self
            .bytes
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| ProtocolError::Truncated("unterminated cstring".to_string()))?;
        let raw = self.bytes.split_to(end);
        self.bytes.advance(1);
        String::from_utf8(raw.to_vec())
            .map_err(|e| ProtocolError::Document(format!("invalid cstring: {}", e)))
    }

    fn document(&mut self) -> Result<Document, ProtocolError> {
        self.require(4, "document length")?;
        let length = i32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]]);
        if length < MIN_DOCUMENT_LENGTH as i32 {
            return Err(ProtocolError::Document(format!(
                "invalid document length {}",
                length
            )));
        }
        self.require(length as usize, "document")?;
        let raw = self.bytes.split_to(length as usize);
        Ok(Document::from_reader(&mut raw.as_ref())?)
    }
}
