/// MongoDB wire protocol messages
///
/// The legacy opcode-based protocol: every message is a 16 byte header
/// followed by an opcode specific body. Documents are carried as opaque
/// BSON values.
pub mod codec;

pub use codec::{Frame, WireCodec};

use crate::error::ProtocolError;
use bson::Document;
use std::fmt;
use std::ops::BitOr;

/// Size of the fixed message header
pub const HEADER_LENGTH: usize = 16;

/// Largest message the codec accepts in either direction
pub const MAX_MESSAGE_LENGTH: i32 = 48_000_000;

/// Operation codes of the legacy wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
}

impl OpCode {
    pub fn code(self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
        }
    }
}

impl TryFrom<i32> for OpCode {
    type Error = ProtocolError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            other => Err(ProtocolError::UnknownOpCode(other)),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Reply => "OP_REPLY",
            OpCode::Update => "OP_UPDATE",
            OpCode::Insert => "OP_INSERT",
            OpCode::Query => "OP_QUERY",
            OpCode::GetMore => "OP_GET_MORE",
            OpCode::Delete => "OP_DELETE",
            OpCode::KillCursors => "OP_KILL_CURSORS",
        };
        write!(f, "{}", name)
    }
}

/// Fixed-size header that starts every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

macro_rules! wire_flags {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$flag_meta:meta])* $flag:ident = $bit:expr; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $( $(#[$flag_meta])* pub const $flag: Self = Self(1 << $bit); )*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            /// Unknown bits are kept so they survive a decode/encode pass
            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

wire_flags! {
    /// Flags carried by OP_QUERY
    QueryFlags {
        TAILABLE_CURSOR = 1;
        /// Allow the query to run on a secondary
        SLAVE_OK = 2;
        OPLOG_REPLAY = 3;
        NO_CURSOR_TIMEOUT = 4;
        AWAIT_DATA = 5;
        EXHAUST = 6;
        PARTIAL = 7;
    }
}

wire_flags! {
    /// Flags carried by OP_REPLY
    ReplyFlags {
        CURSOR_NOT_FOUND = 0;
        QUERY_FAILURE = 1;
        SHARD_CONFIG_STALE = 2;
        AWAIT_CAPABLE = 3;
    }
}

wire_flags! {
    /// Flags carried by OP_UPDATE
    UpdateFlags {
        UPSERT = 0;
        MULTI = 1;
    }
}

wire_flags! {
    /// Flags carried by OP_INSERT
    InsertFlags {
        CONTINUE_ON_ERROR = 0;
    }
}

wire_flags! {
    /// Flags carried by OP_DELETE
    DeleteFlags {
        SINGLE_REMOVE = 0;
    }
}

/// OP_QUERY
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub flags: QueryFlags,
    pub full_collection_name: String,
    pub skip: i32,
    pub limit: i32,
    pub selector: Document,
    pub fields: Option<Document>,
}

impl Query {
    pub fn new<S: Into<String>>(full_collection_name: S, selector: Document) -> Self {
        Self {
            flags: QueryFlags::empty(),
            full_collection_name: full_collection_name.into(),
            skip: 0,
            limit: 0,
            selector,
            fields: None,
        }
    }

    /// A command addressed to `<database>.$cmd`, returning a single document
    pub fn command(database: &str, command: Document) -> Self {
        Self::new(format!("{}.$cmd", database), command).limit(-1)
    }

    pub fn flags(mut self, flags: QueryFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn skip(mut self, skip: i32) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = limit;
        self
    }

    pub fn fields(mut self, fields: Document) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Database part of the namespace
    pub fn database(&self) -> &str {
        crate::utils::split_namespace(&self.full_collection_name).0
    }
}

/// OP_INSERT
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub flags: InsertFlags,
    pub full_collection_name: String,
    pub documents: Vec<Document>,
}

impl Insert {
    pub fn new<S: Into<String>>(full_collection_name: S, documents: Vec<Document>) -> Self {
        Self {
            flags: InsertFlags::empty(),
            full_collection_name: full_collection_name.into(),
            documents,
        }
    }
}

/// OP_UPDATE
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub flags: UpdateFlags,
    pub full_collection_name: String,
    pub selector: Document,
    pub update: Document,
}

impl Update {
    pub fn new<S: Into<String>>(full_collection_name: S, selector: Document, update: Document) -> Self {
        Self {
            flags: UpdateFlags::empty(),
            full_collection_name: full_collection_name.into(),
            selector,
            update,
        }
    }
}

/// OP_DELETE
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub flags: DeleteFlags,
    pub full_collection_name: String,
    pub selector: Document,
}

impl Delete {
    pub fn new<S: Into<String>>(full_collection_name: S, selector: Document) -> Self {
        Self {
            flags: DeleteFlags::empty(),
            full_collection_name: full_collection_name.into(),
            selector,
        }
    }
}

/// OP_GET_MORE
#[derive(Debug, Clone, PartialEq)]
pub struct GetMore {
    pub full_collection_name: String,
    pub limit: i32,
    pub cursor_id: i64,
}

/// OP_KILL_CURSORS
#[derive(Debug, Clone, PartialEq)]
pub struct KillCursors {
    pub cursor_ids: Vec<i64>,
}

/// OP_REPLY
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reply {
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    pub fn is_query_failure(&self) -> bool {
        self.flags.contains(ReplyFlags::QUERY_FAILURE)
    }

    pub fn into_first(self) -> Option<Document> {
        self.documents.into_iter().next()
    }
}

/// Every message kind the driver understands. Decoding picks the variant
/// from the header's opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Query(Query),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    GetMore(GetMore),
    KillCursors(KillCursors),
    Reply(Reply),
}

impl Message {
    pub fn op_code(&self) -> OpCode {
        match self {
            Message::Query(_) => OpCode::Query,
            Message::Insert(_) => OpCode::Insert,
            Message::Update(_) => OpCode::Update,
            Message::Delete(_) => OpCode::Delete,
            Message::GetMore(_) => OpCode::GetMore,
            Message::KillCursors(_) => OpCode::KillCursors,
            Message::Reply(_) => OpCode::Reply,
        }
    }

    /// Namespace the message targets, if any
    pub fn full_collection_name(&self) -> Option<&str> {
        match self {
            Message::Query(m) => Some(&m.full_collection_name),
            Message::Insert(m) => Some(&m.full_collection_name),
            Message::Update(m) => Some(&m.full_collection_name),
            Message::Delete(m) => Some(&m.full_collection_name),
            Message::GetMore(m) => Some(&m.full_collection_name),
            Message::KillCursors(_) | Message::Reply(_) => None,
        }
    }
}

macro_rules! impl_from_message {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Message {
                fn from(message: $variant) -> Self {
                    Message::$variant(message)
                }
            }
        )*
    };
}

impl_from_message!(Query, Insert, Update, Delete, GetMore, KillCursors, Reply);
