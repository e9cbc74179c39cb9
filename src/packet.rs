//! Wire types and packet codec for the OpalKV binary protocol.
//!
//! The protocol frames every request and response with a fixed 24-byte
//! big-endian header followed by framing extras, extras, key and value.
//! Requests carrying framing extras use a distinct magic and re-split the
//! key-length field into a framing-extras length and a one-byte key
//! length.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::Result;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Magic byte identifying the frame layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Magic {
    /// Request without framing extras.
    #[default]
    Req,
    /// Request with framing extras.
    ReqExt,
    /// Response without framing extras.
    Res,
    /// Response with framing extras.
    ResExt,
}

impl Magic {
    /// The wire value of this magic.
    pub fn to_u8(self) -> u8 {
        match self {
            Magic::Req => 0x80,
            Magic::ReqExt => 0x08,
            Magic::Res => 0x81,
            Magic::ResExt => 0x18,
        }
    }

    /// Parse a magic byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x80 => Ok(Magic::Req),
            0x08 => Ok(Magic::ReqExt),
            0x81 => Ok(Magic::Res),
            0x18 => Ok(Magic::ResExt),
            other => Err(Error::BadMagic(other)),
        }
    }

    /// Whether this magic identifies a request frame.
    pub fn is_request(self) -> bool {
        matches!(self, Magic::Req | Magic::ReqExt)
    }

    /// Whether this magic carries a framing-extras section.
    pub fn has_ext_frames(self) -> bool {
        matches!(self, Magic::ReqExt | Magic::ResExt)
    }
}

/// Operation codes used by the client core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpCode {
    /// Fetch a document.
    #[default]
    Get,
    /// Store a document unconditionally (or by CAS).
    Set,
    /// Store a document only if it does not exist.
    Add,
    /// Store a document only if it exists.
    Replace,
    /// Remove a document.
    Delete,
    /// Increment a counter document.
    Increment,
    /// Decrement a counter document.
    Decrement,
    /// Append bytes to a document.
    Append,
    /// Prepend bytes to a document.
    Prepend,
    /// Update a document's expiry.
    Touch,
    /// Fetch a document and update its expiry.
    GetAndTouch,
    /// Negotiate connection features.
    Hello,
    /// SASL authentication.
    SaslAuth,
    /// Fetch a document from a replica.
    GetReplica,
    /// Select the bucket for this connection.
    SelectBucket,
    /// Fetch a document and lock it.
    GetLocked,
    /// Release a document lock.
    UnlockKey,
    /// Fetch document metadata.
    GetMeta,
    /// Store a document with caller-supplied metadata.
    SetMeta,
    /// Remove a document with caller-supplied metadata.
    DelMeta,
    /// Fetch an arbitrary document.
    GetRandom,
    /// Multi-path sub-document lookup.
    SubDocMultiLookup,
    /// Multi-path sub-document mutation.
    SubDocMultiMutation,
    /// An opcode this client does not recognize.
    Unknown(u8),
}

impl OpCode {
    /// The wire value of this opcode.
    pub fn to_u8(self) -> u8 {
        match self {
            OpCode::Get => 0x00,
            OpCode::Set => 0x01,
            OpCode::Add => 0x02,
            OpCode::Replace => 0x03,
            OpCode::Delete => 0x04,
            OpCode::Increment => 0x05,
            OpCode::Decrement => 0x06,
            OpCode::Append => 0x0e,
            OpCode::Prepend => 0x0f,
            OpCode::Touch => 0x1c,
            OpCode::GetAndTouch => 0x1d,
            OpCode::Hello => 0x1f,
            OpCode::SaslAuth => 0x21,
            OpCode::GetReplica => 0x83,
            OpCode::SelectBucket => 0x89,
            OpCode::GetLocked => 0x94,
            OpCode::UnlockKey => 0x95,
            OpCode::GetMeta => 0xa0,
            OpCode::SetMeta => 0xa2,
            OpCode::DelMeta => 0xa8,
            OpCode::GetRandom => 0xb6,
            OpCode::SubDocMultiLookup => 0xd0,
            OpCode::SubDocMultiMutation => 0xd1,
            OpCode::Unknown(value) => value,
        }
    }

    /// Parse an opcode byte.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => OpCode::Get,
            0x01 => OpCode::Set,
            0x02 => OpCode::Add,
            0x03 => OpCode::Replace,
            0x04 => OpCode::Delete,
            0x05 => OpCode::Increment,
            0x06 => OpCode::Decrement,
            0x0e => OpCode::Append,
            0x0f => OpCode::Prepend,
            0x1c => OpCode::Touch,
            0x1d => OpCode::GetAndTouch,
            0x1f => OpCode::Hello,
            0x21 => OpCode::SaslAuth,
            0x83 => OpCode::GetReplica,
            0x89 => OpCode::SelectBucket,
            0x94 => OpCode::GetLocked,
            0x95 => OpCode::UnlockKey,
            0xa0 => OpCode::GetMeta,
            0xa2 => OpCode::SetMeta,
            0xa8 => OpCode::DelMeta,
            0xb6 => OpCode::GetRandom,
            0xd0 => OpCode::SubDocMultiLookup,
            0xd1 => OpCode::SubDocMultiMutation,
            other => OpCode::Unknown(other),
        }
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// The operation succeeded.
    #[default]
    Success,
    /// The key was not found.
    KeyNotFound,
    /// The key already exists (or the CAS did not match).
    KeyExists,
    /// The value was too large to store.
    TooBig,
    /// The request arguments were invalid.
    InvalidArgs,
    /// The document was not stored.
    NotStored,
    /// A counter delta badly formed.
    BadDelta,
    /// The vbucket is not owned by this node.
    NotMyVbucket,
    /// No bucket has been selected on this connection.
    NoBucket,
    /// The document is locked.
    Locked,
    /// Authentication failed.
    AuthError,
    /// The caller lacks permission for the operation.
    AccessError,
    /// The server is temporarily unable to service the request.
    TmpFail,
    /// The collection is unknown to the server.
    CollectionUnknown,
    /// Sub-document: the path was not found in the document.
    SubDocPathNotFound,
    /// Sub-document: the path does not match the document structure.
    SubDocPathMismatch,
    /// Sub-document: the path was syntactically invalid.
    SubDocPathInvalid,
    /// Sub-document: the path was too long or too deep.
    SubDocPathTooBig,
    /// Sub-document: the document is too deep to parse.
    SubDocDocTooDeep,
    /// Sub-document: the value cannot be inserted at the path.
    SubDocCantInsert,
    /// Sub-document: the document is not JSON.
    SubDocNotJson,
    /// Sub-document: a numeric operand was out of range.
    SubDocBadRange,
    /// Sub-document: a counter delta was out of range.
    SubDocBadDelta,
    /// Sub-document: the path already exists.
    SubDocPathExists,
    /// Sub-document: the resulting value would be too deep.
    SubDocValueTooDeep,
    /// Sub-document: invalid combination of commands.
    SubDocBadCombo,
    /// Sub-document: one or more paths in a multi-op failed.
    SubDocBadMulti,
    /// Sub-document: success, performed on a deleted document.
    SubDocSuccessDeleted,
    /// Sub-document: multi-op path failure on a deleted document.
    SubDocMultiPathFailureDeleted,
    /// A status this client does not recognize.
    Unknown(u16),
}

impl Status {
    /// The wire value of this status.
    pub fn to_u16(self) -> u16 {
        match self {
            Status::Success => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::TooBig => 0x0003,
            Status::InvalidArgs => 0x0004,
            Status::NotStored => 0x0005,
            Status::BadDelta => 0x0006,
            Status::NotMyVbucket => 0x0007,
            Status::NoBucket => 0x0008,
            Status::Locked => 0x0009,
            Status::AuthError => 0x0020,
            Status::AccessError => 0x0024,
            Status::TmpFail => 0x0086,
            Status::CollectionUnknown => 0x0088,
            Status::SubDocPathNotFound => 0x00c0,
            Status::SubDocPathMismatch => 0x00c1,
            Status::SubDocPathInvalid => 0x00c2,
            Status::SubDocPathTooBig => 0x00c3,
            Status::SubDocDocTooDeep => 0x00c4,
            Status::SubDocCantInsert => 0x00c5,
            Status::SubDocNotJson => 0x00c6,
            Status::SubDocBadRange => 0x00c7,
            Status::SubDocBadDelta => 0x00c8,
            Status::SubDocPathExists => 0x00c9,
            Status::SubDocValueTooDeep => 0x00ca,
            Status::SubDocBadCombo => 0x00cb,
            Status::SubDocBadMulti => 0x00cc,
            Status::SubDocSuccessDeleted => 0x00cd,
            Status::SubDocMultiPathFailureDeleted => 0x00d3,
            Status::Unknown(value) => value,
        }
    }

    /// Parse a status from its wire value.
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0000 => Status::Success,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::TooBig,
            0x0004 => Status::InvalidArgs,
            0x0005 => Status::NotStored,
            0x0006 => Status::BadDelta,
            0x0007 => Status::NotMyVbucket,
            0x0008 => Status::NoBucket,
            0x0009 => Status::Locked,
            0x0020 => Status::AuthError,
            0x0024 => Status::AccessError,
            0x0086 => Status::TmpFail,
            0x0088 => Status::CollectionUnknown,
            0x00c0 => Status::SubDocPathNotFound,
            0x00c1 => Status::SubDocPathMismatch,
            0x00c2 => Status::SubDocPathInvalid,
            0x00c3 => Status::SubDocPathTooBig,
            0x00c4 => Status::SubDocDocTooDeep,
            0x00c5 => Status::SubDocCantInsert,
            0x00c6 => Status::SubDocNotJson,
            0x00c7 => Status::SubDocBadRange,
            0x00c8 => Status::SubDocBadDelta,
            0x00c9 => Status::SubDocPathExists,
            0x00ca => Status::SubDocValueTooDeep,
            0x00cb => Status::SubDocBadCombo,
            0x00cc => Status::SubDocBadMulti,
            0x00cd => Status::SubDocSuccessDeleted,
            0x00d3 => Status::SubDocMultiPathFailureDeleted,
            other => Status::Unknown(other),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::KeyNotFound => write!(f, "key not found"),
            Status::KeyExists => write!(f, "key exists"),
            Status::TooBig => write!(f, "value too big"),
            Status::InvalidArgs => write!(f, "invalid arguments"),
            Status::NotStored => write!(f, "not stored"),
            Status::BadDelta => write!(f, "bad delta"),
            Status::NotMyVbucket => write!(f, "not my vbucket"),
            Status::NoBucket => write!(f, "no bucket selected"),
            Status::Locked => write!(f, "locked"),
            Status::AuthError => write!(f, "authentication error"),
            Status::AccessError => write!(f, "access error"),
            Status::TmpFail => write!(f, "temporary failure"),
            Status::CollectionUnknown => write!(f, "unknown collection"),
            Status::SubDocPathNotFound => write!(f, "subdoc path not found"),
            Status::SubDocPathMismatch => write!(f, "subdoc path mismatch"),
            Status::SubDocPathInvalid => write!(f, "subdoc path invalid"),
            Status::SubDocPathTooBig => write!(f, "subdoc path too big"),
            Status::SubDocDocTooDeep => write!(f, "subdoc document too deep"),
            Status::SubDocCantInsert => write!(f, "subdoc cannot insert"),
            Status::SubDocNotJson => write!(f, "subdoc document not json"),
            Status::SubDocBadRange => write!(f, "subdoc bad range"),
            Status::SubDocBadDelta => write!(f, "subdoc bad delta"),
            Status::SubDocPathExists => write!(f, "subdoc path exists"),
            Status::SubDocValueTooDeep => write!(f, "subdoc value too deep"),
            Status::SubDocBadCombo => write!(f, "subdoc bad combination"),
            Status::SubDocBadMulti => write!(f, "subdoc multi-path failure"),
            Status::SubDocSuccessDeleted => write!(f, "subdoc success on deleted document"),
            Status::SubDocMultiPathFailureDeleted => {
                write!(f, "subdoc multi-path failure on deleted document")
            }
            Status::Unknown(value) => write!(f, "unknown status {:#06x}", value),
        }
    }
}

/// Codes for the extended-frame objects inside framing extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtFrameCode {
    /// Synchronous durability requirement.
    Durability,
    /// Impersonated principal for the request.
    OnBehalfOf,
    /// Preserve the document's existing expiry.
    PreserveTtl,
    /// A frame code this client does not recognize.
    Unknown(u8),
}

impl ExtFrameCode {
    /// The wire value of this frame code.
    pub fn to_u8(self) -> u8 {
        match self {
            ExtFrameCode::Durability => 0x01,
            ExtFrameCode::OnBehalfOf => 0x04,
            ExtFrameCode::PreserveTtl => 0x05,
            ExtFrameCode::Unknown(value) => value,
        }
    }
}

/// Synchronous durability requirement for a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityLevel {
    /// No durability requirement.
    #[default]
    None,
    /// Replicate to a majority of nodes.
    Majority,
    /// Replicate to a majority and persist on the active node.
    MajorityAndPersistOnMaster,
    /// Persist to a majority of nodes.
    PersistToMajority,
}

impl DurabilityLevel {
    /// The wire value of this level.
    pub fn to_u8(self) -> u8 {
        match self {
            DurabilityLevel::None => 0x00,
            DurabilityLevel::Majority => 0x01,
            DurabilityLevel::MajorityAndPersistOnMaster => 0x02,
            DurabilityLevel::PersistToMajority => 0x03,
        }
    }
}

/// Document-level flags for sub-document operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubdocDocFlags(u8);

impl SubdocDocFlags {
    /// No flags.
    pub const NONE: SubdocDocFlags = SubdocDocFlags(0x00);
    /// Create the document if it does not exist.
    pub const MKDOC: SubdocDocFlags = SubdocDocFlags(0x01);
    /// Create the document, failing if it exists.
    pub const ADD_DOC: SubdocDocFlags = SubdocDocFlags(0x02);
    /// Allow access to deleted documents.
    pub const ACCESS_DELETED: SubdocDocFlags = SubdocDocFlags(0x04);
    /// Create the document in a deleted state.
    pub const CREATE_AS_DELETED: SubdocDocFlags = SubdocDocFlags(0x08);
    /// Revive a deleted document.
    pub const REVIVE_DOCUMENT: SubdocDocFlags = SubdocDocFlags(0x10);

    /// Whether all bits of `other` are set.
    pub fn contains(self, other: SubdocDocFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no flags are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The wire value of the flag set.
    pub fn to_u8(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for SubdocDocFlags {
    type Output = SubdocDocFlags;

    fn bitor(self, rhs: SubdocDocFlags) -> SubdocDocFlags {
        SubdocDocFlags(self.0 | rhs.0)
    }
}

/// Sub-document operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubDocOp {
    /// Fetch the value at a path.
    Get,
    /// Check whether a path exists.
    Exists,
    /// Add a dictionary entry, failing if the path exists.
    DictAdd,
    /// Add or replace a dictionary entry.
    DictUpsert,
    /// Remove the value at a path.
    Delete,
    /// Replace the value at a path.
    Replace,
    /// Push onto the end of an array.
    ArrayPushLast,
    /// Push onto the front of an array.
    ArrayPushFirst,
    /// Insert into an array at an index path.
    ArrayInsert,
    /// Push onto an array if the value is not present.
    ArrayAddUnique,
    /// Adjust a numeric value by a delta.
    Counter,
    /// Count the entries at a path.
    GetCount,
    /// An operation this client does not recognize.
    Unknown(u8),
}

impl SubDocOp {
    /// The wire value of this sub-document opcode.
    pub fn to_u8(self) -> u8 {
        match self {
            SubDocOp::Get => 0xc5,
            SubDocOp::Exists => 0xc6,
            SubDocOp::DictAdd => 0xc7,
            SubDocOp::DictUpsert => 0xc8,
            SubDocOp::Delete => 0xc9,
            SubDocOp::Replace => 0xca,
            SubDocOp::ArrayPushLast => 0xcb,
            SubDocOp::ArrayPushFirst => 0xcc,
            SubDocOp::ArrayInsert => 0xcd,
            SubDocOp::ArrayAddUnique => 0xce,
            SubDocOp::Counter => 0xcf,
            SubDocOp::GetCount => 0xd2,
            SubDocOp::Unknown(value) => value,
        }
    }
}

/// A request packet as a borrowed view over caller memory.
///
/// The dispatcher assigns the opaque and copies the sections into its send
/// buffer, so the caller's key and value never need to be cloned to build
/// a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestPacket<'a> {
    /// Frame layout selector.
    pub magic: Magic,
    /// Operation code.
    pub op_code: OpCode,
    /// Value datatype.
    pub datatype: u8,
    /// Target vbucket.
    pub vbucket_id: u16,
    /// CAS precondition, zero for none.
    pub cas: u64,
    /// Framing extras, only valid with an extended magic.
    pub framing_extras: &'a [u8],
    /// Operation extras.
    pub extras: &'a [u8],
    /// Document key (collection-encoded where applicable).
    pub key: &'a [u8],
    /// Document value.
    pub value: &'a [u8],
}

/// A decoded response packet owning its body bytes.
///
/// Section fields are zero-copy slices into one owned body buffer.
#[derive(Debug, Clone)]
pub struct ResponsePacket {
    /// Frame layout selector.
    pub magic: Magic,
    /// Operation code echoed by the server.
    pub op_code: OpCode,
    /// Value datatype.
    pub datatype: u8,
    /// Operation status.
    pub status: Status,
    /// Opaque echoed from the request.
    pub opaque: u32,
    /// CAS of the affected document.
    pub cas: u64,
    /// Framing extras.
    pub framing_extras: Bytes,
    /// Operation extras.
    pub extras: Bytes,
    /// Key, for operations that return one.
    pub key: Bytes,
    /// Response value.
    pub value: Bytes,
}

impl Default for ResponsePacket {
    fn default() -> Self {
        ResponsePacket {
            magic: Magic::Res,
            op_code: OpCode::Get,
            datatype: 0,
            status: Status::Success,
            opaque: 0,
            cas: 0,
            framing_extras: Bytes::new(),
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }
}

/// A decoded request frame, owning its body bytes.
///
/// The client only sends requests, but mock dispatchers and in-process
/// test servers need to look inside the frames they receive.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    /// Frame layout selector.
    pub magic: Magic,
    /// Operation code.
    pub op_code: OpCode,
    /// Value datatype.
    pub datatype: u8,
    /// Target vbucket.
    pub vbucket_id: u16,
    /// Client-assigned opaque.
    pub opaque: u32,
    /// CAS precondition.
    pub cas: u64,
    /// Framing extras.
    pub framing_extras: Bytes,
    /// Operation extras.
    pub extras: Bytes,
    /// Document key.
    pub key: Bytes,
    /// Document value.
    pub value: Bytes,
}

/// Encode a request packet into `buf` with the given opaque.
///
/// The codec performs no semantic validation beyond length arithmetic:
/// sections that cannot be represented in the selected magic's length
/// fields are rejected.
pub fn encode_request(packet: &RequestPacket<'_>, opaque: u32, buf: &mut BytesMut) -> Result<()> {
    let ext_len = packet.extras.len();
    if ext_len > u8::MAX as usize {
        return Err(Error::protocol("extras too long to encode"));
    }

    let body_len = packet.framing_extras.len() + ext_len + packet.key.len() + packet.value.len();

    buf.reserve(HEADER_SIZE + body_len);
    buf.put_u8(packet.magic.to_u8());
    buf.put_u8(packet.op_code.to_u8());

    match packet.magic {
        Magic::Req => {
            if !packet.framing_extras.is_empty() {
                return Err(Error::protocol(
                    "cannot encode framing extras without an extended magic",
                ));
            }
            if packet.key.len() > u16::MAX as usize {
                return Err(Error::protocol("key too long to encode"));
            }
            buf.put_u16(packet.key.len() as u16);
        }
        Magic::ReqExt => {
            if packet.framing_extras.len() > u8::MAX as usize {
                return Err(Error::protocol("framing extras too long to encode"));
            }
            if packet.key.len() > u8::MAX as usize {
                return Err(Error::protocol("key too long to encode"));
            }
            buf.put_u8(packet.framing_extras.len() as u8);
            buf.put_u8(packet.key.len() as u8);
        }
        Magic::Res | Magic::ResExt => {
            return Err(Error::protocol("cannot encode a request with a response magic"));
        }
    }

    buf.put_u8(ext_len as u8);
    buf.put_u8(packet.datatype);
    buf.put_u16(packet.vbucket_id);
    buf.put_u32(body_len as u32);
    buf.put_u32(opaque);
    buf.put_u64(packet.cas);

    buf.put_slice(packet.framing_extras);
    buf.put_slice(packet.extras);
    buf.put_slice(packet.key);
    buf.put_slice(packet.value);

    Ok(())
}

/// Decode a response frame from one owned buffer.
///
/// `data` must hold exactly one frame (header plus body). The returned
/// packet's sections are slices of `data`; nothing is copied.
pub fn decode_response(data: Bytes) -> Result<ResponsePacket> {
    if data.len() < HEADER_SIZE {
        return Err(Error::ShortFrame);
    }

    let magic = Magic::from_u8(data[0])?;
    if magic.is_request() {
        return Err(Error::BadMagic(data[0]));
    }

    let op_code = OpCode::from_u8(data[1]);
    let (framing_len, key_len) = if magic.has_ext_frames() {
        (data[2] as usize, data[3] as usize)
    } else {
        (0, u16::from_be_bytes([data[2], data[3]]) as usize)
    };
    let ext_len = data[4] as usize;
    let datatype = data[5];
    let status = Status::from_u16(u16::from_be_bytes([data[6], data[7]]));
    let body_len = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
    let opaque = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
    let cas = u64::from_be_bytes([
        data[16], data[17], data[18], data[19], data[20], data[21], data[22], data[23],
    ]);

    if data.len() < HEADER_SIZE + body_len || framing_len + ext_len + key_len > body_len {
        return Err(Error::ShortFrame);
    }

    let framing_start = HEADER_SIZE;
    let ext_start = framing_start + framing_len;
    let key_start = ext_start + ext_len;
    let value_start = key_start + key_len;
    let body_end = HEADER_SIZE + body_len;

    Ok(ResponsePacket {
        magic,
        op_code,
        datatype,
        status,
        opaque,
        cas,
        framing_extras: data.slice(framing_start..ext_start),
        extras: data.slice(ext_start..key_start),
        key: data.slice(key_start..value_start),
        value: data.slice(value_start..body_end),
    })
}

/// Decode a request frame from one owned buffer.
pub fn decode_request(data: Bytes) -> Result<RequestFrame> {
    if data.len() < HEADER_SIZE {
        return Err(Error::ShortFrame);
    }

    let magic = Magic::from_u8(data[0])?;
    if !magic.is_request() {
        return Err(Error::BadMagic(data[0]));
    }

    let op_code = OpCode::from_u8(data[1]);
    let (framing_len, key_len) = if magic.has_ext_frames() {
        (data[2] as usize, data[3] as usize)
    } else {
        (0, u16::from_be_bytes([data[2], data[3]]) as usize)
    };
    let ext_len = data[4] as usize;
    let datatype = data[5];
    let vbucket_id = u16::from_be_bytes([data[6], data[7]]);
    let body_len = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
    let opaque = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
    let cas = u64::from_be_bytes([
        data[16], data[17], data[18], data[19], data[20], data[21], data[22], data[23],
    ]);

    if data.len() < HEADER_SIZE + body_len || framing_len + ext_len + key_len > body_len {
        return Err(Error::ShortFrame);
    }

    let framing_start = HEADER_SIZE;
    let ext_start = framing_start + framing_len;
    let key_start = ext_start + ext_len;
    let value_start = key_start + key_len;
    let body_end = HEADER_SIZE + body_len;

    Ok(RequestFrame {
        magic,
        op_code,
        datatype,
        vbucket_id,
        opaque,
        cas,
        framing_extras: data.slice(framing_start..ext_start),
        extras: data.slice(ext_start..key_start),
        key: data.slice(key_start..value_start),
        value: data.slice(value_start..body_end),
    })
}

// Frame objects pack a 4-bit code and 4-bit length into one header byte;
// lengths of 15 or more escape into a following byte holding len - 15.
const EXT_FRAME_LEN_ESCAPE: usize = 15;

/// Append one extended-frame object to `buf`.
pub fn append_ext_frame(code: ExtFrameCode, data: &[u8], buf: &mut Vec<u8>) -> Result<()> {
    let code_value = code.to_u8();
    if code_value >= 15 {
        return Err(Error::protocol("frame code too large to encode"));
    }

    if data.len() < EXT_FRAME_LEN_ESCAPE {
        buf.push((code_value << 4) | data.len() as u8);
    } else {
        let escaped = data.len() - EXT_FRAME_LEN_ESCAPE;
        if escaped > u8::MAX as usize {
            return Err(Error::protocol("frame payload too large to encode"));
        }
        buf.push((code_value << 4) | EXT_FRAME_LEN_ESCAPE as u8);
        buf.push(escaped as u8);
    }
    buf.extend_from_slice(data);
    Ok(())
}

/// Append an unsigned-LEB128 collection ID followed by the raw key.
pub fn append_collection_id_and_key(collection_id: u32, key: &[u8], buf: &mut Vec<u8>) {
    let mut value = collection_id;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    buf.extend_from_slice(key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let packet = RequestPacket {
            magic: Magic::Req,
            op_code: OpCode::Set,
            datatype: 1,
            vbucket_id: 42,
            cas: 0x1122334455667788,
            extras: &[0xde, 0xad, 0xbe, 0xef],
            key: b"hello",
            value: b"world",
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        encode_request(&packet, 7, &mut buf).unwrap();

        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[1], 0x01);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 5);
        assert_eq!(buf[4], 4);

        let decoded = decode_request(buf.freeze()).unwrap();
        assert_eq!(decoded.magic, Magic::Req);
        assert_eq!(decoded.op_code, OpCode::Set);
        assert_eq!(decoded.vbucket_id, 42);
        assert_eq!(decoded.opaque, 7);
        assert_eq!(decoded.cas, 0x1122334455667788);
        assert_eq!(&decoded.extras[..], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&decoded.key[..], b"hello");
        assert_eq!(&decoded.value[..], b"world");
    }

    #[test]
    fn test_request_with_framing_extras() {
        let packet = RequestPacket {
            magic: Magic::ReqExt,
            op_code: OpCode::Get,
            framing_extras: &[0x50],
            key: b"k",
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        encode_request(&packet, 9, &mut buf).unwrap();

        assert_eq!(buf[0], 0x08);
        assert_eq!(buf[2], 1); // framing extras length
        assert_eq!(buf[3], 1); // key length

        let decoded = decode_request(buf.freeze()).unwrap();
        assert_eq!(&decoded.framing_extras[..], &[0x50]);
        assert_eq!(&decoded.key[..], b"k");
    }

    #[test]
    fn test_framing_extras_require_extended_magic() {
        let packet = RequestPacket {
            magic: Magic::Req,
            op_code: OpCode::Get,
            framing_extras: &[0x50],
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        let err = encode_request(&packet, 0, &mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_decode_response() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x81); // magic
        buf.put_u8(0x00); // opcode
        buf.put_u16(0); // key length
        buf.put_u8(4); // extras length
        buf.put_u8(0); // datatype
        buf.put_u16(0x0001); // status
        buf.put_u32(4 + 3); // body length
        buf.put_u32(99); // opaque
        buf.put_u64(1234); // cas
        buf.put_u32(0xcafebabe); // extras
        buf.put_slice(b"abc"); // value

        let resp = decode_response(buf.freeze()).unwrap();
        assert_eq!(resp.magic, Magic::Res);
        assert_eq!(resp.status, Status::KeyNotFound);
        assert_eq!(resp.opaque, 99);
        assert_eq!(resp.cas, 1234);
        assert_eq!(&resp.extras[..], &[0xca, 0xfe, 0xba, 0xbe]);
        assert_eq!(&resp.value[..], b"abc");
    }

    #[test]
    fn test_decode_rejects_short_frames() {
        assert!(matches!(
            decode_response(Bytes::from_static(&[0x81, 0x00])),
            Err(Error::ShortFrame)
        ));

        // Header claims a longer body than is present.
        let mut buf = BytesMut::new();
        buf.put_u8(0x81);
        buf.put_u8(0x00);
        buf.put_u16(0);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u32(10);
        buf.put_u32(0);
        buf.put_u64(0);
        assert!(matches!(decode_response(buf.freeze()), Err(Error::ShortFrame)));
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x55);
        buf.put_slice(&[0u8; 23]);
        assert!(matches!(decode_response(buf.freeze()), Err(Error::BadMagic(0x55))));

        // A request magic is not a valid response.
        let mut buf = BytesMut::new();
        buf.put_u8(0x80);
        buf.put_slice(&[0u8; 23]);
        assert!(matches!(decode_response(buf.freeze()), Err(Error::BadMagic(0x80))));
    }

    #[test]
    fn test_ext_frame_short_and_escaped() {
        let mut buf = Vec::new();
        append_ext_frame(ExtFrameCode::Durability, &[0x01], &mut buf).unwrap();
        assert_eq!(buf, vec![0x11, 0x01]);

        let mut buf = Vec::new();
        let payload = [0xaa; 20];
        append_ext_frame(ExtFrameCode::OnBehalfOf, &payload, &mut buf).unwrap();
        assert_eq!(buf[0], 0x4f); // code 4, length escape
        assert_eq!(buf[1], 5); // 20 - 15
        assert_eq!(&buf[2..], &payload[..]);
    }

    #[test]
    fn test_zero_length_ext_frame() {
        let mut buf = Vec::new();
        append_ext_frame(ExtFrameCode::PreserveTtl, &[], &mut buf).unwrap();
        assert_eq!(buf, vec![0x50]);
    }

    #[test]
    fn test_collection_key_encoding() {
        let mut buf = Vec::new();
        append_collection_id_and_key(5, b"k", &mut buf);
        assert_eq!(buf, vec![0x05, b'k']);

        let mut buf = Vec::new();
        append_collection_id_and_key(0x80, b"key", &mut buf);
        assert_eq!(buf, vec![0x80, 0x01, b'k', b'e', b'y']);

        let mut buf = Vec::new();
        append_collection_id_and_key(0, b"", &mut buf);
        assert_eq!(buf, vec![0x00]);
    }

    #[test]
    fn test_status_round_trip() {
        for value in [0x0000u16, 0x0001, 0x0086, 0x00cc, 0x00d3, 0xbeef] {
            assert_eq!(Status::from_u16(value).to_u16(), value);
        }
    }
}
