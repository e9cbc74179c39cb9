//! Typed operation layer over a [`Dispatcher`].
//!
//! Each operation encodes a single request packet, dispatches it, and
//! decodes the response into a typed result, translating wire statuses
//! into the crate error taxonomy. Status interpretation is deliberately
//! per-operation: the same status means different things on different
//! opcodes (`KeyExists` is a CAS mismatch on `Set`, an existing document
//! on `Add`, and a locked document on `GetAndTouch`).

use std::time::Duration;

use bytes::Bytes;

use crate::client::Dispatcher;
use crate::error::{Error, Feature, ServerError};
use crate::packet::{
    append_collection_id_and_key, append_ext_frame, DurabilityLevel, ExtFrameCode, Magic, OpCode,
    RequestPacket, ResponsePacket, Status, SubDocOp, SubdocDocFlags,
};
use crate::Result;

/// Identifies a mutation's position in a vbucket's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutationToken {
    /// UUID of the vbucket at the time of the mutation.
    pub vb_uuid: u64,
    /// Sequence number of the mutation.
    pub seq_no: u64,
}

/// Result of a single op within a sub-document multi-op.
#[derive(Debug, Default)]
pub struct SubDocResult {
    /// The value returned for this op, empty if none.
    pub value: Bytes,
    /// The per-op error, if the op did not succeed.
    pub err: Option<Error>,
}

/// One lookup within a [`OpsCrud::lookup_in`] request.
#[derive(Debug, Clone, Copy)]
pub struct LookupInOp<'a> {
    /// Sub-document opcode.
    pub op: SubDocOp,
    /// Per-op flags (xattr access and similar).
    pub flags: u8,
    /// Path to operate on; opaque bytes supplied by the caller.
    pub path: &'a [u8],
}

/// One mutation within a [`OpsCrud::mutate_in`] request.
#[derive(Debug, Clone, Copy)]
pub struct MutateInOp<'a> {
    /// Sub-document opcode.
    pub op: SubDocOp,
    /// Per-op flags (create-path, xattr access and similar).
    pub flags: u8,
    /// Path to operate on; opaque bytes supplied by the caller.
    pub path: &'a [u8],
    /// Value for the mutation.
    pub value: &'a [u8],
}

/// The CRUD operation surface.
///
/// The four flags mirror what was negotiated on the connection; they are
/// caller-supplied truth, not discovered here. Encoding fails
/// synchronously when a request needs a feature that is not enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpsCrud {
    /// Extended (framing) extras were negotiated.
    pub ext_frames_enabled: bool,
    /// Collection-encoded keys were negotiated.
    pub collections_enabled: bool,
    /// Synchronous durability was negotiated.
    pub durability_enabled: bool,
    /// Preserve-expiry was negotiated.
    pub preserve_expiry_enabled: bool,
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

impl OpsCrud {
    fn encode_collection_and_key(&self, collection_id: u32, key: &[u8]) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(key.len() + 5);
        if !self.collections_enabled {
            if collection_id != 0 {
                return Err(Error::CollectionsNotEnabled);
            }
            buf.extend_from_slice(key);
            return Ok(buf);
        }

        append_collection_id_and_key(collection_id, key, &mut buf);
        Ok(buf)
    }

    fn encode_req_ext_frames(
        &self,
        on_behalf_of: Option<&str>,
        durability_level: DurabilityLevel,
        durability_timeout: Option<Duration>,
        preserve_expiry: bool,
    ) -> Result<(Magic, Vec<u8>)> {
        let mut buf = Vec::new();

        if let Some(principal) = on_behalf_of {
            append_ext_frame(ExtFrameCode::OnBehalfOf, principal.as_bytes(), &mut buf)?;
        }

        if durability_level != DurabilityLevel::None {
            if !self.durability_enabled {
                return Err(Error::FeatureNotEnabled(Feature::Durability));
            }

            match durability_timeout {
                Some(timeout) if !timeout.is_zero() => {
                    let millis = timeout.as_millis().min(65535) as u16;
                    let frame = [durability_level.to_u8(), (millis >> 8) as u8, millis as u8];
                    append_ext_frame(ExtFrameCode::Durability, &frame, &mut buf)?;
                }
                _ => {
                    append_ext_frame(ExtFrameCode::Durability, &[durability_level.to_u8()], &mut buf)?;
                }
            }
        } else if durability_timeout.is_some_and(|t| !t.is_zero()) {
            return Err(Error::InvalidDurabilityArgs);
        }

        if preserve_expiry {
            if !self.preserve_expiry_enabled {
                return Err(Error::FeatureNotEnabled(Feature::PreserveExpiry));
            }

            append_ext_frame(ExtFrameCode::PreserveTtl, &[], &mut buf)?;
        }

        if !buf.is_empty() {
            if !self.ext_frames_enabled {
                return Err(Error::FeatureNotEnabled(Feature::ExtFrames));
            }

            return Ok((Magic::ReqExt, buf));
        }

        Ok((Magic::Req, buf))
    }

    fn decode_common_status(status: Status) -> Option<Error> {
        match status {
            Status::CollectionUnknown => Some(Error::UnknownCollectionId),
            Status::AccessError => Some(Error::AccessError),
            _ => None,
        }
    }

    fn decode_common_error<D: Dispatcher>(resp: &ResponsePacket, dispatcher: &D) -> Error {
        if let Some(err) = Self::decode_common_status(resp.status) {
            return err;
        }

        Error::Server(ServerError {
            cause: format!("unexpected status: {}", resp.status),
            status: resp.status,
            dispatched_to: dispatcher.remote_addr().to_string(),
            dispatched_from: dispatcher.local_addr().to_string(),
            opaque: resp.opaque,
        })
    }

    fn sub_doc_error<D: Dispatcher>(status: Status, opaque: u32, dispatcher: &D) -> Error {
        let cause = match Self::decode_common_status(status) {
            Some(err) => err.to_string(),
            None => format!("unexpected status: {}", status),
        };

        Error::Server(ServerError {
            cause,
            status,
            dispatched_to: dispatcher.remote_addr().to_string(),
            dispatched_from: dispatcher.local_addr().to_string(),
            opaque,
        })
    }

    fn decode_mutation_token(extras: &[u8]) -> Result<MutationToken> {
        if extras.len() == 16 {
            Ok(MutationToken {
                vb_uuid: be_u64(&extras[0..]),
                seq_no: be_u64(&extras[8..]),
            })
        } else if extras.is_empty() {
            Ok(MutationToken::default())
        } else {
            Err(Error::protocol("bad extras length"))
        }
    }
}

/// Request for [`OpsCrud::get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
}

/// Response for [`OpsCrud::get`].
#[derive(Debug, Clone)]
pub struct GetResponse {
    /// CAS of the document.
    pub cas: u64,
    /// Caller flags stored with the document.
    pub flags: u32,
    /// Document value.
    pub value: Bytes,
    /// Datatype of the value.
    pub datatype: u8,
}

/// Request for [`OpsCrud::get_and_touch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetAndTouchRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// New expiry to set, in seconds.
    pub expiry: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
}

/// Request for [`OpsCrud::get_replica`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetReplicaRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
}

/// Request for [`OpsCrud::get_and_lock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetAndLockRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Duration of the lock, in seconds.
    pub lock_time: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
}

/// Request for [`OpsCrud::get_random`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetRandomRequest<'a> {
    /// Collection to sample from.
    pub collection_id: u32,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
}

/// Response for [`OpsCrud::get_random`].
#[derive(Debug, Clone)]
pub struct GetRandomResponse {
    /// Key of the returned document.
    pub key: Bytes,
    /// CAS of the document.
    pub cas: u64,
    /// Caller flags stored with the document.
    pub flags: u32,
    /// Document value.
    pub value: Bytes,
    /// Datatype of the value.
    pub datatype: u8,
}

/// Request for [`OpsCrud::set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Caller flags to store with the document.
    pub flags: u32,
    /// Document value.
    pub value: &'a [u8],
    /// Datatype of the value.
    pub datatype: u8,
    /// Expiry in seconds, zero for none.
    pub expiry: u32,
    /// Keep the document's existing expiry.
    pub preserve_expiry: bool,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
    /// CAS precondition, zero for none.
    pub cas: u64,
    /// Durability requirement.
    pub durability_level: DurabilityLevel,
    /// Timeout for the durability requirement.
    pub durability_level_timeout: Option<Duration>,
}

/// Response for a document mutation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutationResponse {
    /// CAS of the new document revision.
    pub cas: u64,
    /// Mutation token, zeroed when the server did not include one.
    pub mutation_token: MutationToken,
}

/// Request for [`OpsCrud::add`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AddRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Caller flags to store with the document.
    pub flags: u32,
    /// Document value.
    pub value: &'a [u8],
    /// Datatype of the value.
    pub datatype: u8,
    /// Expiry in seconds, zero for none.
    pub expiry: u32,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
    /// Durability requirement.
    pub durability_level: DurabilityLevel,
    /// Timeout for the durability requirement.
    pub durability_level_timeout: Option<Duration>,
}

/// Request for [`OpsCrud::replace`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Caller flags to store with the document.
    pub flags: u32,
    /// Document value.
    pub value: &'a [u8],
    /// Datatype of the value.
    pub datatype: u8,
    /// Expiry in seconds, zero for none.
    pub expiry: u32,
    /// Keep the document's existing expiry.
    pub preserve_expiry: bool,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
    /// CAS precondition, zero for none.
    pub cas: u64,
    /// Durability requirement.
    pub durability_level: DurabilityLevel,
    /// Timeout for the durability requirement.
    pub durability_level_timeout: Option<Duration>,
}

/// Request for [`OpsCrud::delete`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
    /// CAS precondition, zero for none.
    pub cas: u64,
    /// Durability requirement.
    pub durability_level: DurabilityLevel,
    /// Timeout for the durability requirement.
    pub durability_level_timeout: Option<Duration>,
}

/// Request for [`OpsCrud::touch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TouchRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// New expiry to set, in seconds.
    pub expiry: u32,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
}

/// Response for [`OpsCrud::touch`].
#[derive(Debug, Clone, Copy)]
pub struct TouchResponse {
    /// CAS of the touched document.
    pub cas: u64,
}

/// Request for [`OpsCrud::unlock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlockRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// CAS returned by the locking operation.
    pub cas: u64,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
}

/// Response for [`OpsCrud::unlock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlockResponse {
    /// Mutation token, zeroed when the server did not include one.
    pub mutation_token: MutationToken,
}

/// Request for [`OpsCrud::append`] and [`OpsCrud::prepend`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AdjoinRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Bytes to adjoin.
    pub value: &'a [u8],
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
    /// Datatype of the value.
    pub datatype: u8,
    /// Durability requirement.
    pub durability_level: DurabilityLevel,
    /// Timeout for the durability requirement.
    pub durability_level_timeout: Option<Duration>,
}

/// Request for [`OpsCrud::increment`] and [`OpsCrud::decrement`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
    /// Initial value when the counter does not exist. `u64::MAX` means
    /// the operation must not create the counter.
    pub initial: u64,
    /// Amount to adjust by.
    pub delta: u64,
    /// Expiry in seconds applied on creation.
    pub expiry: u32,
    /// Durability requirement.
    pub durability_level: DurabilityLevel,
    /// Timeout for the durability requirement.
    pub durability_level_timeout: Option<Duration>,
}

/// Response for [`OpsCrud::increment`] and [`OpsCrud::decrement`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterResponse {
    /// CAS of the counter document.
    pub cas: u64,
    /// Mutation token, zeroed when the server did not include one.
    pub mutation_token: MutationToken,
    /// The counter's value after the adjustment.
    pub value: u64,
}

/// Request for [`OpsCrud::get_meta`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetMetaRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
}

/// Response for [`OpsCrud::get_meta`].
#[derive(Debug, Clone)]
pub struct GetMetaResponse {
    /// Document value.
    pub value: Bytes,
    /// Caller flags stored with the document.
    pub flags: u32,
    /// CAS of the document.
    pub cas: u64,
    /// Expiry of the document.
    pub expiry: u32,
    /// Sequence number of the document's last mutation.
    pub seq_no: u64,
    /// Datatype of the value.
    pub datatype: u8,
    /// Non-zero when the document is a tombstone.
    pub deleted: u32,
}

/// Request for [`OpsCrud::set_meta`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetMetaRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Caller flags to store with the document.
    pub flags: u32,
    /// Document value.
    pub value: &'a [u8],
    /// Datatype of the value.
    pub datatype: u8,
    /// Expiry in seconds, zero for none.
    pub expiry: u32,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
    /// Opaque metadata blob forwarded to the server.
    pub extra: &'a [u8],
    /// Revision number to store.
    pub rev_no: u64,
    /// CAS to store.
    pub cas: u64,
    /// Conflict-resolution options.
    pub options: u32,
}

/// Request for [`OpsCrud::delete_meta`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteMetaRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Caller flags to store with the tombstone.
    pub flags: u32,
    /// Expiry in seconds, zero for none.
    pub expiry: u32,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
    /// CAS precondition, zero for none.
    pub cas: u64,
    /// Opaque metadata blob forwarded to the server.
    pub extra: &'a [u8],
    /// Revision number to store.
    pub rev_no: u64,
    /// Conflict-resolution options.
    pub options: u32,
}

/// Request for [`OpsCrud::lookup_in`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupInRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Document-level flags.
    pub flags: SubdocDocFlags,
    /// The lookups to perform.
    pub ops: &'a [LookupInOp<'a>],
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
}

/// Response for [`OpsCrud::lookup_in`].
#[derive(Debug, Default)]
pub struct LookupInResponse {
    /// Per-op results, in request order.
    pub ops: Vec<SubDocResult>,
    /// Whether the lookups were served from a deleted document.
    pub doc_is_deleted: bool,
    /// CAS of the document.
    pub cas: u64,
}

/// Request for [`OpsCrud::mutate_in`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MutateInRequest<'a> {
    /// Collection the document lives in.
    pub collection_id: u32,
    /// Document key.
    pub key: &'a [u8],
    /// Vbucket owning the key.
    pub vbucket_id: u16,
    /// Document-level flags.
    pub flags: SubdocDocFlags,
    /// The mutations to perform.
    pub ops: &'a [MutateInOp<'a>],
    /// Expiry in seconds, zero for none.
    pub expiry: u32,
    /// Keep the document's existing expiry.
    pub preserve_expiry: bool,
    /// Principal to impersonate.
    pub on_behalf_of: Option<&'a str>,
    /// CAS precondition, zero for none.
    pub cas: u64,
    /// Durability requirement.
    pub durability_level: DurabilityLevel,
    /// Timeout for the durability requirement.
    pub durability_level_timeout: Option<Duration>,
}

/// Response for [`OpsCrud::mutate_in`].
#[derive(Debug, Default)]
pub struct MutateInResponse {
    /// CAS of the new document revision.
    pub cas: u64,
    /// Mutation token, zeroed when the server did not include one.
    pub mutation_token: MutationToken,
    /// Per-op results, in request order.
    pub ops: Vec<SubDocResult>,
}

impl OpsCrud {
    /// Fetch a document.
    pub async fn get<D: Dispatcher>(&self, dispatcher: &D, req: GetRequest<'_>) -> Result<GetResponse> {
        let (magic, framing_extras) =
            self.encode_req_ext_frames(req.on_behalf_of, DurabilityLevel::None, None, false)?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::Get,
                vbucket_id: req.vbucket_id,
                framing_extras: &framing_extras,
                key: &key,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyNotFound => return Err(Error::DocNotFound),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        if resp.extras.len() != 4 {
            return Err(Error::protocol("bad extras length"));
        }

        Ok(GetResponse {
            cas: resp.cas,
            flags: be_u32(&resp.extras),
            value: resp.value,
            datatype: resp.datatype,
        })
    }

    /// Fetch a document and update its expiry.
    pub async fn get_and_touch<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: GetAndTouchRequest<'_>,
    ) -> Result<GetResponse> {
        let (magic, framing_extras) =
            self.encode_req_ext_frames(req.on_behalf_of, DurabilityLevel::None, None, false)?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;
        let extras = req.expiry.to_be_bytes();

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::GetAndTouch,
                vbucket_id: req.vbucket_id,
                framing_extras: &framing_extras,
                extras: &extras,
                key: &key,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyNotFound => return Err(Error::DocNotFound),
            Status::KeyExists => return Err(Error::DocLocked),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        if resp.extras.len() != 4 {
            return Err(Error::protocol("bad extras length"));
        }

        Ok(GetResponse {
            cas: resp.cas,
            flags: be_u32(&resp.extras),
            value: resp.value,
            datatype: resp.datatype,
        })
    }

    /// Fetch a document from a replica.
    pub async fn get_replica<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: GetReplicaRequest<'_>,
    ) -> Result<GetResponse> {
        let (magic, framing_extras) =
            self.encode_req_ext_frames(req.on_behalf_of, DurabilityLevel::None, None, false)?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::GetReplica,
                vbucket_id: req.vbucket_id,
                framing_extras: &framing_extras,
                key: &key,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyNotFound => return Err(Error::DocNotFound),
            Status::KeyExists => return Err(Error::DocLocked),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        if resp.extras.len() != 4 {
            return Err(Error::protocol("bad extras length"));
        }

        Ok(GetResponse {
            cas: resp.cas,
            flags: be_u32(&resp.extras),
            value: resp.value,
            datatype: resp.datatype,
        })
    }

    /// Fetch a document and lock it for writes.
    pub async fn get_and_lock<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: GetAndLockRequest<'_>,
    ) -> Result<GetResponse> {
        let (magic, framing_extras) =
            self.encode_req_ext_frames(req.on_behalf_of, DurabilityLevel::None, None, false)?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;
        let extras = req.lock_time.to_be_bytes();

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::GetLocked,
                vbucket_id: req.vbucket_id,
                framing_extras: &framing_extras,
                extras: &extras,
                key: &key,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyNotFound => return Err(Error::DocNotFound),
            Status::KeyExists => return Err(Error::DocLocked),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        if resp.extras.len() != 4 {
            return Err(Error::protocol("bad extras length"));
        }

        Ok(GetResponse {
            cas: resp.cas,
            flags: be_u32(&resp.extras),
            value: resp.value,
            datatype: resp.datatype,
        })
    }

    /// Fetch an arbitrary document from the selected bucket.
    pub async fn get_random<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: GetRandomRequest<'_>,
    ) -> Result<GetRandomResponse> {
        let (magic, framing_extras) =
            self.encode_req_ext_frames(req.on_behalf_of, DurabilityLevel::None, None, false)?;

        let mut extras = Vec::new();
        if self.collections_enabled {
            extras.extend_from_slice(&req.collection_id.to_be_bytes());
        } else if req.collection_id != 0 {
            return Err(Error::CollectionsNotEnabled);
        }

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::GetRandom,
                framing_extras: &framing_extras,
                extras: &extras,
                ..Default::default()
            })
            .await?;

        if resp.status != Status::Success {
            return Err(Self::decode_common_error(&resp, dispatcher));
        }

        if resp.extras.len() != 4 {
            return Err(Error::protocol("bad extras length"));
        }

        Ok(GetRandomResponse {
            key: resp.key,
            cas: resp.cas,
            flags: be_u32(&resp.extras),
            value: resp.value,
            datatype: resp.datatype,
        })
    }

    /// Store a document, replacing any existing revision.
    pub async fn set<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: SetRequest<'_>,
    ) -> Result<MutationResponse> {
        let (magic, framing_extras) = self.encode_req_ext_frames(
            req.on_behalf_of,
            req.durability_level,
            req.durability_level_timeout,
            req.preserve_expiry,
        )?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        let mut extras = [0u8; 8];
        extras[0..4].copy_from_slice(&req.flags.to_be_bytes());
        extras[4..8].copy_from_slice(&req.expiry.to_be_bytes());

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::Set,
                vbucket_id: req.vbucket_id,
                datatype: req.datatype,
                cas: req.cas,
                framing_extras: &framing_extras,
                extras: &extras,
                key: &key,
                value: req.value,
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyExists => return Err(Error::CasMismatch),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        Ok(MutationResponse {
            cas: resp.cas,
            mutation_token: Self::decode_mutation_token(&resp.extras)?,
        })
    }

    /// Store a document only if it does not already exist.
    pub async fn add<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: AddRequest<'_>,
    ) -> Result<MutationResponse> {
        let (magic, framing_extras) = self.encode_req_ext_frames(
            req.on_behalf_of,
            req.durability_level,
            req.durability_level_timeout,
            false,
        )?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        let mut extras = [0u8; 8];
        extras[0..4].copy_from_slice(&req.flags.to_be_bytes());
        extras[4..8].copy_from_slice(&req.expiry.to_be_bytes());

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::Add,
                vbucket_id: req.vbucket_id,
                datatype: req.datatype,
                framing_extras: &framing_extras,
                extras: &extras,
                key: &key,
                value: req.value,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyExists => return Err(Error::DocExists),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        Ok(MutationResponse {
            cas: resp.cas,
            mutation_token: Self::decode_mutation_token(&resp.extras)?,
        })
    }

    /// Store a document only if it already exists.
    pub async fn replace<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: ReplaceRequest<'_>,
    ) -> Result<MutationResponse> {
        if req.expiry != 0 && req.preserve_expiry {
            return Err(Error::invalid_argument(
                "cannot specify expiry and preserve expiry together",
            ));
        }

        let (magic, framing_extras) = self.encode_req_ext_frames(
            req.on_behalf_of,
            req.durability_level,
            req.durability_level_timeout,
            req.preserve_expiry,
        )?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        let mut extras = [0u8; 8];
        extras[0..4].copy_from_slice(&req.flags.to_be_bytes());
        extras[4..8].copy_from_slice(&req.expiry.to_be_bytes());

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::Replace,
                vbucket_id: req.vbucket_id,
                datatype: req.datatype,
                cas: req.cas,
                framing_extras: &framing_extras,
                extras: &extras,
                key: &key,
                value: req.value,
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyExists => return Err(Error::CasMismatch),
            Status::KeyNotFound => return Err(Error::DocNotFound),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        Ok(MutationResponse {
            cas: resp.cas,
            mutation_token: Self::decode_mutation_token(&resp.extras)?,
        })
    }

    /// Remove a document.
    pub async fn delete<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: DeleteRequest<'_>,
    ) -> Result<MutationResponse> {
        let (magic, framing_extras) = self.encode_req_ext_frames(
            req.on_behalf_of,
            req.durability_level,
            req.durability_level_timeout,
            false,
        )?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::Delete,
                vbucket_id: req.vbucket_id,
                cas: req.cas,
                framing_extras: &framing_extras,
                key: &key,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyExists => return Err(Error::CasMismatch),
            Status::KeyNotFound => return Err(Error::DocNotFound),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        Ok(MutationResponse {
            cas: resp.cas,
            mutation_token: Self::decode_mutation_token(&resp.extras)?,
        })
    }

    /// Update a document's expiry without fetching it.
    pub async fn touch<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: TouchRequest<'_>,
    ) -> Result<TouchResponse> {
        let (magic, framing_extras) =
            self.encode_req_ext_frames(req.on_behalf_of, DurabilityLevel::None, None, false)?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;
        let extras = req.expiry.to_be_bytes();

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::Touch,
                vbucket_id: req.vbucket_id,
                framing_extras: &framing_extras,
                extras: &extras,
                key: &key,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyNotFound => return Err(Error::DocNotFound),
            Status::KeyExists => return Err(Error::DocLocked),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        if !resp.extras.is_empty() {
            return Err(Error::protocol("bad extras length"));
        }

        Ok(TouchResponse { cas: resp.cas })
    }

    /// Release a lock taken by [`OpsCrud::get_and_lock`].
    pub async fn unlock<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: UnlockRequest<'_>,
    ) -> Result<UnlockResponse> {
        let (magic, framing_extras) =
            self.encode_req_ext_frames(req.on_behalf_of, DurabilityLevel::None, None, false)?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::UnlockKey,
                vbucket_id: req.vbucket_id,
                cas: req.cas,
                framing_extras: &framing_extras,
                key: &key,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyNotFound => return Err(Error::DocNotFound),
            Status::TmpFail => return Err(Error::DocLocked),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        Ok(UnlockResponse {
            mutation_token: Self::decode_mutation_token(&resp.extras)?,
        })
    }

    /// Append bytes to an existing document.
    pub async fn append<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: AdjoinRequest<'_>,
    ) -> Result<MutationResponse> {
        self.adjoin(dispatcher, OpCode::Append, req).await
    }

    /// Prepend bytes to an existing document.
    pub async fn prepend<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: AdjoinRequest<'_>,
    ) -> Result<MutationResponse> {
        self.adjoin(dispatcher, OpCode::Prepend, req).await
    }

    async fn adjoin<D: Dispatcher>(
        &self,
        dispatcher: &D,
        op_code: OpCode,
        req: AdjoinRequest<'_>,
    ) -> Result<MutationResponse> {
        let (magic, framing_extras) = self.encode_req_ext_frames(
            req.on_behalf_of,
            req.durability_level,
            req.durability_level_timeout,
            false,
        )?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code,
                vbucket_id: req.vbucket_id,
                datatype: req.datatype,
                framing_extras: &framing_extras,
                key: &key,
                value: req.value,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::NotStored => return Err(Error::DocNotFound),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        Ok(MutationResponse {
            cas: resp.cas,
            mutation_token: Self::decode_mutation_token(&resp.extras)?,
        })
    }

    /// Increment a counter document.
    pub async fn increment<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: CounterRequest<'_>,
    ) -> Result<CounterResponse> {
        self.counter(dispatcher, OpCode::Increment, req).await
    }

    /// Decrement a counter document.
    pub async fn decrement<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: CounterRequest<'_>,
    ) -> Result<CounterResponse> {
        self.counter(dispatcher, OpCode::Decrement, req).await
    }

    async fn counter<D: Dispatcher>(
        &self,
        dispatcher: &D,
        op_code: OpCode,
        req: CounterRequest<'_>,
    ) -> Result<CounterResponse> {
        let (magic, framing_extras) = self.encode_req_ext_frames(
            req.on_behalf_of,
            req.durability_level,
            req.durability_level_timeout,
            false,
        )?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        // An initial of all-ones signals that the counter must not be
        // created; the wire encoding for that is a zero initial and an
        // all-ones expiry.
        let mut extras = [0u8; 20];
        extras[0..8].copy_from_slice(&req.delta.to_be_bytes());
        if req.initial != u64::MAX {
            extras[8..16].copy_from_slice(&req.initial.to_be_bytes());
            extras[16..20].copy_from_slice(&req.expiry.to_be_bytes());
        } else {
            extras[16..20].copy_from_slice(&0xffff_ffffu32.to_be_bytes());
        }

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code,
                vbucket_id: req.vbucket_id,
                framing_extras: &framing_extras,
                extras: &extras,
                key: &key,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyNotFound => return Err(Error::DocNotFound),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        if resp.value.len() != 8 {
            return Err(Error::protocol("bad value length"));
        }

        Ok(CounterResponse {
            cas: resp.cas,
            mutation_token: Self::decode_mutation_token(&resp.extras)?,
            value: be_u64(&resp.value),
        })
    }

    /// Fetch a document's metadata, including tombstones.
    pub async fn get_meta<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: GetMetaRequest<'_>,
    ) -> Result<GetMetaResponse> {
        let (magic, framing_extras) =
            self.encode_req_ext_frames(req.on_behalf_of, DurabilityLevel::None, None, false)?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        // Version 2 of the request extras asks the server to include the
        // datatype in the response extras.
        let extras = [2u8];

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::GetMeta,
                vbucket_id: req.vbucket_id,
                framing_extras: &framing_extras,
                extras: &extras,
                key: &key,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyNotFound => return Err(Error::DocNotFound),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        if resp.extras.len() != 21 {
            return Err(Error::protocol("bad extras length"));
        }

        Ok(GetMetaResponse {
            value: resp.value,
            cas: resp.cas,
            deleted: be_u32(&resp.extras[0..]),
            flags: be_u32(&resp.extras[4..]),
            expiry: be_u32(&resp.extras[8..]),
            seq_no: be_u64(&resp.extras[12..]),
            datatype: resp.extras[20],
        })
    }

    /// Store a document with caller-supplied metadata.
    pub async fn set_meta<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: SetMetaRequest<'_>,
    ) -> Result<MutationResponse> {
        let (magic, framing_extras) =
            self.encode_req_ext_frames(req.on_behalf_of, DurabilityLevel::None, None, false)?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        let mut extras = Vec::with_capacity(30 + req.extra.len());
        extras.extend_from_slice(&req.flags.to_be_bytes());
        extras.extend_from_slice(&req.expiry.to_be_bytes());
        extras.extend_from_slice(&req.rev_no.to_be_bytes());
        extras.extend_from_slice(&req.cas.to_be_bytes());
        extras.extend_from_slice(&req.options.to_be_bytes());
        extras.extend_from_slice(&(req.extra.len() as u16).to_be_bytes());
        extras.extend_from_slice(req.extra);

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::SetMeta,
                vbucket_id: req.vbucket_id,
                datatype: req.datatype,
                framing_extras: &framing_extras,
                extras: &extras,
                key: &key,
                value: req.value,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyExists => return Err(Error::CasMismatch),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        Ok(MutationResponse {
            cas: resp.cas,
            mutation_token: Self::decode_mutation_token(&resp.extras)?,
        })
    }

    /// Remove a document, storing caller-supplied tombstone metadata.
    pub async fn delete_meta<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: DeleteMetaRequest<'_>,
    ) -> Result<MutationResponse> {
        let (magic, framing_extras) =
            self.encode_req_ext_frames(req.on_behalf_of, DurabilityLevel::None, None, false)?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        let mut extras = Vec::with_capacity(30 + req.extra.len());
        extras.extend_from_slice(&req.flags.to_be_bytes());
        extras.extend_from_slice(&req.expiry.to_be_bytes());
        extras.extend_from_slice(&req.rev_no.to_be_bytes());
        extras.extend_from_slice(&req.cas.to_be_bytes());
        extras.extend_from_slice(&req.options.to_be_bytes());
        extras.extend_from_slice(&(req.extra.len() as u16).to_be_bytes());
        extras.extend_from_slice(req.extra);

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::DelMeta,
                vbucket_id: req.vbucket_id,
                cas: req.cas,
                framing_extras: &framing_extras,
                extras: &extras,
                key: &key,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyExists if req.cas > 0 => return Err(Error::CasMismatch),
            Status::KeyNotFound => return Err(Error::DocNotFound),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        Ok(MutationResponse {
            cas: resp.cas,
            mutation_token: Self::decode_mutation_token(&resp.extras)?,
        })
    }

    /// Perform a batch of sub-document lookups against one document.
    pub async fn lookup_in<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: LookupInRequest<'_>,
    ) -> Result<LookupInResponse> {
        let (magic, framing_extras) =
            self.encode_req_ext_frames(req.on_behalf_of, DurabilityLevel::None, None, false)?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        let body_len = req.ops.iter().map(|op| 4 + op.path.len()).sum();
        let mut value = Vec::with_capacity(body_len);
        for op in req.ops {
            value.push(op.op.to_u8());
            value.push(op.flags);
            value.extend_from_slice(&(op.path.len() as u16).to_be_bytes());
            value.extend_from_slice(op.path);
        }

        let mut extras = Vec::new();
        if !req.flags.is_empty() {
            extras.push(req.flags.to_u8());
        }

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::SubDocMultiLookup,
                vbucket_id: req.vbucket_id,
                framing_extras: &framing_extras,
                extras: &extras,
                key: &key,
                value: &value,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success
            | Status::SubDocSuccessDeleted
            | Status::SubDocMultiPathFailureDeleted
            | Status::SubDocBadMulti => {}
            Status::KeyNotFound => return Err(Error::DocNotFound),
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        let mut results = Vec::with_capacity(req.ops.len());
        let mut iter = 0usize;
        for _ in 0..req.ops.len() {
            if iter + 6 > resp.value.len() {
                return Err(Error::protocol("bad value length"));
            }

            let op_status = Status::from_u16(be_u16(&resp.value[iter..]));
            let value_len = be_u32(&resp.value[iter + 2..]) as usize;

            if iter + 6 + value_len > resp.value.len() {
                return Err(Error::protocol("bad value length"));
            }

            let err = (op_status != Status::Success)
                .then(|| Self::sub_doc_error(op_status, resp.opaque, dispatcher));

            results.push(SubDocResult {
                value: resp.value.slice(iter + 6..iter + 6 + value_len),
                err,
            });
            iter += 6 + value_len;
        }

        Ok(LookupInResponse {
            ops: results,
            doc_is_deleted: matches!(
                resp.status,
                Status::SubDocSuccessDeleted | Status::SubDocMultiPathFailureDeleted
            ),
            cas: resp.cas,
        })
    }

    /// Perform a batch of sub-document mutations against one document.
    pub async fn mutate_in<D: Dispatcher>(
        &self,
        dispatcher: &D,
        req: MutateInRequest<'_>,
    ) -> Result<MutateInResponse> {
        if req.expiry != 0 && req.preserve_expiry {
            return Err(Error::invalid_argument(
                "cannot specify expiry and preserve expiry together",
            ));
        }

        let (magic, framing_extras) = self.encode_req_ext_frames(
            req.on_behalf_of,
            req.durability_level,
            req.durability_level_timeout,
            req.preserve_expiry,
        )?;
        let key = self.encode_collection_and_key(req.collection_id, req.key)?;

        let body_len = req
            .ops
            .iter()
            .map(|op| 8 + op.path.len() + op.value.len())
            .sum();
        let mut value = Vec::with_capacity(body_len);
        for op in req.ops {
            value.push(op.op.to_u8());
            value.push(op.flags);
            value.extend_from_slice(&(op.path.len() as u16).to_be_bytes());
            value.extend_from_slice(&(op.value.len() as u32).to_be_bytes());
            value.extend_from_slice(op.path);
            value.extend_from_slice(op.value);
        }

        let mut extras = Vec::new();
        if req.expiry != 0 {
            extras.extend_from_slice(&req.expiry.to_be_bytes());
        }
        if !req.flags.is_empty() {
            extras.push(req.flags.to_u8());
        }

        let resp = dispatcher
            .dispatch(RequestPacket {
                magic,
                op_code: OpCode::SubDocMultiMutation,
                vbucket_id: req.vbucket_id,
                cas: req.cas,
                framing_extras: &framing_extras,
                extras: &extras,
                key: &key,
                value: &value,
                ..Default::default()
            })
            .await?;

        match resp.status {
            Status::Success => {}
            Status::KeyNotFound => return Err(Error::DocNotFound),
            Status::NotStored if req.flags.contains(SubdocDocFlags::ADD_DOC) => {
                return Err(Error::DocExists);
            }
            Status::KeyExists => return Err(Error::CasMismatch),
            Status::SubDocBadMulti => {
                if resp.value.len() != 3 {
                    return Err(Error::protocol("bad value length"));
                }

                let op_status = Status::from_u16(be_u16(&resp.value[1..]));
                return Err(Self::sub_doc_error(op_status, resp.opaque, dispatcher));
            }
            _ => return Err(Self::decode_common_error(&resp, dispatcher)),
        }

        let mut results: Vec<SubDocResult> = Vec::with_capacity(req.ops.len());
        results.resize_with(req.ops.len(), SubDocResult::default);

        let mut read_pos = 0usize;
        while read_pos < resp.value.len() {
            if read_pos + 3 > resp.value.len() {
                return Err(Error::protocol("bad value length"));
            }

            let op_index = resp.value[read_pos] as usize;
            let op_status = Status::from_u16(be_u16(&resp.value[read_pos + 1..]));
            read_pos += 3;

            if op_index >= results.len() {
                return Err(Error::protocol("bad op index"));
            }

            if op_status == Status::Success {
                if read_pos + 4 > resp.value.len() {
                    return Err(Error::protocol("bad value length"));
                }
                let value_len = be_u32(&resp.value[read_pos..]) as usize;
                if read_pos + 4 + value_len > resp.value.len() {
                    return Err(Error::protocol("bad value length"));
                }

                results[op_index].value = resp.value.slice(read_pos + 4..read_pos + 4 + value_len);
                read_pos += 4 + value_len;
            } else {
                results[op_index].err =
                    Some(Self::sub_doc_error(op_status, resp.opaque, dispatcher));
            }
        }

        Ok(MutateInResponse {
            cas: resp.cas,
            mutation_token: Self::decode_mutation_token(&resp.extras)?,
            ops: results,
        })
    }
}
