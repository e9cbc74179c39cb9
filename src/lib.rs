//! # OpalKV Client Core
//!
//! Client core for OpalKV - a distributed key-value store speaking a
//! binary memcached-derived wire protocol.
//!
//! ## Features
//!
//! - **Typed operation surface** - CRUD, atomic counters, sub-document
//!   mutations and metadata replication over [`OpsCrud`]
//! - **Connection pooling** - A fixed fleet of long-lived authenticated
//!   connections with concurrent establishment and reconfiguration
//! - **Concurrent dispatch** - Requests from many tasks multiplex onto one
//!   connection, paired back to their callers by opaque
//! - **Extended framing** - Impersonation, synchronous durability and
//!   preserve-expiry metadata on individual requests
//!
//! ## Example
//! ```no_run
//! use opalkv_client::{
//!     GetRequest, KvClientConfig, KvClientPool, KvClientPoolConfig, OpsCrud,
//!     PasswordAuthenticator, Result, SetRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pool = KvClientPool::connect(KvClientPoolConfig {
//!         num_connections: 4,
//!         client_config: KvClientConfig {
//!             address: "127.0.0.1:11210".to_string(),
//!             selected_bucket: Some("default".to_string()),
//!             authenticator: Some(PasswordAuthenticator {
//!                 username: "username".to_string(),
//!                 password: "password".to_string(),
//!             }),
//!             ..Default::default()
//!         },
//!     })?;
//!
//!     let ops = OpsCrud::default();
//!     let client = pool.get_client().await?;
//!
//!     ops.set(
//!         &*client,
//!         SetRequest {
//!             key: b"my_key",
//!             value: b"my_value",
//!             vbucket_id: 7,
//!             ..Default::default()
//!         },
//!     )
//!     .await?;
//!
//!     let resp = ops
//!         .get(
//!             &*client,
//!             GetRequest {
//!                 key: b"my_key",
//!                 vbucket_id: 7,
//!                 ..Default::default()
//!             },
//!         )
//!         .await?;
//!     println!("Got value: {:?}", resp.value);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![forbid(unsafe_code)]

mod client;
mod error;
mod ops;
mod packet;
mod pool;

pub use client::{Dispatcher, KvClient, KvClientConfig, PasswordAuthenticator, TlsConfig};
pub use error::{Error, Feature, ServerError};
pub use ops::{
    AddRequest, AdjoinRequest, CounterRequest, CounterResponse, DeleteMetaRequest, DeleteRequest,
    GetAndLockRequest, GetAndTouchRequest, GetMetaRequest, GetMetaResponse, GetRandomRequest,
    GetRandomResponse, GetReplicaRequest, GetRequest, GetResponse, LookupInOp, LookupInRequest,
    LookupInResponse, MutateInOp, MutateInRequest, MutateInResponse, MutationResponse,
    MutationToken, OpsCrud, ReplaceRequest, SetMetaRequest, SetRequest, SubDocResult,
    TouchRequest, TouchResponse, UnlockRequest, UnlockResponse,
};
pub use packet::{
    decode_request, decode_response, encode_request, DurabilityLevel, ExtFrameCode, Magic, OpCode,
    RequestFrame, RequestPacket, ResponsePacket, Status, SubDocOp, SubdocDocFlags, HEADER_SIZE,
};
pub use pool::{
    KvClientPool, KvClientPoolConfig, KvClientPoolOptions, ManagedClient, NewKvClientFn,
};

/// Custom result type for OpalKV operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Re-export of the `bytes` crate for convenience.
pub use bytes;
