// Copyright 2020 Joyent, Inc.

//! micro-rpc: request/response RPC over plain TCP streams
//!
//! A client turns a declared service record into callable stubs; each call
//! is serialized, framed, written on a pooled connection, and answered by
//! exactly one response frame on that same connection. A server keeps a
//! registry of named services and dispatches every incoming frame to the
//! method it names.
//!
//! Protocol definition
//!
//! Every message is one frame: a header followed by a body.
//!
//! * HEADER_LEN   4-byte big-endian unsigned integer, the length of the whole
//!              header in bytes, including this field
//!
//! * BODY_LEN     4-byte big-endian unsigned integer, the number of body bytes
//!              that follow the header
//!
//! * REQUEST_ID   4-byte big-endian unsigned integer chosen by the client; the
//!              response carries the same value
//!
//! * VERSION      1-byte integer.  The only supported value is "1".
//!
//! * COMPRESSION  1-byte integer.  The only supported value is NONE (0x0).
//!
//! * SERIALIZATION 1-byte integer.  The only supported value is JSON (0x1).
//!
//! * Requests then carry SERVICE_LEN (4 bytes) and the service name,
//!   followed by METHOD_LEN (4 bytes) and the method name.
//!
//! * Responses instead carry ERROR_LEN (4 bytes) and the error text, which
//!   is empty when the call succeeded.
//!
//! * BODY         the serialized argument (request) or result (response).
//!              Its content is never inspected by the framing layer.
//!
//! Request ids are scoped to a client and allocated sequentially from a
//! circular 31-bit space. A connection carries one call at a time.

#![allow(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod service;
pub mod stub;

pub use crate::client::{Client, Invoker};
pub use crate::error::{Error, RemoteError, Result};
pub use crate::server::Server;
pub use crate::service::{RequestContext, ServiceDescriptor};
pub use crate::stub::{CallContext, RemoteMethod, ServiceStub, Stub};
