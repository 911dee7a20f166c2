// Copyright 2020 Joyent, Inc.

//! Error types shared by the client, server and codec.

use std::fmt;
use std::io;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::protocol::FrameError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out {0}")]
    Timeout(&'static str),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("connection pool closed")]
    PoolClosed,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("response id {actual} does not answer request id {expected}")]
    ResponseMismatch { expected: u32, actual: u32 },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no address available for service {0}")]
    NoAddress(String),

    #[error("invalid stub: {0}")]
    InvalidStub(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Remote(RemoteError),
}

impl Error {
    /// Whether a connection that observed this error can no longer be
    /// trusted to be positioned on a frame boundary.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::Timeout(_)
            | Error::ConnectionClosed
            | Error::Frame(_)
            | Error::ResponseMismatch { .. } => true,
            _ => false,
        }
    }

    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Error::Remote(e) => Some(e),
            _ => None,
        }
    }
}

/// A failure reported by the peer in a well-formed response: a business
/// error raised by the invoked method, or a dispatch error such as an
/// unknown service or method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
    /// Result payload the server sent alongside the error, usually empty.
    pub body: Bytes,
}

impl RemoteError {
    pub fn new<S: Into<String>>(message: S, body: Bytes) -> RemoteError {
        RemoteError {
            message: message.into(),
            body,
        }
    }

    /// Best-effort result value: the decoded payload if the server sent
    /// one, otherwise the type's default.
    pub fn partial_result<R>(&self) -> R
    where
        R: DeserializeOwned + Default,
    {
        if self.body.is_empty() {
            return R::default();
        }
        serde_json::from_slice(&self.body).unwrap_or_default()
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteError {}
