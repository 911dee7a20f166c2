// Copyright 2020 Joyent, Inc.

//! Wire codec and frame readers.
//!
//! Every frame is a header followed by an opaque body. The header opens
//! with its own length and the body length so a reader always knows how
//! many bytes belong to the current frame before looking at them.
//!
//! Request header:
//!
//! ```text
//! [header_len:4][body_len:4][request_id:4][version:1][compression:1]
//! [serialization:1][service_len:4][service][method_len:4][method]
//! ```
//!
//! Response header:
//!
//! ```text
//! [header_len:4][body_len:4][request_id:4][version:1][compression:1]
//! [serialization:1][error_len:4][error]
//! ```
//!
//! All integers are big-endian. `header_len` counts every header byte,
//! including the two length fields.

use std::marker::PhantomData;
use std::str;
use std::sync::atomic::{AtomicU32, Ordering};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use num::{FromPrimitive, ToPrimitive};
use num_derive::{FromPrimitive, ToPrimitive};
use serde_derive::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

const OFF_HEADER_LEN: usize = 0x0;
const OFF_BODY_LEN: usize = 0x4;
const OFF_REQUEST_ID: usize = 0x8;
const OFF_VERSION: usize = 0xc;
const OFF_COMPRESSION: usize = 0xd;
const OFF_SERIALIZATION: usize = 0xe;
const OFF_VARIABLE: usize = 0xf;

const LENGTHS_SZ: usize = OFF_REQUEST_ID;
const FIELD_LEN_SZ: usize = 4;

pub const FIXED_HEADER_SZ: usize = OFF_VARIABLE;

pub const VERSION_1: u8 = 0x1;
pub const VERSION_CURRENT: u8 = VERSION_1;

pub const DEFAULT_MAX_HEADER_LEN: u32 = 64 * 1024;
pub const DEFAULT_MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

/*
 * Request ids are scoped to a client and allocated sequentially from a
 * circular 31-bit space. Zero is never handed out.
 */
const REQUEST_ID_MAX: u32 = i32::max_value() as u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Compression {
    None = 0,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Serialization {
    Json = 1,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("header length {len} is below the minimum of {min}")]
    HeaderTooShort { len: usize, min: usize },

    #[error("header length {len} exceeds the limit of {max}")]
    HeaderTooLong { len: usize, max: usize },

    #[error("body length {len} exceeds the limit of {max}")]
    BodyTooLong { len: usize, max: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown compression id {0}")]
    UnknownCompression(u8),

    #[error("unknown serialization id {0}")]
    UnknownSerialization(u8),

    #[error("{0} length runs past the end of the header")]
    FieldOverrun(&'static str),

    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("header declares {declared} bytes but its fields occupy {actual}")]
    HeaderMismatch { declared: usize, actual: usize },

    #[error("stamped {field} {stamped} does not match computed {actual}")]
    StampMismatch {
        field: &'static str,
        stamped: u32,
        actual: usize,
    },
}

/// Upper bounds applied to declared lengths before any bytes are read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FrameLimits {
    pub max_header_len: u32,
    pub max_body_len: u32,
}

impl Default for FrameLimits {
    fn default() -> FrameLimits {
        FrameLimits {
            max_header_len: DEFAULT_MAX_HEADER_LEN,
            max_body_len: DEFAULT_MAX_BODY_LEN,
        }
    }
}

impl FrameLimits {
    /// Validate the two leading length fields of a frame of kind `M`,
    /// returning the header and body lengths in bytes.
    fn check<M: Message>(&self, lengths: &[u8]) -> std::result::Result<(usize, usize), FrameError> {
        let header_len =
            BigEndian::read_u32(&lengths[OFF_HEADER_LEN..OFF_HEADER_LEN + 4]) as usize;
        let body_len = BigEndian::read_u32(&lengths[OFF_BODY_LEN..OFF_BODY_LEN + 4]) as usize;

        if header_len < M::MIN_HEADER_LEN {
            return Err(FrameError::HeaderTooShort {
                len: header_len,
                min: M::MIN_HEADER_LEN,
            });
        }
        self.check_lengths(header_len, body_len)?;
        Ok((header_len, body_len))
    }

    fn check_lengths(&self, header_len: usize, body_len: usize) -> std::result::Result<(), FrameError> {
        if header_len > self.max_header_len as usize {
            return Err(FrameError::HeaderTooLong {
                len: header_len,
                max: self.max_header_len as usize,
            });
        }
        if body_len > self.max_body_len as usize {
            return Err(FrameError::BodyTooLong {
                len: body_len,
                max: self.max_body_len as usize,
            });
        }
        Ok(())
    }

    /// Check an outbound message against these limits before it is written,
    /// so that a peer applying the same limits will accept it.
    pub fn permits<M: Message>(&self, msg: &M) -> std::result::Result<(), FrameError> {
        self.check_lengths(msg.computed_header_len(), msg.body().len())
    }
}

/// One complete frame, split at the header/body boundary but not yet
/// interpreted beyond its lengths.
#[derive(Clone, Debug)]
pub struct RawFrame {
    header: Bytes,
    body: Bytes,
}

impl RawFrame {
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn request_id(&self) -> u32 {
        BigEndian::read_u32(&self.header[OFF_REQUEST_ID..OFF_REQUEST_ID + 4])
    }

    pub fn version(&self) -> u8 {
        self.header[OFF_VERSION]
    }

    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Behaviour common to requests and responses.
pub trait Message: Sized {
    /// Smallest valid header for this kind of message.
    const MIN_HEADER_LEN: usize;

    fn header_len(&self) -> u32;
    fn body_len(&self) -> u32;
    fn body(&self) -> &Bytes;

    /// Header length implied by the message's current fields.
    fn computed_header_len(&self) -> usize;

    fn write_variable(&self, buf: &mut BytesMut);
    fn fixed(&self) -> FixedHeader;
    fn check_fields(&self) -> std::result::Result<(), FrameError>;

    fn from_frame(frame: RawFrame) -> std::result::Result<Self, FrameError>;

    /// Serialize into `buf`. The stamped lengths must agree with the
    /// fields; nothing is written otherwise.
    fn encode(&self, buf: &mut BytesMut) -> std::result::Result<(), FrameError> {
        self.check_fields()?;
        check_stamp("header length", self.header_len(), self.computed_header_len())?;
        check_stamp("body length", self.body_len(), self.body().len())?;

        let fixed = self.fixed();
        buf.reserve(self.header_len() as usize + self.body().len());
        buf.put_u32(self.header_len());
        buf.put_u32(self.body_len());
        buf.put_u32(fixed.request_id);
        buf.put_u8(fixed.version);
        buf.put_u8(ToPrimitive::to_u8(&fixed.compression).unwrap_or_default());
        buf.put_u8(ToPrimitive::to_u8(&fixed.serialization).unwrap_or_default());
        self.write_variable(buf);
        buf.put_slice(self.body());
        Ok(())
    }
}

/// The fields every frame carries at fixed offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedHeader {
    pub request_id: u32,
    pub version: u8,
    pub compression: Compression,
    pub serialization: Serialization,
}

impl FixedHeader {
    fn parse(header: &[u8]) -> std::result::Result<FixedHeader, FrameError> {
        let version = header[OFF_VERSION];
        if version != VERSION_CURRENT {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let compression: Compression = FromPrimitive::from_u8(header[OFF_COMPRESSION])
            .ok_or(FrameError::UnknownCompression(header[OFF_COMPRESSION]))?;
        let serialization: Serialization = FromPrimitive::from_u8(header[OFF_SERIALIZATION])
            .ok_or(FrameError::UnknownSerialization(header[OFF_SERIALIZATION]))?;

        Ok(FixedHeader {
            request_id: BigEndian::read_u32(&header[OFF_REQUEST_ID..OFF_REQUEST_ID + 4]),
            version,
            compression,
            serialization,
        })
    }
}

fn check_stamp(field: &'static str, stamped: u32, actual: usize) -> std::result::Result<(), FrameError> {
    if stamped as usize != actual {
        Err(FrameError::StampMismatch {
            field,
            stamped,
            actual,
        })
    } else {
        Ok(())
    }
}

fn put_field(buf: &mut BytesMut, field: &[u8]) {
    buf.put_u32(field.len() as u32);
    buf.put_slice(field);
}

/// Read one length-prefixed field starting at `*offset`, advancing it.
fn take_field<'a>(
    header: &'a [u8],
    offset: &mut usize,
    what: &'static str,
) -> std::result::Result<&'a [u8], FrameError> {
    if header.len() < *offset + FIELD_LEN_SZ {
        return Err(FrameError::FieldOverrun(what));
    }
    let len = BigEndian::read_u32(&header[*offset..*offset + FIELD_LEN_SZ]) as usize;
    let start = *offset + FIELD_LEN_SZ;
    if header.len() - start < len {
        return Err(FrameError::FieldOverrun(what));
    }
    *offset = start + len;
    Ok(&header[start..start + len])
}

fn take_name(
    header: &[u8],
    offset: &mut usize,
    what: &'static str,
) -> std::result::Result<String, FrameError> {
    let raw = take_field(header, offset, what)?;
    if raw.is_empty() {
        return Err(FrameError::EmptyField(what));
    }
    str::from_utf8(raw)
        .map(String::from)
        .map_err(|_| FrameError::InvalidUtf8(what))
}

fn check_consumed(header: &[u8], offset: usize) -> std::result::Result<(), FrameError> {
    if offset != header.len() {
        Err(FrameError::HeaderMismatch {
            declared: header.len(),
            actual: offset,
        })
    } else {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallRequest {
    pub header_len: u32,
    pub body_len: u32,
    pub request_id: u32,
    pub version: u8,
    pub compression: Compression,
    pub serialization: Serialization,
    pub service: String,
    pub method: String,
    pub body: Bytes,
}

impl CallRequest {
    /// Build a request with its lengths already stamped.
    pub fn new<S, M>(request_id: u32, service: S, method: M, body: Bytes) -> CallRequest
    where
        S: Into<String>,
        M: Into<String>,
    {
        let mut req = CallRequest {
            header_len: 0,
            body_len: 0,
            request_id,
            version: VERSION_CURRENT,
            compression: Compression::None,
            serialization: Serialization::Json,
            service: service.into(),
            method: method.into(),
            body,
        };
        req.calculate_header_len();
        req.calculate_body_len();
        req
    }

    pub fn calculate_header_len(&mut self) {
        self.header_len = self.computed_header_len() as u32;
    }

    pub fn calculate_body_len(&mut self) {
        self.body_len = self.body.len() as u32;
    }
}

impl Message for CallRequest {
    const MIN_HEADER_LEN: usize = FIXED_HEADER_SZ + 2 * FIELD_LEN_SZ;

    fn header_len(&self) -> u32 {
        self.header_len
    }

    fn body_len(&self) -> u32 {
        self.body_len
    }

    fn body(&self) -> &Bytes {
        &self.body
    }

    fn computed_header_len(&self) -> usize {
        Self::MIN_HEADER_LEN + self.service.len() + self.method.len()
    }

    fn write_variable(&self, buf: &mut BytesMut) {
        put_field(buf, self.service.as_bytes());
        put_field(buf, self.method.as_bytes());
    }

    fn fixed(&self) -> FixedHeader {
        FixedHeader {
            request_id: self.request_id,
            version: self.version,
            compression: self.compression,
            serialization: self.serialization,
        }
    }

    fn check_fields(&self) -> std::result::Result<(), FrameError> {
        if self.service.is_empty() {
            return Err(FrameError::EmptyField("service name"));
        }
        if self.method.is_empty() {
            return Err(FrameError::EmptyField("method name"));
        }
        Ok(())
    }

    fn from_frame(frame: RawFrame) -> std::result::Result<CallRequest, FrameError> {
        let header = frame.header();
        let fixed = FixedHeader::parse(header)?;
        let mut offset = OFF_VARIABLE;
        let service = take_name(header, &mut offset, "service name")?;
        let method = take_name(header, &mut offset, "method name")?;
        check_consumed(header, offset)?;

        Ok(CallRequest {
            header_len: header.len() as u32,
            body_len: frame.body.len() as u32,
            request_id: fixed.request_id,
            version: fixed.version,
            compression: fixed.compression,
            serialization: fixed.serialization,
            service,
            method,
            body: frame.body,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallResponse {
    pub header_len: u32,
    pub body_len: u32,
    pub request_id: u32,
    pub version: u8,
    pub compression: Compression,
    pub serialization: Serialization,
    /// Empty when the call succeeded.
    pub error: Bytes,
    pub body: Bytes,
}

impl CallResponse {
    /// An unstamped response answering `req`, with no error and no body.
    pub fn answering(req: &CallRequest) -> CallResponse {
        CallResponse::with_fixed(FixedHeader {
            request_id: req.request_id,
            version: req.version,
            compression: req.compression,
            serialization: req.serialization,
        })
    }

    /// An unstamped response to a frame that could not be decoded as a
    /// request. Only the request id is trusted.
    pub fn answering_frame(frame: &RawFrame) -> CallResponse {
        CallResponse::with_fixed(FixedHeader {
            request_id: frame.request_id(),
            version: VERSION_CURRENT,
            compression: Compression::None,
            serialization: Serialization::Json,
        })
    }

    fn with_fixed(fixed: FixedHeader) -> CallResponse {
        CallResponse {
            header_len: 0,
            body_len: 0,
            request_id: fixed.request_id,
            version: fixed.version,
            compression: fixed.compression,
            serialization: fixed.serialization,
            error: Bytes::new(),
            body: Bytes::new(),
        }
    }

    pub fn calculate_header_len(&mut self) {
        self.header_len = self.computed_header_len() as u32;
    }

    pub fn calculate_body_len(&mut self) {
        self.body_len = self.body.len() as u32;
    }

    pub fn stamp_lengths(&mut self) {
        self.calculate_header_len();
        self.calculate_body_len();
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn set_error<S: AsRef<str>>(&mut self, msg: S) {
        self.error = Bytes::copy_from_slice(msg.as_ref().as_bytes());
    }
}

impl Message for CallResponse {
    const MIN_HEADER_LEN: usize = FIXED_HEADER_SZ + FIELD_LEN_SZ;

    fn header_len(&self) -> u32 {
        self.header_len
    }

    fn body_len(&self) -> u32 {
        self.body_len
    }

    fn body(&self) -> &Bytes {
        &self.body
    }

    fn computed_header_len(&self) -> usize {
        Self::MIN_HEADER_LEN + self.error.len()
    }

    fn write_variable(&self, buf: &mut BytesMut) {
        put_field(buf, &self.error);
    }

    fn fixed(&self) -> FixedHeader {
        FixedHeader {
            request_id: self.request_id,
            version: self.version,
            compression: self.compression,
            serialization: self.serialization,
        }
    }

    fn check_fields(&self) -> std::result::Result<(), FrameError> {
        Ok(())
    }

    fn from_frame(frame: RawFrame) -> std::result::Result<CallResponse, FrameError> {
        let header = frame.header();
        let fixed = FixedHeader::parse(header)?;
        let mut offset = OFF_VARIABLE;
        let error = Bytes::copy_from_slice(take_field(header, &mut offset, "error")?);
        check_consumed(header, offset)?;

        Ok(CallResponse {
            header_len: header.len() as u32,
            body_len: frame.body.len() as u32,
            request_id: fixed.request_id,
            version: fixed.version,
            compression: fixed.compression,
            serialization: fixed.serialization,
            error,
            body: frame.body,
        })
    }
}

/// Read exactly one frame of kind `M` from `reader`.
///
/// Uses exact-length reads only, so bytes belonging to a following frame
/// are never consumed.
pub async fn read_frame<M, R>(reader: &mut R, limits: &FrameLimits) -> Result<RawFrame>
where
    M: Message,
    R: AsyncRead + Unpin,
{
    let mut lengths = [0u8; LENGTHS_SZ];
    reader.read_exact(&mut lengths).await?;
    let (header_len, body_len) = limits.check::<M>(&lengths)?;

    let mut header = BytesMut::with_capacity(header_len);
    header.extend_from_slice(&lengths);
    header.resize(header_len, 0);
    reader.read_exact(&mut header[LENGTHS_SZ..]).await?;

    let mut body = BytesMut::with_capacity(body_len);
    body.resize(body_len, 0);
    reader.read_exact(&mut body[..]).await?;

    Ok(RawFrame {
        header: header.freeze(),
        body: body.freeze(),
    })
}

/// Codec splitting a byte stream into frames of kind `M` and encoding any
/// outbound message.
pub struct FrameCodec<M> {
    limits: FrameLimits,
    _inbound: PhantomData<fn() -> M>,
}

impl<M> FrameCodec<M> {
    pub fn new(limits: FrameLimits) -> FrameCodec<M> {
        FrameCodec {
            limits,
            _inbound: PhantomData,
        }
    }
}

impl<M> Default for FrameCodec<M> {
    fn default() -> FrameCodec<M> {
        FrameCodec::new(FrameLimits::default())
    }
}

impl<M: Message> Decoder for FrameCodec<M> {
    type Item = RawFrame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawFrame>> {
        if buf.len() < LENGTHS_SZ {
            return Ok(None);
        }

        let (header_len, body_len) = self.limits.check::<M>(&buf[..LENGTHS_SZ])?;
        let frame_len = header_len + body_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let mut header = buf.split_to(frame_len);
        let body = header.split_off(header_len).freeze();
        Ok(Some(RawFrame {
            header: header.freeze(),
            body,
        }))
    }
}

impl<M, T: Message> Encoder<T> for FrameCodec<M> {
    type Error = Error;

    fn encode(&mut self, item: T, buf: &mut BytesMut) -> Result<()> {
        item.encode(buf).map_err(Error::from)
    }
}

/// Allocator for request ids, one per client.
#[derive(Debug)]
pub struct RequestIdGen {
    next: AtomicU32,
}

impl RequestIdGen {
    pub fn new() -> RequestIdGen {
        RequestIdGen {
            next: AtomicU32::new(0),
        }
    }

    pub fn next_id(&self) -> u32 {
        let step = |id: u32| if id >= REQUEST_ID_MAX { 1 } else { id + 1 };
        match self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| Some(step(id)))
        {
            Ok(prev) | Err(prev) => step(prev),
        }
    }
}

impl Default for RequestIdGen {
    fn default() -> RequestIdGen {
        RequestIdGen::new()
    }
}
