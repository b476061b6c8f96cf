//! Length-prefixed JSON framing for command and telemetry sockets.
//!
//! Decoding is split in two layers: a broken frame (truncated length prefix,
//! oversized frame, socket error) is an `io::Error` and ends the stream, while
//! a well-framed body that is not a valid message yields `Ok(Some(Err(_)))`
//! so the reader can log it, drop it and keep going.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::envelope::ProtocolError;

/// Largest frame accepted on any bus connection.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// The 4-byte big-endian length prefix framing shared by every bus socket.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// [`frame_codec`] framing with a JSON body of type `T`.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: frame_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = Result<T, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(ProtocolError::from),
            )),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item).map_err(io::Error::other)?;
        if body.len() > MAX_FRAME_LENGTH {
            // Refuse locally; the peer would drop the connection anyway.
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds {MAX_FRAME_LENGTH}", body.len()),
            ));
        }
        tracing::trace!(frame_bytes = body.len(), "Encoding frame");
        self.inner.encode(Bytes::from(body), dst)
    }
}
