//! Pass-through codec with a typed protobuf fallback.
//!
//! - [`RawCodec`] hands [`Frame`] payloads to the transport untouched and
//!   delegates everything else to [`ProtoCodec`].
//! - [`ProtoCodec`] is a minimal protobuf marshal/unmarshal built on `prost`.
//!   It is never used on the relay path but keeps the codec layer usable for
//!   callers that hold concrete message types.
//!
//! `RawCodec` also implements [`tonic::codec::Codec`] with `Frame` as both the
//! encode and decode item, which is how the proxy plugs into tonic's server
//! and client machinery.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use grelay_common::{Frame, MessageMut, MessageRef, RawCodec};
//!
//! let codec = RawCodec::<()>::new();
//! let frame = Frame::new("ping");
//! let wire = codec.marshal(MessageRef::Raw(&frame)).unwrap();
//!
//! let mut received = Frame::default();
//! codec.unmarshal(wire, MessageMut::Raw(&mut received)).unwrap();
//! assert_eq!(received, frame);
//! ```

use std::fmt;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

use crate::frame::{Frame, MessageMut, MessageRef};
use crate::types::CODEC_NAME;

/// Errors produced by the typed fallback path.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The message could not be encoded into the output buffer.
    #[error("protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),
    /// The bytes are not a valid encoding of the target message type.
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl From<CodecError> for Status {
    fn from(err: CodecError) -> Self {
        Status::internal(err.to_string())
    }
}

/// Minimal protobuf codec for a concrete message type `M`.
pub struct ProtoCodec<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> ProtoCodec<M> {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }

    /// Codec identifier, identical to the standard protobuf codec name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        CODEC_NAME
    }
}

impl<M: Message + Default> ProtoCodec<M> {
    /// Encodes `message` into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the buffer cannot hold the message.
    pub fn marshal(&self, message: &M) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(message.encoded_len());
        message.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes `data` into `target`, discarding whatever `target` held.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if `data` is not a valid `M`.
    pub fn unmarshal(&self, data: &[u8], target: &mut M) -> Result<(), CodecError> {
        target.clear();
        target.merge(data)?;
        Ok(())
    }
}

impl<M> Default for ProtoCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for ProtoCodec<M> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for ProtoCodec<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtoCodec").finish()
    }
}

/// Codec that relays [`Frame`] payloads as opaque bytes.
///
/// `M` is the typed message used by the fallback path; the proxy itself uses
/// the default `()` since it never decodes a payload.
pub struct RawCodec<M = ()> {
    fallback: ProtoCodec<M>,
}

impl<M> RawCodec<M> {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fallback: ProtoCodec::new(),
        }
    }

    /// Codec identifier; always the fallback codec's name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.fallback.name()
    }
}

impl<M: Message + Default> RawCodec<M> {
    /// Encodes a message.
    ///
    /// Raw frames return their payload without copying; the caller must not
    /// expect later changes to the frame to reach an already-marshalled buffer.
    ///
    /// # Errors
    ///
    /// Only the typed path can fail, see [`ProtoCodec::marshal`].
    pub fn marshal(&self, value: MessageRef<'_, M>) -> Result<Bytes, CodecError> {
        match value {
            MessageRef::Raw(frame) => Ok(frame.payload().clone()),
            MessageRef::Typed(message) => self.fallback.marshal(message),
        }
    }

    /// Decodes `data` into `target`.
    ///
    /// A raw target always ends up holding exactly `data`; empty input resets
    /// it so a reused frame never carries bytes from an earlier message.
    ///
    /// # Errors
    ///
    /// Only the typed path can fail, see [`ProtoCodec::unmarshal`].
    pub fn unmarshal(&self, data: Bytes, target: MessageMut<'_, M>) -> Result<(), CodecError> {
        match target {
            MessageMut::Raw(frame) => {
                if data.is_empty() {
                    frame.clear();
                } else {
                    frame.set_payload(data);
                }
                Ok(())
            }
            MessageMut::Typed(message) => self.fallback.unmarshal(&data, message),
        }
    }
}

impl<M> Default for RawCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for RawCodec<M> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for RawCodec<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawCodec").finish()
    }
}

impl<M: Message + Default + 'static> Codec for RawCodec<M> {
    type Encode = Frame;
    type Decode = Frame;
    type Encoder = FrameEncoder<M>;
    type Decoder = FrameDecoder<M>;

    fn encoder(&mut self) -> Self::Encoder {
        FrameEncoder(self.clone())
    }

    fn decoder(&mut self) -> Self::Decoder {
        FrameDecoder(self.clone())
    }
}

/// tonic encoder half of [`RawCodec`].
#[derive(Debug)]
pub struct FrameEncoder<M>(RawCodec<M>);

impl<M: Message + Default> Encoder for FrameEncoder<M> {
    type Item = Frame;
    type Error = Status;

    fn encode(&mut self, item: Frame, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        let bytes = self.0.marshal(MessageRef::Raw(&item))?;
        dst.put(bytes);
        Ok(())
    }
}

/// tonic decoder half of [`RawCodec`].
#[derive(Debug)]
pub struct FrameDecoder<M>(RawCodec<M>);

impl<M: Message + Default> Decoder for FrameDecoder<M> {
    type Item = Frame;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Frame>, Self::Error> {
        let data = src.copy_to_bytes(src.remaining());
        let mut frame = Frame::default();
        self.0.unmarshal(data, MessageMut::Raw(&mut frame))?;
        Ok(Some(frame))
    }
}
