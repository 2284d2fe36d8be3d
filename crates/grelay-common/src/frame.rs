//! Opaque message container relayed by the proxy.
//!
//! A [`Frame`] carries one wire-level gRPC message as uninterpreted bytes.
//! The transport has already removed the length-prefixed framing, so the
//! payload is exactly the serialized message the peer produced.

use bytes::Bytes;

/// One relayed message as an uninterpreted byte sequence.
///
/// A frame is created once per relay direction and reused for every message
/// in that direction. Every receive replaces the payload completely; no byte
/// of a previous message survives into the next one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    /// Creates a frame holding the given payload.
    ///
    /// # Examples
    ///
    /// ```
    /// use grelay_common::Frame;
    /// let frame = Frame::new("ping");
    /// assert_eq!(frame.payload().as_ref(), b"ping");
    /// ```
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Returns the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame and returns its payload.
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Replaces the payload, dropping whatever the frame held before.
    pub fn set_payload(&mut self, payload: Bytes) {
        self.payload = payload;
    }

    /// Resets the payload to the empty state.
    pub fn clear(&mut self) {
        self.payload = Bytes::new();
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns `true` if the frame holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<Bytes> for Frame {
    fn from(payload: Bytes) -> Self {
        Self { payload }
    }
}

impl From<Vec<u8>> for Frame {
    fn from(payload: Vec<u8>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// A message handed to a codec for encoding.
///
/// The relay path always uses [`MessageRef::Raw`]; [`MessageRef::Typed`] is
/// the path for callers that hold a concrete protobuf message.
#[derive(Debug)]
pub enum MessageRef<'a, M> {
    /// Opaque payload, passed through unmodified.
    Raw(&'a Frame),
    /// Typed protobuf message, encoded by the fallback codec.
    Typed(&'a M),
}

/// A decode target handed to a codec.
#[derive(Debug)]
pub enum MessageMut<'a, M> {
    /// Opaque payload container; receives the bytes as-is.
    Raw(&'a mut Frame),
    /// Typed protobuf message; decoded by the fallback codec.
    Typed(&'a mut M),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_frame_holds_payload() {
        let frame = Frame::new(&b"hello"[..]);
        assert_eq!(frame.payload().as_ref(), b"hello");
        assert_eq!(frame.len(), 5);
        assert!(!frame.is_empty());
    }

    #[test]
    fn default_frame_is_empty() {
        let frame = Frame::default();
        assert!(frame.is_empty());
        assert_eq!(frame.len(), 0);
    }

    #[test]
    fn set_payload_replaces_previous_content() {
        let mut frame = Frame::new(&b"a much longer first message"[..]);
        frame.set_payload(Bytes::from_static(b"short"));
        assert_eq!(frame.payload().as_ref(), b"short");
    }

    #[test]
    fn clear_drops_payload() {
        let mut frame = Frame::from(vec![1, 2, 3]);
        frame.clear();
        assert!(frame.is_empty());
    }

    #[test]
    fn into_payload_shares_buffer() {
        let bytes = Bytes::from_static(b"zero copy");
        let frame = Frame::from(bytes.clone());
        let out = frame.into_payload();
        assert_eq!(out.as_ptr(), bytes.as_ptr());
    }
}
