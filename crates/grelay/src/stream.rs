//! Stream endpoints the relay engine drives.
//!
//! The engine never touches a transport directly. An inbound call is any
//! [`InboundStream`], an outbound call is whatever a [`Backend`] opens, and
//! each splits into an independently owned receive half and send half so the
//! two relay directions can run as separate tasks.

use async_trait::async_trait;
use grelay_common::Frame;
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::context::CallContext;

/// Receive half of a message stream.
#[async_trait]
pub trait FrameSource: Send {
    /// Receives the next message into `frame`, replacing its contents.
    ///
    /// Returns `Ok(false)` once the peer has cleanly finished sending.
    async fn recv(&mut self, frame: &mut Frame) -> Result<bool, Status>;
}

/// Send half of the server side of an inbound call.
#[async_trait]
pub trait InboundSink: Send {
    /// Sends the response header. Must precede the first [`send`](Self::send);
    /// a second call fails.
    async fn send_header(&mut self, header: MetadataMap) -> Result<(), Status>;

    /// Sends one response message to the caller.
    async fn send(&mut self, frame: &Frame) -> Result<(), Status>;

    /// Records the trailer delivered to the caller when the call completes.
    fn set_trailer(&mut self, trailer: MetadataMap);
}

/// The server side of a call accepted by the proxy.
pub trait InboundStream: Send + 'static {
    /// Receive half.
    type Source: FrameSource + 'static;
    /// Send half.
    type Sink: InboundSink + 'static;

    /// Full method name in `/package.Service/Method` form, if known.
    fn method(&self) -> Option<&str>;

    /// Context of the inbound call.
    fn context(&self) -> &CallContext;

    /// Splits the stream into its receive and send halves.
    fn into_split(self) -> (Self::Source, Self::Sink);
}

/// Send half of an outbound call.
#[async_trait]
pub trait OutboundSink: Send {
    /// Sends one request message to the backend.
    ///
    /// Returns `Ok(false)` if the backend has already finished the call; its
    /// final status is then reported by the receive half.
    async fn send(&mut self, frame: &Frame) -> Result<bool, Status>;

    /// Half-closes the call: no further request messages will follow.
    async fn close_send(&mut self) -> Result<(), Status>;
}

/// Receive half of an outbound call.
#[async_trait]
pub trait OutboundSource: FrameSource {
    /// Response header sent by the backend.
    ///
    /// Available once the first message has been received.
    async fn header(&mut self) -> Result<MetadataMap, Status>;

    /// Response trailer, populated once the stream has ended.
    fn trailer(&self) -> MetadataMap;
}

/// The client side of a call opened by the proxy.
pub trait OutboundStream: Send + 'static {
    /// Send half.
    type Sink: OutboundSink + 'static;
    /// Receive half.
    type Source: OutboundSource + 'static;

    /// Splits the stream into its send and receive halves.
    fn into_split(self) -> (Self::Sink, Self::Source);
}

/// Connection to a backend capable of opening outbound calls.
///
/// Handles are cheap to clone and shared between concurrent calls; opening a
/// call never mutates the handle.
#[async_trait]
pub trait Backend: Clone + Send + Sync + 'static {
    /// Stream type produced by [`open`](Self::open).
    type Stream: OutboundStream;

    /// Opens a bidirectional streaming call to `method`.
    ///
    /// The call carries the metadata and deadline of `ctx` and is torn down
    /// when its cancellation scope is cancelled.
    async fn open(&self, ctx: CallContext, method: &str) -> Result<Self::Stream, Status>;
}
