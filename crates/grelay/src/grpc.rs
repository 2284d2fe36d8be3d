//! tonic bindings for both ends of a relayed call.
//!
//! Inbound calls arrive through [`RelayService`], a tonic
//! [`StreamingService`] over [`Frame`]s that runs the relay engine for each
//! call. Outbound calls are opened on a [`GrpcBackend`], a tonic [`Channel`]
//! driven with the pass-through codec.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use grelay_common::{Frame, RawCodec};
use http::uri::PathAndQuery;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::server::StreamingService;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::context::CallContext;
use crate::director::Director;
use crate::error::{RelayError, ServerError};
use crate::handler::Handler;
use crate::stream::{
    Backend, FrameSource, InboundSink, InboundStream, OutboundSink, OutboundSource,
    OutboundStream,
};

/// Messages buffered per direction unless configured otherwise.
pub const DEFAULT_BUFFER: usize = 64;

/// Entries owned by the HTTP/2 hop rather than the call. They are dropped
/// when metadata crosses the proxy and regenerated by the next hop.
const TRANSPORT_HEADERS: &[&str] = &[
    "te",
    "content-type",
    "user-agent",
    "grpc-timeout",
    "grpc-encoding",
    "grpc-accept-encoding",
];

fn without_transport_headers(mut metadata: MetadataMap) -> MetadataMap {
    for name in TRANSPORT_HEADERS {
        metadata.remove(*name);
    }
    metadata
}

type ResponseFuture = BoxFuture<'static, Result<Response<Streaming<Frame>>, Status>>;

/// Backend reached over a tonic [`Channel`].
#[derive(Clone, Debug)]
pub struct GrpcBackend {
    channel: Channel,
    buffer: usize,
}

impl GrpcBackend {
    /// Wraps an existing channel.
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            buffer: DEFAULT_BUFFER,
        }
    }

    /// Creates a backend for `url` that connects on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Endpoint`] if `url` is not a valid endpoint.
    pub fn connect_lazy(url: &str, connect_timeout: Duration) -> Result<Self, ServerError> {
        let channel = Endpoint::from_shared(url.to_owned())?
            .connect_timeout(connect_timeout)
            .connect_lazy();
        Ok(Self::new(channel))
    }

    /// Number of request messages buffered ahead of the backend.
    #[must_use]
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }
}

#[async_trait]
impl Backend for GrpcBackend {
    type Stream = GrpcOutbound;

    async fn open(&self, ctx: CallContext, method: &str) -> Result<GrpcOutbound, Status> {
        let path = PathAndQuery::try_from(method)
            .map_err(|e| Status::internal(format!("invalid method path {method:?}: {e}")))?;

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("backend not ready: {e}")))?;

        let (metadata, timeout, cancel) = ctx.into_parts();
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut request = Request::new(ReceiverStream::new(rx));
        *request.metadata_mut() = without_transport_headers(metadata);
        if let Some(timeout) = timeout {
            request.set_timeout(timeout);
        }

        // Polled lazily by the receive half so requests can flow before the
        // backend answers with its header.
        let response: ResponseFuture = Box::pin(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(Status::cancelled("outbound call cancelled")),
                response = grpc.streaming(request, path, RawCodec::<()>::new()) => response,
            }
        });

        Ok(GrpcOutbound {
            sink: GrpcOutboundSink { tx: Some(tx) },
            source: GrpcOutboundSource {
                state: SourceState::Pending(response),
                header: None,
                trailer: MetadataMap::new(),
            },
        })
    }
}

/// Outbound call opened on a [`GrpcBackend`].
pub struct GrpcOutbound {
    sink: GrpcOutboundSink,
    source: GrpcOutboundSource,
}

impl OutboundStream for GrpcOutbound {
    type Sink = GrpcOutboundSink;
    type Source = GrpcOutboundSource;

    fn into_split(self) -> (GrpcOutboundSink, GrpcOutboundSource) {
        (self.sink, self.source)
    }
}

/// Request half of a [`GrpcOutbound`].
pub struct GrpcOutboundSink {
    tx: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl OutboundSink for GrpcOutboundSink {
    async fn send(&mut self, frame: &Frame) -> Result<bool, Status> {
        match &self.tx {
            // The request body is dropped once the backend has finished the call.
            Some(tx) => Ok(tx.send(frame.clone()).await.is_ok()),
            None => Err(Status::internal("send on a half-closed outbound call")),
        }
    }

    async fn close_send(&mut self) -> Result<(), Status> {
        self.tx = None;
        Ok(())
    }
}

enum SourceState {
    Pending(ResponseFuture),
    Open(Streaming<Frame>),
    Done,
}

/// Response half of a [`GrpcOutbound`].
pub struct GrpcOutboundSource {
    state: SourceState,
    header: Option<MetadataMap>,
    trailer: MetadataMap,
}

#[async_trait]
impl FrameSource for GrpcOutboundSource {
    async fn recv(&mut self, frame: &mut Frame) -> Result<bool, Status> {
        loop {
            match &mut self.state {
                SourceState::Pending(response) => match response.await {
                    Ok(response) => {
                        let (metadata, streaming, _) = response.into_parts();
                        self.header = Some(without_transport_headers(metadata));
                        self.state = SourceState::Open(streaming);
                    }
                    Err(status) => {
                        self.state = SourceState::Done;
                        return Err(status);
                    }
                },
                SourceState::Open(streaming) => match streaming.message().await {
                    Ok(Some(next)) => {
                        *frame = next;
                        return Ok(true);
                    }
                    Ok(None) => {
                        let trailer = streaming.trailers().await;
                        self.state = SourceState::Done;
                        if let Some(trailer) = trailer? {
                            self.trailer = trailer;
                        }
                        return Ok(false);
                    }
                    Err(status) => {
                        self.state = SourceState::Done;
                        return Err(status);
                    }
                },
                SourceState::Done => return Ok(false),
            }
        }
    }
}

#[async_trait]
impl OutboundSource for GrpcOutboundSource {
    async fn header(&mut self) -> Result<MetadataMap, Status> {
        self.header
            .clone()
            .ok_or_else(|| Status::internal("backend response header not received yet"))
    }

    fn trailer(&self) -> MetadataMap {
        self.trailer.clone()
    }
}

/// Inbound call accepted by [`RelayService`].
pub struct GrpcInbound {
    method: String,
    context: CallContext,
    source: GrpcInboundSource,
    sink: GrpcInboundSink,
}

impl InboundStream for GrpcInbound {
    type Source = GrpcInboundSource;
    type Sink = GrpcInboundSink;

    fn method(&self) -> Option<&str> {
        Some(&self.method).filter(|m| !m.is_empty()).map(String::as_str)
    }

    fn context(&self) -> &CallContext {
        &self.context
    }

    fn into_split(self) -> (GrpcInboundSource, GrpcInboundSink) {
        (self.source, self.sink)
    }
}

/// Request half of a [`GrpcInbound`].
pub struct GrpcInboundSource(Streaming<Frame>);

#[async_trait]
impl FrameSource for GrpcInboundSource {
    async fn recv(&mut self, frame: &mut Frame) -> Result<bool, Status> {
        match self.0.message().await? {
            Some(next) => {
                *frame = next;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Response half of a [`GrpcInbound`].
///
/// The header is handed to the service future through a oneshot so tonic can
/// start the response; messages follow on the response stream and the
/// trailer is collected for the final status.
pub struct GrpcInboundSink {
    header: Option<oneshot::Sender<MetadataMap>>,
    tx: mpsc::Sender<Result<Frame, Status>>,
    trailer: Arc<Mutex<MetadataMap>>,
}

#[async_trait]
impl InboundSink for GrpcInboundSink {
    async fn send_header(&mut self, header: MetadataMap) -> Result<(), Status> {
        let sender = self
            .header
            .take()
            .ok_or_else(|| Status::internal("response header already sent"))?;
        sender
            .send(without_transport_headers(header))
            .map_err(|_| Status::cancelled("inbound call is gone"))
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), Status> {
        if let Some(sender) = self.header.take() {
            let _ = sender.send(MetadataMap::new());
        }
        self.tx
            .send(Ok(frame.clone()))
            .await
            .map_err(|_| Status::cancelled("inbound call is gone"))
    }

    fn set_trailer(&mut self, trailer: MetadataMap) {
        *self.trailer.lock().unwrap_or_else(PoisonError::into_inner) = trailer;
    }
}

/// tonic service relaying every call it receives for one method path.
pub struct RelayService<D> {
    handler: Handler<D>,
    method: String,
    buffer: usize,
}

impl<D: Director> RelayService<D> {
    /// Creates the service for a call to `method`.
    #[must_use]
    pub fn new(handler: Handler<D>, method: impl Into<String>, buffer: usize) -> Self {
        Self {
            handler,
            method: method.into(),
            buffer: buffer.max(1),
        }
    }
}

impl<D: Director> StreamingService<Frame> for RelayService<D> {
    type Response = Frame;
    type ResponseStream = ReceiverStream<Result<Frame, Status>>;
    type Future = BoxFuture<'static, Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let handler = self.handler.clone();
        let method = self.method.clone();
        let buffer = self.buffer;
        Box::pin(relay_call(handler, method, request, buffer))
    }
}

async fn relay_call<D: Director>(
    handler: Handler<D>,
    method: String,
    request: Request<Streaming<Frame>>,
    buffer: usize,
) -> Result<Response<ReceiverStream<Result<Frame, Status>>>, Status> {
    let (metadata, _, streaming) = request.into_parts();
    let context = CallContext::from_request(metadata);
    let cancel = context.cancellation().clone();
    // Cancels the relay if tonic drops this future before the call starts.
    let guard = cancel.clone().drop_guard();

    let (header_tx, header_rx) = oneshot::channel();
    let (tx, rx) = mpsc::channel(buffer);
    let trailer = Arc::new(Mutex::new(MetadataMap::new()));
    let inbound = GrpcInbound {
        method,
        context,
        source: GrpcInboundSource(streaming),
        sink: GrpcInboundSink {
            header: Some(header_tx),
            tx: tx.clone(),
            trailer: Arc::clone(&trailer),
        },
    };
    let mut relay = tokio::spawn(async move { handler.handle(inbound).await });

    let header = tokio::select! {
        biased;
        header = header_rx => header.ok(),
        joined = &mut relay => {
            return finish_before_header(joined, &trailer, tx, rx).await;
        }
    };

    match header {
        Some(header) => {
            tokio::spawn(async move {
                // The response stream is dropped when the caller goes away,
                // which may happen long after it stopped sending.
                let joined = tokio::select! {
                    joined = &mut relay => joined,
                    () = tx.closed() => {
                        debug!("caller left, cancelling the outbound call");
                        cancel.cancel();
                        relay.await
                    }
                };
                let status = closing_status(joined, take(&trailer));
                if tx.send(Err(status)).await.is_err() {
                    debug!("caller left before the call completed");
                }
                drop(guard);
            });
            let mut response = Response::new(ReceiverStream::new(rx));
            *response.metadata_mut() = header;
            Ok(response)
        }
        // The sink was dropped without a header: the relay is finishing.
        None => finish_before_header(relay.await, &trailer, tx, rx).await,
    }
}

/// Completes a call that ended before any response header was sent.
async fn finish_before_header(
    joined: Result<Result<(), RelayError>, JoinError>,
    trailer: &Mutex<MetadataMap>,
    tx: mpsc::Sender<Result<Frame, Status>>,
    rx: mpsc::Receiver<Result<Frame, Status>>,
) -> Result<Response<ReceiverStream<Result<Frame, Status>>>, Status> {
    let status = closing_status(joined, take(trailer));
    if status.code() != tonic::Code::Ok {
        return Err(status);
    }
    // A successful call with no messages still carries its trailer.
    tx.send(Err(status))
        .await
        .map_err(|_| Status::internal("response stream closed early"))?;
    Ok(Response::new(ReceiverStream::new(rx)))
}

fn take(trailer: &Mutex<MetadataMap>) -> MetadataMap {
    std::mem::take(&mut *trailer.lock().unwrap_or_else(PoisonError::into_inner))
}

/// Final status of an inbound call, with the backend trailer merged into its
/// metadata.
fn closing_status(
    joined: Result<Result<(), RelayError>, JoinError>,
    trailer: MetadataMap,
) -> Status {
    let mut status = match joined {
        Ok(Ok(())) => Status::ok(""),
        Ok(Err(err)) => Status::from(err),
        Err(err) => Status::internal(format!("relay task failed: {err}")),
    };
    if !trailer.is_empty() {
        let mut headers = status.metadata().clone().into_headers();
        headers.extend(trailer.into_headers());
        *status.metadata_mut() = MetadataMap::from_headers(headers);
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;
    use tonic::Code;

    #[test]
    fn transport_headers_are_stripped() {
        let mut metadata = MetadataMap::new();
        metadata.insert("te", MetadataValue::from_static("trailers"));
        metadata.insert("content-type", MetadataValue::from_static("application/grpc"));
        metadata.insert("grpc-timeout", MetadataValue::from_static("5S"));
        metadata.insert("grpc-accept-encoding", MetadataValue::from_static("gzip"));
        metadata.insert("x-test", MetadataValue::from_static("1"));
        metadata.insert("authorization", MetadataValue::from_static("Bearer t"));

        let cleaned = without_transport_headers(metadata);
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned.get("x-test").unwrap(), "1");
        assert_eq!(cleaned.get("authorization").unwrap(), "Bearer t");
    }

    #[test]
    fn successful_call_closes_with_ok_and_trailer() {
        let mut trailer = MetadataMap::new();
        trailer.insert("x-target-trailer", MetadataValue::from_static("1"));
        let status = closing_status(Ok(Ok(())), trailer);
        assert_eq!(status.code(), Code::Ok);
        assert_eq!(status.metadata().get("x-target-trailer").unwrap(), "1");
    }

    #[test]
    fn backend_status_keeps_its_metadata() {
        let mut backend_md = MetadataMap::new();
        backend_md.insert("x-backend-detail", MetadataValue::from_static("7"));
        let backend_status =
            Status::with_metadata(Code::Aborted, "conflict", backend_md);
        let status = closing_status(
            Ok(Err(RelayError::Outbound(backend_status))),
            MetadataMap::new(),
        );
        assert_eq!(status.code(), Code::Aborted);
        assert_eq!(status.message(), "conflict");
        assert_eq!(status.metadata().get("x-backend-detail").unwrap(), "7");
    }

    #[test]
    fn relay_failure_maps_to_its_status() {
        let status = closing_status(Ok(Err(RelayError::NoBackend)), MetadataMap::new());
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn inbound_sink_sends_empty_header_before_first_message() {
        let (header_tx, header_rx) = oneshot::channel();
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = GrpcInboundSink {
            header: Some(header_tx),
            tx,
            trailer: Arc::new(Mutex::new(MetadataMap::new())),
        };

        sink.send(&Frame::new("hello")).await.unwrap();
        assert!(header_rx.await.unwrap().is_empty());
        assert_eq!(rx.recv().await.unwrap().unwrap(), Frame::new("hello"));

        let err = sink.send_header(MetadataMap::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn inbound_sink_rejects_second_header() {
        let (header_tx, header_rx) = oneshot::channel();
        let (tx, _rx) = mpsc::channel(4);
        let mut sink = GrpcInboundSink {
            header: Some(header_tx),
            tx,
            trailer: Arc::new(Mutex::new(MetadataMap::new())),
        };

        let mut header = MetadataMap::new();
        header.insert("x-target-header", MetadataValue::from_static("1"));
        sink.send_header(header).await.unwrap();
        assert_eq!(header_rx.await.unwrap().get("x-target-header").unwrap(), "1");
        assert!(sink.send_header(MetadataMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn outbound_sink_reports_finished_backend() {
        let (tx, rx) = mpsc::channel(1);
        let mut sink = GrpcOutboundSink { tx: Some(tx) };
        drop(rx);
        assert!(!sink.send(&Frame::new("late")).await.unwrap());
    }

    #[tokio::test]
    async fn outbound_sink_refuses_send_after_close() {
        let (tx, _rx) = mpsc::channel(1);
        let mut sink = GrpcOutboundSink { tx: Some(tx) };
        sink.close_send().await.unwrap();
        assert!(sink.send(&Frame::new("late")).await.is_err());
    }

    #[tokio::test]
    async fn invalid_backend_url_is_rejected() {
        let err = GrpcBackend::connect_lazy("not a url", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ServerError::Endpoint(_)));
    }
}
