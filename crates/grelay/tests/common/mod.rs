#![allow(dead_code)]

use axum::body::Body;
use axum::extract::{Request as HttpRequest, State};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::any;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use grelay::config::ProxyConfig;
use grelay_common::{Frame, RawCodec};
use http::uri::PathAndQuery;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::server::StreamingService;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Response, Status, Streaming};

pub const PING: &str = "/acme.demo.v1.DemoService/Ping";
pub const ECHO: &str = "/acme.demo.v1.DemoService/Echo";
pub const FAIL: &str = "/acme.demo.v1.DemoService/Fail";
pub const NOPE: &str = "/acme.demo.v1.DemoService/Nope";
pub const MISSING: &str = "/acme.demo.v1.DemoService/Missing";
pub const WATCH: &str = "/acme.demo.v1.DemoService/Watch";

pub const BACKEND_UNKNOWN_METHOD: &str = "backend: unknown method";

/// Every call the test backend received: method path and request metadata.
pub type Seen = Arc<Mutex<Vec<(String, MetadataMap)>>>;

pub fn test_config(backend: SocketAddr) -> ProxyConfig {
    ProxyConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        metrics_addr: "127.0.0.1:1".parse().unwrap(),
        backend: Some(format!("http://{backend}")),
        routes: Vec::new(),
        allow: Vec::new(),
        connect_timeout: 5,
        buffer: 16,
        drain_timeout: 1,
    }
}

fn md(key: &'static str, value: &'static str) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    metadata.insert(key, MetadataValue::from_static(value));
    metadata
}

/// Backend that answers every message with `<payload>::ok`.
///
/// Sends `x-target-header: 1` as its header and `x-target-trailer: 1` as its
/// trailer. Calls to `Fail` are rejected before any message is read.
struct EchoService {
    method: String,
    seen: Seen,
}

impl StreamingService<Frame> for EchoService {
    type Response = Frame;
    type ResponseStream = ReceiverStream<Result<Frame, Status>>;
    type Future = BoxFuture<'static, Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let method = self.method.clone();
        let seen = Arc::clone(&self.seen);
        Box::pin(async move {
            let (metadata, _, mut inbound) = request.into_parts();
            seen.lock().unwrap().push((method.clone(), metadata));

            if method == FAIL {
                return Err(Status::with_metadata(
                    Code::FailedPrecondition,
                    "backend refused",
                    md("x-target-trailer", "1"),
                ));
            }

            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                while let Ok(Some(frame)) = inbound.message().await {
                    let mut reply = frame.payload().to_vec();
                    reply.extend_from_slice(b"::ok");
                    if tx.send(Ok(Frame::from(reply))).await.is_err() {
                        return;
                    }
                }
                let trailer = Status::with_metadata(Code::Ok, "", md("x-target-trailer", "1"));
                let _ = tx.send(Err(trailer)).await;
            });

            let mut response = Response::new(ReceiverStream::new(rx));
            response
                .metadata_mut()
                .insert("x-target-header", MetadataValue::from_static("1"));
            Ok(response)
        })
    }
}

async fn backend_call(State(seen): State<Seen>, request: HttpRequest) -> impl IntoResponse {
    let service = EchoService {
        method: request.uri().path().to_owned(),
        seen,
    };
    let mut grpc = tonic::server::Grpc::new(RawCodec::<()>::new());
    grpc.streaming(service, request).await
}

async fn backend_unknown_method() -> HttpResponse {
    Status::unimplemented(BACKEND_UNKNOWN_METHOD).into_http::<Body>()
}

/// Starts the echo backend. It serves `Ping`, `Echo` and `Fail`.
pub async fn start_backend() -> (SocketAddr, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: Seen = Arc::default();

    let app = axum::Router::new()
        .route(PING, any(backend_call))
        .route(ECHO, any(backend_call))
        .route(FAIL, any(backend_call))
        .fallback(backend_unknown_method)
        .with_state(Arc::clone(&seen));

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("backend error in test: {e}");
        }
    });

    (addr, seen)
}

/// Backend whose calls answer the first message once and then stay open
/// until the proxy tears them down.
struct WatchService {
    torn_down: Arc<Notify>,
}

impl StreamingService<Frame> for WatchService {
    type Response = Frame;
    type ResponseStream = ReceiverStream<Result<Frame, Status>>;
    type Future = BoxFuture<'static, Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let torn_down = Arc::clone(&self.torn_down);
        Box::pin(async move {
            let mut inbound = request.into_inner();
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                if let Ok(Some(frame)) = inbound.message().await {
                    let mut reply = frame.payload().to_vec();
                    reply.extend_from_slice(b"::ok");
                    let _ = tx.send(Ok(Frame::from(reply))).await;
                }
                tx.closed().await;
                torn_down.notify_one();
            });
            Ok(Response::new(ReceiverStream::new(rx)))
        })
    }
}

async fn watch_call(State(torn_down): State<Arc<Notify>>, request: HttpRequest) -> impl IntoResponse {
    let mut grpc = tonic::server::Grpc::new(RawCodec::<()>::new());
    grpc.streaming(WatchService { torn_down }, request).await
}

/// Starts a backend serving `Watch`. The returned notify fires once a call's
/// response stream has been dropped by the peer.
pub async fn start_watch_backend() -> (SocketAddr, Arc<Notify>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let torn_down = Arc::new(Notify::new());

    let app = axum::Router::new()
        .route(WATCH, any(watch_call))
        .fallback(backend_unknown_method)
        .with_state(Arc::clone(&torn_down));

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("watch backend error in test: {e}");
        }
    });

    (addr, torn_down)
}

/// Serves `router` as the proxy on an ephemeral port.
pub async fn start_proxy(router: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        if let Err(e) = grelay::run(listener, router).await {
            eprintln!("proxy error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    addr
}

/// Lazily connecting channel, as the proxy uses for its backends.
pub fn backend_channel(addr: SocketAddr) -> Channel {
    Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect_lazy()
}

pub async fn connect(addr: SocketAddr) -> Channel {
    Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

/// Everything a caller observed on one call.
#[derive(Debug)]
pub struct Outcome {
    pub header: MetadataMap,
    pub messages: Vec<Bytes>,
    pub trailer: MetadataMap,
}

/// Opens a streaming call fed by `requests`.
pub async fn open_call(
    channel: &Channel,
    method: &'static str,
    metadata: MetadataMap,
    requests: mpsc::Receiver<Frame>,
    timeout: Option<Duration>,
) -> Result<Response<Streaming<Frame>>, Status> {
    let mut grpc = tonic::client::Grpc::new(channel.clone());
    grpc.ready()
        .await
        .map_err(|e| Status::unavailable(e.to_string()))?;
    let mut request = Request::new(ReceiverStream::new(requests));
    *request.metadata_mut() = metadata;
    if let Some(timeout) = timeout {
        request.set_timeout(timeout);
    }
    grpc.streaming(request, PathAndQuery::from_static(method), RawCodec::<()>::new())
        .await
}

/// Sends `payloads`, half-closes, and collects the full response.
pub async fn call(
    channel: &Channel,
    method: &'static str,
    metadata: MetadataMap,
    payloads: &[&'static str],
) -> Result<Outcome, Status> {
    let (tx, rx) = mpsc::channel(payloads.len().max(1));
    for payload in payloads {
        tx.send(Frame::new(*payload)).await.unwrap();
    }
    drop(tx);

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        open_call(channel, method, metadata, rx, None),
    )
    .await
    .expect("timeout waiting for response header")?;
    collect(response).await
}

pub async fn collect(response: Response<Streaming<Frame>>) -> Result<Outcome, Status> {
    let (header, mut stream, _) = response.into_parts();
    let mut messages = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), stream.message())
            .await
            .expect("timeout waiting for message")?;
        match next {
            Some(frame) => messages.push(frame.into_payload()),
            None => break,
        }
    }
    let trailer = stream.trailers().await?.unwrap_or_default();
    Ok(Outcome {
        header,
        messages,
        trailer,
    })
}

pub fn metadata(pairs: &[(&'static str, &'static str)]) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    for (key, value) in pairs {
        metadata.insert(*key, MetadataValue::from_static(*value));
    }
    metadata
}
