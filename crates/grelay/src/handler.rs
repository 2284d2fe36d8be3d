//! Relay engine: connects one inbound call to one outbound call.
//!
//! For every call the engine asks the [`Director`] for a backend, opens a
//! bidirectional stream on it and runs two forwarding tasks:
//!
//! - inbound to outbound: caller messages go to the backend until the caller
//!   half-closes, at which point the backend is half-closed too;
//! - outbound to inbound: the backend's header is delivered before its first
//!   message, then every message is relayed until the backend finishes.
//!
//! The call ends when the outbound to inbound direction ends (the backend's
//! trailer and status are handed to the caller unchanged) or when the inbound
//! to outbound direction fails (the outbound call is cancelled). A clean
//! half-close from the caller never ends the call on its own.

use std::sync::Arc;
use std::time::Instant;

use grelay_common::Frame;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, warn};

use crate::director::Director;
use crate::error::RelayError;
use crate::metrics::{counters, gauges, histograms};
use crate::stream::{
    Backend, FrameSource, InboundSink, InboundStream, OutboundSink, OutboundSource,
    OutboundStream,
};

/// Direction label for caller to backend traffic.
pub const TO_BACKEND: &str = "to_backend";
/// Direction label for backend to caller traffic.
pub const TO_CALLER: &str = "to_caller";

/// Handles every call the proxy accepts by relaying it to a backend.
///
/// A single handler serves all calls concurrently; the only shared state is
/// the director.
pub struct Handler<D> {
    director: Arc<D>,
}

impl<D> Clone for Handler<D> {
    fn clone(&self) -> Self {
        Self {
            director: Arc::clone(&self.director),
        }
    }
}

impl<D: Director> Handler<D> {
    /// Creates a handler routing calls through `director`.
    #[must_use]
    pub fn new(director: D) -> Self {
        Self {
            director: Arc::new(director),
        }
    }

    /// The director consulted for every call.
    #[must_use]
    pub fn director(&self) -> &D {
        &self.director
    }

    /// Relays one inbound call to completion.
    ///
    /// # Errors
    ///
    /// Returns the reason the call failed. Converting the error into a
    /// [`Status`] gives what the caller should observe; backend statuses are
    /// carried through unchanged.
    pub async fn handle<S: InboundStream>(&self, inbound: S) -> Result<(), RelayError> {
        let method = inbound.method().map(str::to_owned);
        let started = Instant::now();
        gauges::inc_calls_active();

        let result = match method.as_deref() {
            Some(method) => self.relay(inbound, method).await,
            None => Err(RelayError::MissingMethod),
        };

        gauges::dec_calls_active();
        let elapsed = started.elapsed();
        histograms::call_duration_seconds(elapsed.as_secs_f64());
        let method = method.as_deref().unwrap_or_default();
        match &result {
            Ok(()) => {
                counters::calls_total("ok");
                debug!("relayed {} in {:?}", method, elapsed);
            }
            Err(e) => {
                counters::calls_total(e.outcome());
                debug!("call {} failed after {:?}: {}", method, elapsed, e);
            }
        }
        result
    }

    async fn relay<S: InboundStream>(&self, inbound: S, method: &str) -> Result<(), RelayError> {
        let context = inbound.context().clone();
        let direction = self
            .director
            .direct(&context, method)
            .await
            .map_err(RelayError::Routing)?;
        let backend = direction.backend.ok_or(RelayError::NoBackend)?;

        // Everything below is torn down when this call returns, however it returns.
        let scope = direction.context.cancellation().child_token();
        let _guard = scope.clone().drop_guard();
        let outgoing = direction.context.with_cancellation(scope.clone());

        let outbound = backend
            .open(outgoing, method)
            .await
            .map_err(RelayError::Open)?;

        let (inbound_source, inbound_sink) = inbound.into_split();
        let (outbound_sink, outbound_source) = outbound.into_split();

        let mut to_backend = tokio::spawn(forward_to_backend(
            inbound_source,
            outbound_sink,
            scope.clone(),
        ));
        let mut to_caller = tokio::spawn(forward_to_caller(
            outbound_source,
            inbound_sink,
            scope.clone(),
        ));

        let mut caller_done = false;
        for _ in 0..2 {
            tokio::select! {
                joined = &mut to_backend, if !caller_done => {
                    caller_done = true;
                    let (result, mut sink) = joined
                        .map_err(|_| RelayError::Invariant("inbound forwarding task failed"))?;
                    match result {
                        Ok(()) => {
                            // Caller is done sending; keep waiting for the backend to finish.
                            sink.close_send().await.map_err(RelayError::Outbound)?;
                        }
                        Err(status) => {
                            warn!("forwarding {} to backend failed: {}", method, status.message());
                            scope.cancel();
                            return Err(RelayError::Inbound(status));
                        }
                    }
                }
                joined = &mut to_caller => {
                    let (result, source, mut sink) = joined
                        .map_err(|_| RelayError::Invariant("outbound forwarding task failed"))?;
                    sink.set_trailer(source.trailer());
                    return result;
                }
            }
        }

        warn!("relay for {} left its forwarding loop without a result", method);
        Err(RelayError::Invariant(
            "gRPC proxying should never reach this stage",
        ))
    }
}

/// Forwards caller messages to the backend.
///
/// Ends with `Ok` when the caller half-closes or the backend stops accepting
/// messages because it already finished the call.
async fn forward_to_backend<R, W>(
    mut source: R,
    mut sink: W,
    scope: CancellationToken,
) -> (Result<(), Status>, W)
where
    R: FrameSource,
    W: OutboundSink,
{
    let mut frame = Frame::default();
    let result = loop {
        let received = tokio::select! {
            _ = scope.cancelled() => break Err(Status::cancelled("call cancelled")),
            received = source.recv(&mut frame) => received,
        };
        match received {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(status) => break Err(status),
        }

        let len = frame.len();
        let sent = tokio::select! {
            _ = scope.cancelled() => break Err(Status::cancelled("call cancelled")),
            sent = sink.send(&frame) => sent,
        };
        match sent {
            Ok(true) => {
                counters::messages_relayed_total(TO_BACKEND);
                counters::payload_bytes_total(TO_BACKEND, len as u64);
            }
            Ok(false) => break Ok(()),
            Err(status) => break Err(status),
        }
    };
    (result, sink)
}

/// Forwards backend messages to the caller, header first.
///
/// Ends with `Ok` when the backend finishes the call successfully; any other
/// end, including a backend error status, is returned as is.
async fn forward_to_caller<R, W>(
    mut source: R,
    mut sink: W,
    scope: CancellationToken,
) -> (Result<(), RelayError>, R, W)
where
    R: OutboundSource,
    W: InboundSink,
{
    let mut frame = Frame::default();
    let mut header_sent = false;
    let result = loop {
        let received = tokio::select! {
            _ = scope.cancelled() => {
                break Err(RelayError::Outbound(Status::cancelled("call cancelled")))
            }
            received = source.recv(&mut frame) => received,
        };
        match received {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(status) => break Err(RelayError::Outbound(status)),
        }

        if !header_sent {
            let header = match source.header().await {
                Ok(header) => header,
                Err(status) => break Err(RelayError::Header(status)),
            };
            if let Err(status) = sink.send_header(header).await {
                break Err(RelayError::Header(status));
            }
            header_sent = true;
        }

        if let Err(status) = sink.send(&frame).await {
            break Err(RelayError::Outbound(status));
        }
        counters::messages_relayed_total(TO_CALLER);
        counters::payload_bytes_total(TO_CALLER, frame.len() as u64);
    };
    (result, source, sink)
}
