//! Registering the relay with an HTTP/2 server.
//!
//! A [`Registrar`] turns a [`Director`] into an axum [`Router`] that serves
//! gRPC calls. In transparent mode every method path is relayed. In
//! restricted mode only whitelisted `/Service/Method` paths are, and any
//! other call is answered `Unimplemented` by the proxy itself, without
//! consulting the director. Call [`Registrar::service`] once per service to
//! expose several services from one server.

use std::collections::BTreeSet;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use grelay_common::RawCodec;
use tonic::Status;
use tracing::debug;

use crate::director::Director;
use crate::error::ServerError;
use crate::grpc::{RelayService, DEFAULT_BUFFER};
use crate::handler::Handler;

struct RelayState<D> {
    handler: Handler<D>,
    buffer: usize,
}

impl<D> Clone for RelayState<D> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            buffer: self.buffer,
        }
    }
}

/// Builds the routes that hand gRPC calls to the relay engine.
pub struct Registrar<D> {
    handler: Handler<D>,
    buffer: usize,
    methods: BTreeSet<String>,
}

impl<D: Director> Registrar<D> {
    /// Creates a registrar routing calls through `director`.
    #[must_use]
    pub fn new(director: D) -> Self {
        Self {
            handler: Handler::new(director),
            buffer: DEFAULT_BUFFER,
            methods: BTreeSet::new(),
        }
    }

    /// Number of response messages buffered per call.
    #[must_use]
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Whitelists `methods` of `service` for restricted mode.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidName`] if a name is empty or contains
    /// characters that cannot appear in a gRPC service or method name.
    pub fn service<I, M>(mut self, service: &str, methods: I) -> Result<Self, ServerError>
    where
        I: IntoIterator<Item = M>,
        M: AsRef<str>,
    {
        check_name(service, true)?;
        for method in methods {
            let method = method.as_ref();
            check_name(method, false)?;
            self.methods.insert(format!("/{service}/{method}"));
        }
        Ok(self)
    }

    /// Whitelisted method paths, in `/Service/Method` form.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(String::as_str)
    }

    /// Router relaying every call regardless of its method path.
    ///
    /// Any whitelist configured with [`service`](Self::service) is ignored.
    pub fn transparent(self) -> Router {
        let state = RelayState {
            handler: self.handler,
            buffer: self.buffer,
        };
        Router::new().fallback(relay::<D>).with_state(state)
    }

    /// Router relaying only the whitelisted methods.
    pub fn restricted(self) -> Router {
        let state = RelayState {
            handler: self.handler,
            buffer: self.buffer,
        };
        let mut router = Router::new();
        for path in &self.methods {
            router = router.route(path, any(relay::<D>));
        }
        router.fallback(unknown_method).with_state(state)
    }
}

/// Router relaying every call through `director`.
pub fn transparent<D: Director>(director: D) -> Router {
    Registrar::new(director).transparent()
}

/// Router relaying only `methods` of `service` through `director`.
///
/// # Errors
///
/// Returns [`ServerError::InvalidName`] for names that cannot form a route.
pub fn restricted<D, I, M>(director: D, service: &str, methods: I) -> Result<Router, ServerError>
where
    D: Director,
    I: IntoIterator<Item = M>,
    M: AsRef<str>,
{
    Ok(Registrar::new(director).service(service, methods)?.restricted())
}

async fn relay<D: Director>(State(state): State<RelayState<D>>, request: Request) -> impl IntoResponse {
    let method = request.uri().path().to_owned();
    let service = RelayService::new(state.handler, method, state.buffer);
    let mut grpc = tonic::server::Grpc::new(RawCodec::<()>::new());
    grpc.streaming(service, request).await
}

async fn unknown_method(request: Request) -> Response {
    let path = request.uri().path();
    debug!("rejecting call to unregistered method {}", path);
    let status = Status::unimplemented(format!("unknown method {path}"));

    // Trailers-only response: the status travels in the header block.
    status.into_http::<Body>()
}

/// Service names may be dotted; method names may not.
fn check_name(name: &str, dotted: bool) -> Result<(), ServerError> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || c == '_' || (dotted && c == '.');
    let well_formed = !name.is_empty()
        && name.chars().all(valid_char)
        && !name.starts_with('.')
        && !name.ends_with('.');
    if well_formed {
        Ok(())
    } else {
        Err(ServerError::InvalidName(name.to_owned()))
    }
}
