use crate::config::{parse_allow, parse_route, ProxyConfig};
use crate::director::{FixedDirector, RouteTable};
use crate::error::ServerError;
use crate::grpc::GrpcBackend;
use crate::registry::{transparent, Registrar};
use axum::Router;
use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tonic::transport::Channel;
use tracing::{info, warn};

/// How long in-flight calls may run after shutdown starts, unless configured.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Transparent proxy relaying every call to `channel`, forwarding all
/// inbound metadata.
pub fn new_proxy(channel: Channel) -> Router {
    transparent(FixedDirector::new(GrpcBackend::new(channel)))
}

/// Builds the proxy router described by `config`.
///
/// Backends connect lazily, so an unreachable backend fails individual calls
/// rather than startup. Routes naming the same URL share one channel.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or names a backend URL
/// that cannot be parsed.
pub fn build_router(config: &ProxyConfig) -> Result<Router, ServerError> {
    config.validate().map_err(ServerError::Config)?;
    let connect_timeout = Duration::from_secs(config.connect_timeout);

    let mut backends: HashMap<String, GrpcBackend> = HashMap::new();
    let mut backend_for = |url: &str| -> Result<GrpcBackend, ServerError> {
        if let Some(backend) = backends.get(url) {
            return Ok(backend.clone());
        }
        let backend = GrpcBackend::connect_lazy(url, connect_timeout)?.with_buffer(config.buffer);
        backends.insert(url.to_owned(), backend.clone());
        Ok(backend)
    };

    let mut table = RouteTable::new();
    if let Some(url) = config.backend.as_deref() {
        table = table.with_fallback(backend_for(url)?);
    }
    for entry in &config.routes {
        let (target, url) = parse_route(entry).map_err(ServerError::Config)?;
        table.insert(target, backend_for(url)?);
    }
    info!(
        "routing {} targets{}",
        table.len(),
        if config.backend.is_some() { " plus default backend" } else { "" }
    );

    let mut registrar = Registrar::new(table).buffer(config.buffer);
    if config.allow.is_empty() {
        return Ok(registrar.transparent());
    }
    for entry in &config.allow {
        let (service, method) = parse_allow(entry).map_err(ServerError::Config)?;
        registrar = registrar.service(service, [method])?;
    }
    info!("restricted mode: {} methods allowed", registrar.methods().count());
    Ok(registrar.restricted())
}

/// # Errors
///
/// Returns an error if serving fails with an I/O error.
pub async fn run(listener: TcpListener, router: Router) -> Result<(), ServerError> {
    run_with_shutdown(listener, router, std::future::pending(), DEFAULT_DRAIN_TIMEOUT).await
}

/// Serve the proxy until `shutdown` resolves.
///
/// Once it resolves the listener stops accepting connections and in-flight
/// calls get up to `drain_timeout` to finish before the server returns.
///
/// # Errors
///
/// Returns an error if serving fails with an I/O error.
pub async fn run_with_shutdown<F>(
    listener: TcpListener,
    router: Router,
    shutdown: F,
    drain_timeout: Duration,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    info!("proxy listening on {}", local_addr);

    let (draining_tx, draining_rx) = oneshot::channel::<()>();
    let signal = async move {
        shutdown.await;
        info!("shutdown signal received, draining in-flight calls");
        let _ = draining_tx.send(());
    };
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result?;
            info!("proxy shut down gracefully");
            return Ok(());
        }
        Ok(()) = draining_rx => {}
    }

    match tokio::time::timeout(drain_timeout, &mut server).await {
        Ok(result) => {
            result?;
            info!("proxy shut down gracefully");
        }
        Err(_) => warn!("drain timeout reached with calls still in flight"),
    }
    Ok(())
}
