//! grelay: transparent gRPC proxy.
//!
//! Calls are accepted for any method path, routed by a [`Director`] and
//! relayed to a backend as opaque frames, so the proxy needs no knowledge of
//! the services it fronts.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and proxy configuration.
pub mod config;
/// Per-call metadata, deadline and cancellation.
pub mod context;
/// Routing decisions and the built-in directors.
pub mod director;
/// Error types for relayed calls and server setup.
pub mod error;
/// tonic adapters for inbound and outbound calls.
pub mod grpc;
/// The relay engine.
pub mod handler;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Transparent and restricted registration with an axum router.
pub mod registry;
/// Router assembly and the serve loop.
pub mod server;
/// Transport-neutral stream endpoints driven by the engine.
pub mod stream;

pub use context::CallContext;
pub use director::{Direction, Director, FixedDirector, RouteTable};
pub use error::{RelayError, ServerError};
pub use grpc::GrpcBackend;
pub use handler::Handler;
pub use registry::{restricted, transparent, Registrar};
pub use server::{build_router, new_proxy, run, run_with_shutdown};
