//! Routing decisions: which backend serves a call, and with what context.

use async_trait::async_trait;
use dashmap::DashMap;
use tonic::Status;

use crate::context::CallContext;
use crate::stream::Backend;

/// Outcome of a routing decision.
#[derive(Debug, Clone)]
pub struct Direction<B> {
    /// Context the outbound call is opened with.
    pub context: CallContext,
    /// Backend to open the call on. `None` fails the call as unavailable.
    pub backend: Option<B>,
}

impl<B> Direction<B> {
    /// Routes the call to `backend` with the given outbound context.
    #[must_use]
    pub fn to(context: CallContext, backend: B) -> Self {
        Self {
            context,
            backend: Some(backend),
        }
    }
}

/// Decides where each inbound call goes.
///
/// Invoked once per call, possibly from many calls at once. The director
/// receives the inbound context and the full method name and either picks a
/// backend or rejects the call with a status that is passed to the caller
/// unchanged.
///
/// The returned context must carry a copy of any inbound metadata that should
/// reach the backend; nothing is forwarded implicitly. Its cancellation scope
/// should be derived from the inbound one, as [`CallContext::outgoing`] does.
#[async_trait]
pub trait Director: Send + Sync + 'static {
    /// Backend type this director hands out.
    type Backend: Backend;

    /// Picks the backend for a call to `method`.
    async fn direct(
        &self,
        ctx: &CallContext,
        method: &str,
    ) -> Result<Direction<Self::Backend>, Status>;
}

/// Sends every call to one backend, forwarding all inbound metadata.
#[derive(Debug, Clone)]
pub struct FixedDirector<B> {
    backend: B,
}

impl<B> FixedDirector<B> {
    /// Creates a director that always picks `backend`.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: Backend> Director for FixedDirector<B> {
    type Backend = B;

    async fn direct(&self, ctx: &CallContext, _method: &str) -> Result<Direction<B>, Status> {
        Ok(Direction::to(ctx.outgoing(), self.backend.clone()))
    }
}

/// Concurrent routing table keyed by full method or service name.
///
/// A key is either a full method (`/pkg.Service/Method`) or a service name
/// (`pkg.Service`). An exact method entry wins over its service entry; calls
/// matching neither go to the fallback backend if one is set and are
/// rejected as unimplemented otherwise. Inbound metadata is always forwarded.
#[derive(Debug)]
pub struct RouteTable<B> {
    routes: DashMap<String, B>,
    fallback: Option<B>,
}

impl<B: Clone> RouteTable<B> {
    /// Create an empty table with no fallback.
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            fallback: None,
        }
    }

    /// Use `backend` for calls no entry matches.
    #[must_use]
    pub fn with_fallback(mut self, backend: B) -> Self {
        self.fallback = Some(backend);
        self
    }

    /// Insert a route, returning the backend previously stored under `target`.
    pub fn insert(&self, target: impl Into<String>, backend: B) -> Option<B> {
        self.routes.insert(target.into(), backend)
    }

    /// Remove a route.
    pub fn remove(&self, target: &str) -> Option<B> {
        self.routes.remove(target).map(|(_, backend)| backend)
    }

    /// Resolve the backend for a full method name.
    #[must_use]
    pub fn get(&self, method: &str) -> Option<B> {
        if let Some(entry) = self.routes.get(method) {
            return Some(entry.value().clone());
        }
        service_of(method)
            .and_then(|service| self.routes.get(service))
            .map(|entry| entry.value().clone())
            .or_else(|| self.fallback.clone())
    }

    /// Number of routes, not counting the fallback.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if the table holds no routes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<B: Clone> Default for RouteTable<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<B: Backend> Director for RouteTable<B> {
    type Backend = B;

    async fn direct(&self, ctx: &CallContext, method: &str) -> Result<Direction<B>, Status> {
        match self.get(method) {
            Some(backend) => Ok(Direction::to(ctx.outgoing(), backend)),
            None => {
                tracing::debug!("no route for {}", method);
                Err(Status::unimplemented(format!("no route for method {method}")))
            }
        }
    }
}

/// Service part of a `/package.Service/Method` name.
pub(crate) fn service_of(method: &str) -> Option<&str> {
    method
        .strip_prefix('/')
        .and_then(|rest| rest.rsplit_once('/'))
        .map(|(service, _)| service)
        .filter(|service| !service.is_empty())
}
