//! Per-call context: request metadata, deadline and cancellation.

use std::time::Duration;

use grelay_common::types::{GRPC_TIMEOUT_HEADER, GRPC_TIMEOUT_MAX_DIGITS};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;

/// Metadata, deadline and cancellation scope of one call.
///
/// Cloning a context deep-copies its metadata, so a clone can be edited
/// without affecting the original. The cancellation token is shared.
#[derive(Debug, Clone)]
pub struct CallContext {
    metadata: MetadataMap,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// Creates a context with no deadline and a fresh cancellation scope.
    #[must_use]
    pub fn new(metadata: MetadataMap) -> Self {
        Self {
            metadata,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a context for an inbound call, deriving the deadline from the
    /// `grpc-timeout` entry if one is present and well formed.
    #[must_use]
    pub fn from_request(metadata: MetadataMap) -> Self {
        let timeout = metadata
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_grpc_timeout);
        Self::new(metadata).with_timeout(timeout)
    }

    /// Sets the deadline to `timeout` from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    /// Replaces the cancellation scope.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Call metadata.
    #[must_use]
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// Mutable access to the call metadata.
    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    /// Absolute deadline, if the caller set one.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; zero once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Cancellation scope of the call.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Context for a call made on behalf of this one.
    ///
    /// Copies the metadata, keeps the deadline and nests the cancellation
    /// scope so cancelling this call also cancels the derived one.
    #[must_use]
    pub fn outgoing(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    /// Splits the context into its metadata, remaining time and scope.
    #[must_use]
    pub fn into_parts(self) -> (MetadataMap, Option<Duration>, CancellationToken) {
        let remaining = self.remaining();
        (self.metadata, remaining, self.cancel)
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new(MetadataMap::new())
    }
}

/// Parses a `grpc-timeout` value: up to eight ASCII digits followed by one
/// unit character (`H`, `M`, `S`, `m`, `u`, `n`).
#[must_use]
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if !value.is_ascii() {
        return None;
    }
    let split = value.len().checked_sub(1)?;
    let (digits, unit) = value.split_at(split);
    if digits.is_empty()
        || digits.len() > GRPC_TIMEOUT_MAX_DIGITS
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}
