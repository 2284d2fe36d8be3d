//! Protocol constants shared by the proxy and its tests.

/// Codec identifier reported by both the pass-through and the fallback codec.
///
/// Peers negotiating the standard protobuf codec by name must resolve to the
/// same identifier whether or not the proxy is in the path.
pub const CODEC_NAME: &str = "proto";

/// Request header carrying the caller's deadline in gRPC wire format.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Largest value accepted in a `grpc-timeout` header (8 ASCII digits).
pub const GRPC_TIMEOUT_MAX_DIGITS: usize = 8;
