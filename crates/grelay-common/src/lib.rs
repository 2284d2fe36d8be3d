//! Common types shared across the grelay proxy.
//!
//! This crate provides:
//! - The opaque message container relayed by the proxy ([`frame`])
//! - The pass-through codec and its typed protobuf fallback ([`codec`])
//! - Protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod frame;
pub mod types;

pub use codec::{CodecError, ProtoCodec, RawCodec};
pub use frame::{Frame, MessageMut, MessageRef};
